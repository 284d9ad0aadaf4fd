//! Configuration schema definitions.
//!
//! ```toml
//! [scope]
//! idle_timeout_secs = 840
//! autocomplete_timeout_secs = 300
//!
//! [scope.definitions.ticket]
//! idle_timeout_secs = 120
//! reuse_auto_complete_instance = false
//!
//! [logging]
//! level = "debug"
//! format = "pretty"
//!
//! [logging.filters]
//! tether_framework = "trace"
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::{
    DEFAULT_AUTOCOMPLETE_TIMEOUT, DEFAULT_IDLE_TIMEOUT, Policy, PolicyOverrides, PolicyResolver,
};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TetherConfig {
    /// Policy defaults of scoped handler instances.
    #[serde(default)]
    pub scope: ScopeConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// =============================================================================
// Scope
// =============================================================================

/// Global policy defaults, plus overrides per definition name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Idle timeout of interaction instances, in seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Idle timeout of autocomplete-only instances, in seconds.
    #[serde(default = "default_autocomplete_timeout_secs")]
    pub autocomplete_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub reuse_auto_complete_instance: bool,

    #[serde(default = "default_true")]
    pub call_destroy_on_evict: bool,

    #[serde(default = "default_true")]
    pub remove_observers_on_evict: bool,

    #[serde(default = "default_true")]
    pub reset_observer_timers_on_reuse: bool,

    /// Overrides keyed by definition name.
    #[serde(default)]
    pub definitions: HashMap<String, DefinitionConfig>,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            autocomplete_timeout_secs: default_autocomplete_timeout_secs(),
            reuse_auto_complete_instance: true,
            call_destroy_on_evict: true,
            remove_observers_on_evict: true,
            reset_observer_timers_on_reuse: true,
            definitions: HashMap::new(),
        }
    }
}

impl ScopeConfig {
    /// The global defaults as a [`Policy`].
    pub fn default_policy(&self) -> Policy {
        Policy {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            autocomplete_timeout: Duration::from_secs(self.autocomplete_timeout_secs),
            reuse_auto_complete_instance: self.reuse_auto_complete_instance,
            call_destroy_on_evict: self.call_destroy_on_evict,
            remove_observers_on_evict: self.remove_observers_on_evict,
            reset_observer_timers_on_reuse: self.reset_observer_timers_on_reuse,
        }
    }

    /// Builds the resolver handlers' policies are resolved against.
    pub fn to_resolver(&self) -> PolicyResolver {
        self.definitions.iter().fold(
            PolicyResolver::new(self.default_policy()),
            |resolver, (name, definition)| {
                resolver.with_definition(name, definition.to_overrides())
            },
        )
    }
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_secs()
}

fn default_autocomplete_timeout_secs() -> u64 {
    DEFAULT_AUTOCOMPLETE_TIMEOUT.as_secs()
}

fn default_true() -> bool {
    true
}

/// Overrides for one definition name.  Unset fields inherit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionConfig {
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub autocomplete_timeout_secs: Option<u64>,
    #[serde(default)]
    pub reuse_auto_complete_instance: Option<bool>,
    #[serde(default)]
    pub call_destroy_on_evict: Option<bool>,
    #[serde(default)]
    pub remove_observers_on_evict: Option<bool>,
    #[serde(default)]
    pub reset_observer_timers_on_reuse: Option<bool>,
}

impl DefinitionConfig {
    pub fn to_overrides(&self) -> PolicyOverrides {
        PolicyOverrides {
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            autocomplete_timeout: self.autocomplete_timeout_secs.map(Duration::from_secs),
            reuse_auto_complete_instance: self.reuse_auto_complete_instance,
            call_destroy_on_evict: self.call_destroy_on_evict,
            remove_observers_on_evict: self.remove_observers_on_evict,
            reset_observer_timers_on_reuse: self.reset_observer_timers_on_reuse,
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Log level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature; falls back to `compact` otherwise.
    Json,
}

/// Output destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Per-target levels, e.g. `tether_framework = "trace"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,

    /// Include thread ids.
    #[serde(default)]
    pub thread_ids: bool,

    /// Include source file and line.
    #[serde(default)]
    pub file_location: bool,

    /// Log file, for `output = "file"`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    #[serde(default)]
    pub rotation: LogRotation,
}
