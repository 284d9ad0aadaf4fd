//! Runtime orchestration.
//!
//! [`TetherRuntime`] ties the pieces together: it loads configuration,
//! initialises logging, builds the [`ScopedInstanceManager`] from the
//! configured policy defaults and runs every handler future inside its
//! conversation context.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tether_runtime::TetherRuntime;
//!
//! let runtime = TetherRuntime::builder()
//!     .config_file("config/tether.toml")
//!     .build()?;
//!
//! // for every inbound event
//! let ctx = ConversationContext::new(user, Some(server), EventKind::Interaction);
//! runtime
//!     .dispatch(ctx, async {
//!         let ticket = runtime.manager().get("ticket", || Ok(Ticket::default()))?;
//!         ticket.handle().await
//!     })
//!     .await?;
//!
//! // until Ctrl+C, then evict everything
//! runtime.run().await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tether_core::{ConversationContext, UserId};
use tether_framework::{
    ObserverKey, ObserverKind, ObserverRegistry, ObserverTrigger, ScopeStats,
    ScopedInstanceManager,
};
use tokio::signal;
use tracing::{Instrument, debug, debug_span, info, warn};

use crate::config::{ConfigLoader, TetherConfig};
use crate::error::RuntimeResult;
use crate::logging;

/// Counters reported by [`TetherRuntime::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub scope: ScopeStats,
    pub observers: usize,
}

/// Owns the scoped-instance manager and drives handler invocations.
pub struct TetherRuntime {
    config: TetherConfig,
    manager: ScopedInstanceManager,
    running: Arc<AtomicBool>,
}

impl TetherRuntime {
    /// Creates a runtime from the configuration found in the current
    /// directory (or the defaults).
    ///
    /// Must be called inside a tokio runtime.
    pub fn new() -> RuntimeResult<Self> {
        let config = ConfigLoader::new().with_current_dir().load()?;
        Self::from_config(&config)
    }

    /// Creates a runtime builder for custom configuration.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a runtime from an already loaded configuration and
    /// initialises logging from it.
    pub fn from_config(config: &TetherConfig) -> RuntimeResult<Self> {
        logging::init_from_config(&config.logging);

        let manager = ScopedInstanceManager::new(config.scope.to_resolver())?;

        info!(
            log_level = %config.logging.level,
            log_format = ?config.logging.format,
            idle_timeout_secs = config.scope.idle_timeout_secs,
            autocomplete_timeout_secs = config.scope.autocomplete_timeout_secs,
            definitions = config.scope.definitions.len(),
            "Runtime initialized from configuration"
        );

        Ok(Self {
            config: config.clone(),
            manager,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    pub fn manager(&self) -> &ScopedInstanceManager {
        &self.manager
    }

    pub fn observers(&self) -> &ObserverRegistry {
        self.manager.observers()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            scope: self.manager.stats(),
            observers: self.manager.observers().len(),
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Runs `handler` with `context` installed, inside a `dispatch` span.
    ///
    /// [`ScopedInstanceManager::get`] calls made by the handler pick the
    /// context up implicitly.
    pub async fn dispatch<F>(&self, context: ConversationContext, handler: F) -> F::Output
    where
        F: Future,
    {
        let span = debug_span!(
            "dispatch",
            conversation = %context.conversation_key(),
            kind = %context.event_kind(),
            instance_id = context.instance_id().map(|id| id.as_str()).unwrap_or(""),
        );
        context.scope(handler).instrument(span).await
    }

    /// Routes a component interaction through the observer registry.
    ///
    /// Returns `context` carrying the owning instance id when an observer
    /// accepted the interaction, `None` when there was none or `user` is not
    /// allowed to use it.
    pub fn correlate(
        &self,
        kind: ObserverKind,
        key: ObserverKey,
        user: UserId,
        context: ConversationContext,
    ) -> Option<ConversationContext> {
        match self.observers().trigger(kind, key, user) {
            ObserverTrigger::Fired { owner } => Some(context.with_instance_id(owner)),
            ObserverTrigger::Forbidden => {
                debug!(kind = ?kind, key = %key, user = %user, "Interaction rejected by observer");
                None
            }
            ObserverTrigger::Missing => {
                debug!(
                    kind = ?kind,
                    key = %key,
                    "No observer for interaction, it probably expired"
                );
                None
            }
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Marks the runtime as running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Runtime is already running");
            return;
        }
        info!("Tether runtime started");
    }

    /// Evicts every live instance (running destroy hooks per policy) and
    /// cancels all observers.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Runtime is not running");
            return;
        }

        info!("Stopping Tether runtime");
        let evicted = self.manager.shutdown().await;
        self.manager.observers().clear();
        info!(evicted, "Runtime stopped");
    }

    /// Runs until a shutdown signal is received.
    pub async fn run(&self) {
        self.start();
        info!("Tether runtime is now running. Press Ctrl+C to stop.");
        wait_for_shutdown().await;
        self.stop().await;
    }

    /// Runs until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.start();
        shutdown.await;
        self.stop().await;
    }
}

/// Waits for shutdown signals (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down");
                    }
                }
                return;
            }
            Err(e) => warn!(
                error = %e,
                "Failed to register SIGTERM handler, waiting for Ctrl+C only"
            ),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for creating a [`TetherRuntime`] with custom configuration.
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g., "development", "production").
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    /// Enables loading environment variables (the default).
    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    /// Disables loading environment variables.
    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges additional configuration programmatically.
    pub fn merge(mut self, config: TetherConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Loads the configuration and builds the runtime.
    pub fn build(self) -> RuntimeResult<TetherRuntime> {
        let config = self.config_loader.load()?;
        TetherRuntime::from_config(&config)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
