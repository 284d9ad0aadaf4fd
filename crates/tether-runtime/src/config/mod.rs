//! Configuration module for the Tether runtime.
//!
//! Layered loading (files, `TETHER_*` environment variables, programmatic
//! overrides) of the scoped-instance policy defaults and logging settings.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile};
pub use schema::{
    DefinitionConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, ScopeConfig,
    SpanEventConfig, TetherConfig,
};
pub use validation::validate_config;
