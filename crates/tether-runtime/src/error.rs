//! Runtime error types.

use tether_core::ScopeError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while setting up or running the runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The scoped-instance manager could not be created.
    #[error("Scope error: {0}")]
    Scope(#[from] ScopeError),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
