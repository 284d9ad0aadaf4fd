//! Error types for scoped instance management.

use thiserror::Error;

use crate::id::InstanceId;

/// Errors surfaced synchronously by the scoped-instance manager.
///
/// Background cleanup (destroy hooks, observer timeouts) never produces one
/// of these; failures there are logged instead.
#[derive(Debug, Error)]
pub enum ScopeError {
    /// The manager was built outside of a tokio runtime.
    #[error("no tokio runtime available to drive instance timers: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// The live instance registered under a definition is of another type.
    #[error("instance '{instance_id}' registered as '{definition}' is not a `{expected}`")]
    TypeMismatch {
        /// Definition name the instance was requested under.
        definition: String,
        /// Id of the live instance.
        instance_id: InstanceId,
        /// Type name the caller asked for.
        expected: &'static str,
    },

    /// No live instance carries the given id in this conversation.
    #[error("no live instance '{0}'")]
    UnknownInstance(InstanceId),

    /// Another live instance of the same stage already occupies the
    /// definition in this conversation.
    #[error("definition '{definition}' is already bound to instance '{occupant}'")]
    Occupied {
        definition: String,
        occupant: InstanceId,
    },

    /// The handler factory failed; the error is passed through unchanged.
    #[error(transparent)]
    Factory(anyhow::Error),
}

/// Result type for scoped instance operations.
pub type ScopeResult<T> = Result<T, ScopeError>;
