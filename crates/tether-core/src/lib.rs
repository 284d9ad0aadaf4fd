//! # Tether Core
//!
//! Foundation types for conversation-scoped handler instances.
//!
//! A command-driven chat bot receives a conversation as a series of discrete
//! events (autocomplete requests, the command itself, button clicks, select
//! menus, modal submissions).  Tether routes every event of one conversation
//! to the same handler instance.  This crate holds the vocabulary shared by
//! the higher layers:
//!
//! - **Identifiers**: [`UserId`], [`ServerId`], [`MessageId`],
//!   [`ConversationKey`], [`InstanceId`]
//! - **Correlation**: [`ConversationContext`] and its task-local propagation
//! - **Policy**: [`Policy`], [`PolicyOverrides`], [`PolicyResolver`]
//! - **Handlers**: the [`ScopedHandler`] trait
//! - **Errors**: [`ScopeError`]
//!
//! The cache itself lives in `tether-framework`.

pub mod context;
pub mod error;
pub mod event;
pub mod handler;
pub mod id;
pub mod policy;

pub use context::ConversationContext;
pub use error::{ScopeError, ScopeResult};
pub use event::EventKind;
pub use handler::ScopedHandler;
pub use id::{ConversationKey, InstanceId, MessageId, ServerId, UserId};
pub use policy::{
    DEFAULT_AUTOCOMPLETE_TIMEOUT, DEFAULT_IDLE_TIMEOUT, Policy, PolicyOverrides, PolicyResolver,
    resolve_field,
};

/// Prelude for common imports.
pub mod prelude {
    pub use super::{
        ConversationContext, EventKind, InstanceId, MessageId, Policy, PolicyOverrides,
        ScopeError, ScopeResult, ScopedHandler, ServerId, UserId,
    };
}
