//! # Tether
//!
//! Conversation-scoped handler instances for command-driven chat bots.
//!
//! ## Overview
//!
//! A slash-command conversation reaches the bot as a series of unrelated
//! events: autocomplete requests while the user types, the command itself,
//! then button clicks, select menus and modal submissions.  Tether keeps one
//! handler instance alive for the whole conversation and routes each event
//! back to it.
//!
//! ```text
//! ┌─────────────┐     ┌─────────────────────┐     ┌─────────────────────────┐
//! │   Runtime   │────▶│ ScopedInstanceMgr   │────▶│ instance (per user/     │
//! │ (dispatch)  │     │  idle timers        │     │  server, per definition)│
//! └─────────────┘     └─────────────────────┘     └─────────────────────────┘
//!        │                      │ evict
//!        ▼                      ▼
//! ┌─────────────┐     ┌─────────────────────┐
//! │  Observers  │◀────│ on_destroy hook     │
//! │ (components)│     └─────────────────────┘
//! └─────────────┘
//! ```
//!
//! - **Runtime**: loads configuration, sets up logging, runs every handler
//!   future inside its [`ConversationContext`](core::ConversationContext)
//! - **Manager**: creates, reuses, promotes and evicts instances
//! - **Observers**: pending component interactions whose timers follow the
//!   owning instance
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tether::prelude::*;
//!
//! #[derive(Default)]
//! struct Poll;
//!
//! #[async_trait::async_trait]
//! impl ScopedHandler for Poll {}
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = TetherRuntime::new()?;
//!     let ctx = ConversationContext::new(UserId(1), None, EventKind::Interaction);
//!     let poll = runtime
//!         .dispatch(ctx, async { runtime.manager().get("poll", || Ok(Poll)) })
//!         .await?;
//!     assert!(poll.fresh);
//!     runtime.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: TOML configuration files (default)
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log output

pub use tether_core as core;
pub use tether_framework as framework;
pub use tether_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use tether::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use tether_runtime::{RuntimeBuilder, TetherRuntime};

    // Correlation
    pub use tether_core::{
        ConversationContext, ConversationKey, EventKind, InstanceId, MessageId, ServerId, UserId,
    };

    // Handlers and their policy
    pub use tether_core::{PolicyOverrides, ScopeError, ScopeResult, ScopedHandler};

    // Cache and observers
    pub use tether_framework::{
        ObserverKey, ObserverKind, ObserverOptions, ObserverTrigger, ScopedInstance,
        ScopedInstanceManager, SelectMenu,
    };
}
