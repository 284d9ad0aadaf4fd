//! Request-scoped conversation correlation.
//!
//! A [`ConversationContext`] is built once per inbound event, before any other
//! Tether component is touched.  It can be handed to the manager explicitly,
//! or installed for the duration of a future with [`ConversationContext::scope`]
//! (a tokio task-local), in which case
//! [`ScopedInstanceManager::get`](../tether_framework/struct.ScopedInstanceManager.html)
//! picks it up implicitly.
//!
//! ```rust,ignore
//! let ctx = ConversationContext::new(user, Some(server), EventKind::Interaction)
//!     .with_instance_id(id_from_custom_id);
//!
//! ctx.scope(async move {
//!     let ticket = manager.get("ticket", || Ok(Ticket::default()))?;
//!     ticket.instance.on_button().await
//! })
//! .await?;
//! ```

use std::future::Future;

use crate::event::EventKind;
use crate::id::{ConversationKey, InstanceId, MessageId, ServerId, UserId};

tokio::task_local! {
    static CURRENT: ConversationContext;
}

/// Correlation record for one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationContext {
    user: UserId,
    server: Option<ServerId>,
    key: ConversationKey,
    kind: EventKind,
    instance_id: Option<InstanceId>,
    message_id: Option<MessageId>,
}

impl ConversationContext {
    /// Creates a context for an event sent by `user`, in `server` (or in a
    /// direct message when `None`).
    pub fn new(user: UserId, server: Option<ServerId>, kind: EventKind) -> Self {
        Self {
            user,
            server,
            key: ConversationKey::new(user, server),
            kind,
            instance_id: None,
            message_id: None,
        }
    }

    /// Attaches the instance id recovered from the event (usually parsed out
    /// of a component custom id).  Empty ids are ignored.
    pub fn with_instance_id(mut self, id: InstanceId) -> Self {
        self.instance_id = (!id.is_empty()).then_some(id);
        self
    }

    /// Attaches the id of the message the event originated from.
    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn server(&self) -> Option<ServerId> {
        self.server
    }

    pub fn conversation_key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn event_kind(&self) -> EventKind {
        self.kind
    }

    pub fn instance_id(&self) -> Option<&InstanceId> {
        self.instance_id.as_ref()
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    // ─── Task-local propagation ──────────────────────────────────────────────

    /// Runs `fut` with this context installed as the current one.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// Runs the synchronous closure `f` with this context installed.
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self, f)
    }

    /// Returns a copy of the context installed for the current task, if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Returns the event kind of the current context, or
    /// [`EventKind::Other`] when none is installed.
    pub fn current_event_kind() -> EventKind {
        CURRENT.try_with(|ctx| ctx.kind).unwrap_or(EventKind::Other)
    }
}
