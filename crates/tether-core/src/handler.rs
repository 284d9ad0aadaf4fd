//! The trait implemented by conversation-scoped handler types.

use async_trait::async_trait;

use crate::policy::PolicyOverrides;

/// A handler type whose instances live for the length of a conversation.
///
/// Both items have defaults, so most handlers implement the trait with an
/// empty block.
///
/// ```rust,ignore
/// #[derive(Default)]
/// struct TicketWizard { answers: Mutex<Vec<String>> }
///
/// #[async_trait]
/// impl ScopedHandler for TicketWizard {
///     fn policy_overrides() -> PolicyOverrides {
///         PolicyOverrides::INHERIT.idle_timeout(Duration::from_secs(120))
///     }
///
///     async fn on_destroy(&self) -> anyhow::Result<()> {
///         tracing::info!("wizard abandoned");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ScopedHandler: Send + Sync + 'static {
    /// The handler type's own policy layer.  Resolved statically, once per
    /// instance, before the instance is registered.
    fn policy_overrides() -> PolicyOverrides
    where
        Self: Sized,
    {
        PolicyOverrides::INHERIT
    }

    /// Called once when the instance is evicted, unless the resolved policy
    /// disables it or the instance never left the autocomplete stage.
    ///
    /// Errors (and panics) are logged and never stop the eviction.
    async fn on_destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
