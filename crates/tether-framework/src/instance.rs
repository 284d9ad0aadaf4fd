//! Type-erased handler instances and the value handed back by `get`.

use std::any::{Any, type_name};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tether_core::{EventKind, InstanceId, ScopedHandler};

/// A live handler instance with its concrete type erased.
///
/// The same allocation is kept twice: once as a trait object for the destroy
/// hook, once as `Any` so callers can get their `Arc<T>` back.
#[derive(Clone)]
pub(crate) struct ErasedInstance {
    handler: Arc<dyn ScopedHandler>,
    any: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl ErasedInstance {
    pub(crate) fn new<T: ScopedHandler>(instance: Arc<T>) -> Self {
        Self {
            handler: instance.clone(),
            any: instance,
            type_name: type_name::<T>(),
        }
    }

    pub(crate) fn downcast<T: ScopedHandler>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.any).downcast::<T>().ok()
    }

    pub(crate) fn handler(&self) -> &dyn ScopedHandler {
        self.handler.as_ref()
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for ErasedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedInstance")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// ScopedInstance
// =============================================================================

/// The result of [`ScopedInstanceManager::get`](crate::ScopedInstanceManager::get).
///
/// Dereferences to the handler.
pub struct ScopedInstance<T> {
    /// The handler instance.
    pub instance: Arc<T>,
    /// Its id; empty for stateless instances.
    pub instance_id: InstanceId,
    /// `true` when the handler's entry point has not run yet: the instance
    /// was just built, or promoted from an autocomplete request.
    pub fresh: bool,
    /// The kind of the record after this call.
    pub event_kind: EventKind,
}

impl<T> ScopedInstance<T> {
    /// Returns `true` for instances built without a conversation context.
    pub fn is_stateless(&self) -> bool {
        self.instance_id.is_empty()
    }
}

impl<T> fmt::Debug for ScopedInstance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedInstance")
            .field("instance_id", &self.instance_id)
            .field("fresh", &self.fresh)
            .field("event_kind", &self.event_kind)
            .finish_non_exhaustive()
    }
}

impl<T> Clone for ScopedInstance<T> {
    fn clone(&self) -> Self {
        Self {
            instance: Arc::clone(&self.instance),
            instance_id: self.instance_id.clone(),
            fresh: self.fresh,
            event_kind: self.event_kind,
        }
    }
}

impl<T> Deref for ScopedInstance<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.instance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deliberately not `Debug`.
    struct Opaque;

    impl ScopedHandler for Opaque {}

    #[test]
    fn test_debug_does_not_require_handler_debug() {
        let scoped = ScopedInstance {
            instance: Arc::new(Opaque),
            instance_id: InstanceId::from_raw("abc"),
            fresh: true,
            event_kind: EventKind::Interaction,
        };
        let printed = format!("{scoped:?}");
        assert!(printed.contains("InstanceId(\"abc\")"));
        assert!(printed.contains("fresh: true"));

        let erased = ErasedInstance::new(Arc::clone(&scoped.instance));
        assert!(erased.downcast::<Opaque>().is_some());
        assert!(format!("{erased:?}").contains("Opaque"));
    }
}
