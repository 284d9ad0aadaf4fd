//! Lifecycle policy of scoped handler instances and its resolution.
//!
//! Every handler type has an effective [`Policy`].  It is resolved by
//! [`PolicyResolver`] from a chain of [`PolicyOverrides`] layers, most
//! specific first:
//!
//! 1. the handler type's own [`ScopedHandler::policy_overrides`], which may
//!    itself be layered on a "base" handler with [`PolicyOverrides::or`];
//! 2. the per-definition overrides registered from configuration;
//! 3. the resolver's global defaults (configuration, then built-in).
//!
//! The first layer that sets a field wins.  Resolution never fails: an
//! unusable value (a zero timeout) is logged at debug level and skipped.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::handler::ScopedHandler;

/// Default idle timeout of interaction instances.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(14 * 60);

/// Default idle timeout of instances only ever used for autocomplete.
pub const DEFAULT_AUTOCOMPLETE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The effective lifecycle policy of a handler instance.
///
/// Immutable once resolved for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Idle period after which an interaction instance is evicted.
    pub idle_timeout: Duration,
    /// Idle period after which an autocomplete-only instance is evicted.
    pub autocomplete_timeout: Duration,
    /// Promote an autocomplete instance instead of building a new one when
    /// the command itself arrives.
    pub reuse_auto_complete_instance: bool,
    /// Run [`ScopedHandler::on_destroy`] on eviction.
    pub call_destroy_on_evict: bool,
    /// Cancel and drop the instance's pending observers on eviction.
    pub remove_observers_on_evict: bool,
    /// Restart owned observer timers whenever the instance is reused.
    pub reset_observer_timers_on_reuse: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            autocomplete_timeout: DEFAULT_AUTOCOMPLETE_TIMEOUT,
            reuse_auto_complete_instance: true,
            call_destroy_on_evict: true,
            remove_observers_on_evict: true,
            reset_observer_timers_on_reuse: true,
        }
    }
}

// =============================================================================
// PolicyOverrides
// =============================================================================

/// A partial [`Policy`]: one layer of the resolution chain.
///
/// Built with `const` setters so handler types can declare their overrides
/// as constants:
///
/// ```rust,ignore
/// const BASE: PolicyOverrides = PolicyOverrides::INHERIT
///     .idle_timeout(Duration::from_secs(60));
///
/// impl ScopedHandler for Wizard {
///     fn policy_overrides() -> PolicyOverrides {
///         PolicyOverrides::INHERIT.reuse_auto_complete_instance(false).or(BASE)
///     }
/// }
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyOverrides {
    pub idle_timeout: Option<Duration>,
    pub autocomplete_timeout: Option<Duration>,
    pub reuse_auto_complete_instance: Option<bool>,
    pub call_destroy_on_evict: Option<bool>,
    pub remove_observers_on_evict: Option<bool>,
    pub reset_observer_timers_on_reuse: Option<bool>,
}

impl PolicyOverrides {
    /// A layer that sets nothing.
    pub const INHERIT: Self = Self {
        idle_timeout: None,
        autocomplete_timeout: None,
        reuse_auto_complete_instance: None,
        call_destroy_on_evict: None,
        remove_observers_on_evict: None,
        reset_observer_timers_on_reuse: None,
    };

    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub const fn autocomplete_timeout(mut self, timeout: Duration) -> Self {
        self.autocomplete_timeout = Some(timeout);
        self
    }

    pub const fn reuse_auto_complete_instance(mut self, enabled: bool) -> Self {
        self.reuse_auto_complete_instance = Some(enabled);
        self
    }

    pub const fn call_destroy_on_evict(mut self, enabled: bool) -> Self {
        self.call_destroy_on_evict = Some(enabled);
        self
    }

    pub const fn remove_observers_on_evict(mut self, enabled: bool) -> Self {
        self.remove_observers_on_evict = Some(enabled);
        self
    }

    pub const fn reset_observer_timers_on_reuse(mut self, enabled: bool) -> Self {
        self.reset_observer_timers_on_reuse = Some(enabled);
        self
    }

    /// Fills every field this layer leaves unset from `base`.
    pub const fn or(self, base: Self) -> Self {
        Self {
            idle_timeout: match self.idle_timeout {
                Some(v) => Some(v),
                None => base.idle_timeout,
            },
            autocomplete_timeout: match self.autocomplete_timeout {
                Some(v) => Some(v),
                None => base.autocomplete_timeout,
            },
            reuse_auto_complete_instance: match self.reuse_auto_complete_instance {
                Some(v) => Some(v),
                None => base.reuse_auto_complete_instance,
            },
            call_destroy_on_evict: match self.call_destroy_on_evict {
                Some(v) => Some(v),
                None => base.call_destroy_on_evict,
            },
            remove_observers_on_evict: match self.remove_observers_on_evict {
                Some(v) => Some(v),
                None => base.remove_observers_on_evict,
            },
            reset_observer_timers_on_reuse: match self.reset_observer_timers_on_reuse {
                Some(v) => Some(v),
                None => base.reset_observer_timers_on_reuse,
            },
        }
    }

    /// Returns `true` when this layer sets nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::INHERIT
    }
}

/// Returns the first value set in `layers`, or `default`.
pub fn resolve_field<T>(layers: impl IntoIterator<Item = Option<T>>, default: T) -> T {
    layers.into_iter().flatten().next().unwrap_or(default)
}

// =============================================================================
// PolicyResolver
// =============================================================================

/// Resolves the effective [`Policy`] of handler types.
#[derive(Debug, Clone, Default)]
pub struct PolicyResolver {
    defaults: Policy,
    definitions: HashMap<String, PolicyOverrides>,
}

impl PolicyResolver {
    /// Creates a resolver falling back to `defaults`.
    pub fn new(defaults: Policy) -> Self {
        Self {
            defaults,
            definitions: HashMap::new(),
        }
    }

    /// Registers overrides for one definition name (builder form).
    pub fn with_definition(
        mut self,
        definition: impl Into<String>,
        overrides: PolicyOverrides,
    ) -> Self {
        self.set_definition(definition, overrides);
        self
    }

    /// Registers overrides for one definition name.
    pub fn set_definition(&mut self, definition: impl Into<String>, overrides: PolicyOverrides) {
        self.definitions.insert(definition.into(), overrides);
    }

    pub fn defaults(&self) -> &Policy {
        &self.defaults
    }

    /// Resolves the policy of handler type `T` registered as `definition`.
    pub fn resolve<T: ScopedHandler>(&self, definition: &str) -> Policy {
        self.resolve_overrides(definition, T::policy_overrides())
    }

    /// Resolves a policy from an explicit handler-level layer.
    pub fn resolve_overrides(&self, definition: &str, handler: PolicyOverrides) -> Policy {
        let configured = self
            .definitions
            .get(definition)
            .copied()
            .unwrap_or(PolicyOverrides::INHERIT);
        let layers = [handler, configured];
        let defaults = &self.defaults;

        Policy {
            idle_timeout: resolve_timeout(
                definition,
                "idle_timeout",
                layers.iter().map(|l| l.idle_timeout),
                defaults.idle_timeout,
            ),
            autocomplete_timeout: resolve_timeout(
                definition,
                "autocomplete_timeout",
                layers.iter().map(|l| l.autocomplete_timeout),
                defaults.autocomplete_timeout,
            ),
            reuse_auto_complete_instance: resolve_field(
                layers.iter().map(|l| l.reuse_auto_complete_instance),
                defaults.reuse_auto_complete_instance,
            ),
            call_destroy_on_evict: resolve_field(
                layers.iter().map(|l| l.call_destroy_on_evict),
                defaults.call_destroy_on_evict,
            ),
            remove_observers_on_evict: resolve_field(
                layers.iter().map(|l| l.remove_observers_on_evict),
                defaults.remove_observers_on_evict,
            ),
            reset_observer_timers_on_reuse: resolve_field(
                layers.iter().map(|l| l.reset_observer_timers_on_reuse),
                defaults.reset_observer_timers_on_reuse,
            ),
        }
    }
}

fn resolve_timeout(
    definition: &str,
    field: &'static str,
    layers: impl Iterator<Item = Option<Duration>>,
    default: Duration,
) -> Duration {
    let usable = layers.map(|value| match value {
        Some(timeout) if timeout.is_zero() => {
            debug!(
                definition,
                policy_field = field,
                "Ignoring zero-length timeout override, falling back"
            );
            None
        }
        other => other,
    });
    resolve_field(usable, default)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;
    impl ScopedHandler for Plain {}

    struct Base;
    const BASE: PolicyOverrides = PolicyOverrides::INHERIT
        .idle_timeout(Duration::from_secs(60))
        .call_destroy_on_evict(false);
    impl ScopedHandler for Base {
        fn policy_overrides() -> PolicyOverrides {
            BASE
        }
    }

    struct Derived;
    impl ScopedHandler for Derived {
        fn policy_overrides() -> PolicyOverrides {
            PolicyOverrides::INHERIT
                .idle_timeout(Duration::from_secs(30))
                .or(Base::policy_overrides())
        }
    }

    #[test]
    fn test_defaults_when_nothing_overridden() {
        let resolver = PolicyResolver::default();
        assert_eq!(resolver.resolve::<Plain>("plain"), Policy::default());
    }

    #[test]
    fn test_most_derived_layer_wins() {
        let policy = PolicyResolver::default().resolve::<Derived>("derived");
        assert_eq!(policy.idle_timeout, Duration::from_secs(30));
        // inherited from the base layer
        assert!(!policy.call_destroy_on_evict);
        assert!(policy.reuse_auto_complete_instance);
    }

    #[test]
    fn test_configured_definition_layer() {
        let resolver = PolicyResolver::default().with_definition(
            "base",
            PolicyOverrides::INHERIT
                .idle_timeout(Duration::from_secs(5))
                .remove_observers_on_evict(false),
        );
        let policy = resolver.resolve::<Base>("base");
        // handler layer beats configuration
        assert_eq!(policy.idle_timeout, Duration::from_secs(60));
        assert!(!policy.remove_observers_on_evict);

        // a different definition name does not see the layer
        assert!(resolver.resolve::<Base>("other").remove_observers_on_evict);
    }

    #[test]
    fn test_zero_timeout_falls_back() {
        let resolver = PolicyResolver::default();
        let policy = resolver.resolve_overrides(
            "broken",
            PolicyOverrides::INHERIT.idle_timeout(Duration::ZERO),
        );
        assert_eq!(policy.idle_timeout, DEFAULT_IDLE_TIMEOUT);
    }

    #[test]
    fn test_resolve_field() {
        assert_eq!(resolve_field([None, Some(2), Some(3)], 1), 2);
        assert_eq!(resolve_field([None::<u8>, None], 1), 1);
    }
}
