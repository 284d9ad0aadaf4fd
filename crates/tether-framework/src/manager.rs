//! Conversation-scoped handler instances.
//!
//! [`ScopedInstanceManager`] is the cache every inbound event goes through.
//! For a definition name and the current [`ConversationContext`] it either
//! hands back the live instance of that conversation or builds a new one
//! with the caller's factory, and keeps each live instance on an idle timer:
//!
//! - an **autocomplete** request gets a short-lived instance of its own, which
//!   is promoted in place when the command itself arrives, replacing any
//!   older interaction instance of the conversation (or abandoned, if the
//!   handler's policy disables reuse);
//! - every reuse re-arms the instance's timer and, by default, the timers of
//!   the UI observers it owns;
//! - when the timer fires uncancelled the instance is evicted: its observers
//!   are released and its [`ScopedHandler::on_destroy`] hook runs.
//!
//! Without a context, `get` degrades to a plain factory call: the instance
//! is stateless and never registered.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ScopedInstanceManager::new(PolicyResolver::default())?;
//!
//! ConversationContext::new(user, Some(server), EventKind::Interaction)
//!     .scope(async {
//!         let wizard = manager.get("ticket", || Ok(TicketWizard::default()))?;
//!         if wizard.fresh {
//!             wizard.start().await?;
//!         }
//!         Ok::<_, anyhow::Error>(())
//!     })
//!     .await?;
//! ```

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future;
use parking_lot::Mutex;
use tether_core::{
    ConversationContext, ConversationKey, EventKind, InstanceId, MessageId, PolicyResolver,
    ScopeError, ScopeResult, ScopedHandler,
};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use crate::hook::run_hook;
use crate::instance::{ErasedInstance, ScopedInstance};
use crate::observer::{ObserverKey, ObserverKind, ObserverOptions, ObserverRegistry};
use crate::store::{
    BucketKey, EvictedInstance, InstanceInfo, InstanceRecord, InstanceStore, ScopeStats,
    timeout_for,
};
use crate::timer::{Generation, TimerSlot};

/// Why an instance left the store.
#[derive(Debug, Clone, Copy)]
enum EvictReason {
    IdleTimeout,
    Removed,
    Superseded,
    Shutdown,
}

impl EvictReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::IdleTimeout => "idle_timeout",
            Self::Removed => "removed",
            Self::Superseded => "superseded",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A live instance picked for the current event.
struct Found<T> {
    instance: Arc<T>,
    id: InstanceId,
    kind: EventKind,
    fresh: bool,
    reset_observers: bool,
    /// Interaction instance replaced by a promoted autocomplete instance.
    superseded: Option<EvictedInstance>,
    /// Non-reusable autocomplete instance dropped next to a reused one.
    abandoned: Option<EvictedInstance>,
}

enum Resolution<T> {
    Found(Found<T>),
    /// Nothing reusable.  Carries the autocomplete instance that had to be
    /// abandoned to make room, if any.
    Vacant(Option<EvictedInstance>),
}

// =============================================================================
// ScopedInstanceManager
// =============================================================================

/// Cache of conversation-scoped handler instances.  Cheap to clone.
///
/// Dropping the last clone cancels every pending eviction timer without
/// running destroy hooks; call [`shutdown`](Self::shutdown) first for an
/// orderly teardown.
#[derive(Clone)]
pub struct ScopedInstanceManager {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    store: Mutex<InstanceStore>,
    observers: ObserverRegistry,
    resolver: PolicyResolver,
    runtime: Handle,
}

impl ScopedInstanceManager {
    /// Creates a manager whose timers run on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NoRuntime`] when called outside a runtime.
    pub fn new(resolver: PolicyResolver) -> ScopeResult<Self> {
        let runtime = Handle::try_current()?;
        Ok(Self::with_handle(resolver, runtime))
    }

    /// Creates a manager whose timers run on `runtime`.
    pub fn with_handle(resolver: PolicyResolver, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                store: Mutex::new(InstanceStore::default()),
                observers: ObserverRegistry::new(runtime.clone()),
                resolver,
                runtime,
            }),
        }
    }

    /// The observer registry whose entries follow this manager's instances.
    pub fn observers(&self) -> &ObserverRegistry {
        &self.inner.observers
    }

    pub fn resolver(&self) -> &PolicyResolver {
        &self.inner.resolver
    }

    /// Returns the instance of `definition` for the conversation installed
    /// with [`ConversationContext::scope`], building it with `factory` when
    /// there is none to reuse.
    ///
    /// # Errors
    ///
    /// - [`ScopeError::Factory`] when `factory` fails; nothing is registered.
    /// - [`ScopeError::TypeMismatch`] when the live instance registered under
    ///   `definition` is not a `T`.
    pub fn get<T, F>(&self, definition: &str, factory: F) -> ScopeResult<ScopedInstance<T>>
    where
        T: ScopedHandler,
        F: FnOnce() -> anyhow::Result<T>,
    {
        let context = ConversationContext::current();
        self.get_in(context.as_ref(), definition, factory)
    }

    /// Like [`get`](Self::get), with an explicit context (`None` for the
    /// stateless path).
    pub fn get_in<T, F>(
        &self,
        context: Option<&ConversationContext>,
        definition: &str,
        factory: F,
    ) -> ScopeResult<ScopedInstance<T>>
    where
        T: ScopedHandler,
        F: FnOnce() -> anyhow::Result<T>,
    {
        let Some(ctx) = context else {
            let instance = factory().map_err(ScopeError::Factory)?;
            trace!(definition, "No conversation context, handing out a stateless instance");
            return Ok(ScopedInstance {
                instance: Arc::new(instance),
                instance_id: InstanceId::empty(),
                fresh: true,
                event_kind: EventKind::Other,
            });
        };
        let bucket = BucketKey::new(definition, ctx.conversation_key());

        let first = {
            let mut store = self.inner.store.lock();
            self.inner.resolve_locked::<T>(&mut store, &bucket, ctx)?
        };
        match first {
            Resolution::Found(found) => return Ok(self.inner.finish(found)),
            Resolution::Vacant(Some(abandoned)) => self.inner.release_abandoned(abandoned),
            Resolution::Vacant(None) => {}
        }

        // User code runs unlocked; a concurrent caller may get here too.
        let instance = Arc::new(factory().map_err(ScopeError::Factory)?);
        let policy = self.inner.resolver.resolve::<T>(definition);
        let kind = if ctx.event_kind().is_auto_complete() {
            EventKind::AutoComplete
        } else {
            EventKind::Interaction
        };

        let (found, abandoned) = {
            let mut store = self.inner.store.lock();
            match self.inner.resolve_locked::<T>(&mut store, &bucket, ctx)? {
                Resolution::Found(found) => {
                    trace!(
                        definition,
                        instance_id = %found.id,
                        "Another caller registered the instance first, discarding ours"
                    );
                    (found, None)
                }
                Resolution::Vacant(abandoned) => {
                    let id = InstanceId::generate();
                    let timer = self.inner.arm(id.clone(), timeout_for(&policy, kind));
                    store.insert(
                        InstanceRecord {
                            definition: Arc::clone(&bucket.definition),
                            conversation: bucket.conversation.clone(),
                            id: id.clone(),
                            event_kind: kind,
                            instance: ErasedInstance::new(Arc::clone(&instance)),
                            message_id: ctx.message_id(),
                            created_at: SystemTime::now(),
                            policy,
                        },
                        timer,
                    );
                    debug!(
                        definition,
                        conversation = %bucket.conversation,
                        instance_id = %id,
                        kind = %kind,
                        "Created scoped instance"
                    );
                    let found = Found {
                        instance,
                        id,
                        kind,
                        fresh: true,
                        reset_observers: false,
                        superseded: None,
                        abandoned: None,
                    };
                    (found, abandoned)
                }
            }
        };
        if let Some(abandoned) = abandoned {
            self.inner.release_abandoned(abandoned);
        }
        Ok(self.inner.finish(found))
    }

    /// Evicts an instance right away: observers are released and the destroy
    /// hook runs as on an idle timeout.  Returns `false` if it was not live.
    pub async fn remove_by_instance_id(&self, id: &InstanceId) -> bool {
        let claimed = self.inner.store.lock().claim(id);
        match claimed {
            Some(evicted) => {
                self.inner.release(evicted, EvictReason::Removed).await;
                true
            }
            None => {
                trace!(instance_id = %id, "Instance already gone, nothing to remove");
                false
            }
        }
    }

    /// Associates the message carrying the instance's components with it, so
    /// that events from that message find it again.  Returns `false` if the
    /// instance is not live.
    pub fn set_message_id_for_instance(&self, id: &InstanceId, message: MessageId) -> bool {
        self.inner.store.lock().set_message_id(id, message)
    }

    /// Registers an observer owned by the live instance `owner`.
    ///
    /// Unlike registering on [`observers`](Self::observers) directly, the
    /// entry never outlives its owner: if `owner` is evicted concurrently the
    /// observer is dropped again and `false` is returned.
    pub fn register_observer<F, Fut>(
        &self,
        kind: ObserverKind,
        key: ObserverKey,
        owner: InstanceId,
        duration: Duration,
        on_timeout: F,
        options: ObserverOptions,
    ) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let observers = &self.inner.observers;
        observers.register(kind, key, owner.clone(), duration, on_timeout, options);
        // eviction claims before it releases observers, so one of the two
        // removals sees the entry
        if self.contains_instance(&owner) {
            return true;
        }
        observers.remove_by_owner(&owner);
        debug!(owner = %owner, key = %key, "Observer owner is gone, dropped the observer");
        false
    }

    /// Registers the live instance `id` of `context`'s conversation under an
    /// additional definition name.  Both names then resolve to the same
    /// instance, timer and observers.
    ///
    /// # Errors
    ///
    /// - [`ScopeError::UnknownInstance`] when `id` is not live in this
    ///   conversation.
    /// - [`ScopeError::Occupied`] when another instance of the same stage is
    ///   already registered under `definition`.
    pub fn link_definition(
        &self,
        context: &ConversationContext,
        definition: &str,
        id: &InstanceId,
    ) -> ScopeResult<()> {
        let bucket = BucketKey::new(definition, context.conversation_key());
        let mut store = self.inner.store.lock();

        let mut record = match store.any_record(id) {
            Some(record) if &record.conversation == context.conversation_key() => record.clone(),
            _ => return Err(ScopeError::UnknownInstance(id.clone())),
        };
        if store.record(&bucket, id).is_some() {
            return Ok(());
        }
        if let Some(occupant) = store.find_by_kind(&bucket, record.event_kind) {
            return Err(ScopeError::Occupied {
                definition: definition.to_string(),
                occupant: occupant.id.clone(),
            });
        }

        record.definition = Arc::clone(&bucket.definition);
        store.link(record);
        debug!(definition, instance_id = %id, "Linked instance under another definition");
        Ok(())
    }

    // ─── Inspection ──────────────────────────────────────────────────────────

    /// Snapshots of the instances registered under `definition` for
    /// `conversation` (at most one per stage).
    pub fn lookup(&self, definition: &str, conversation: &ConversationKey) -> Vec<InstanceInfo> {
        self.inner
            .store
            .lock()
            .lookup(&BucketKey::new(definition, conversation))
    }

    pub fn describe(&self, id: &InstanceId) -> Option<InstanceInfo> {
        self.inner.store.lock().describe(id)
    }

    pub fn contains_instance(&self, id: &InstanceId) -> bool {
        self.inner.store.lock().contains(id)
    }

    /// Returns `true` if the instance is live and its eviction timer pending.
    pub fn has_armed_timer(&self, id: &InstanceId) -> bool {
        self.inner.store.lock().has_armed_timer(id)
    }

    pub fn stats(&self) -> ScopeStats {
        self.inner.store.lock().stats()
    }

    /// Evicts every live instance, running destroy hooks per policy.
    /// Returns the number evicted.
    pub async fn shutdown(&self) -> usize {
        let drained = self.inner.store.lock().drain();
        let count = drained.len();
        future::join_all(
            drained
                .into_iter()
                .map(|evicted| self.inner.release(evicted, EvictReason::Shutdown)),
        )
        .await;
        info!(count, "Scoped instances shut down");
        count
    }
}

impl fmt::Debug for ScopedInstanceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedInstanceManager")
            .field("stats", &self.stats())
            .field("observers", &self.inner.observers.len())
            .finish()
    }
}

// =============================================================================
// ScopeInner
// =============================================================================

impl ScopeInner {
    /// Picks the live instance the event belongs to, re-arming or promoting
    /// it.  Never calls user code.
    fn resolve_locked<T: ScopedHandler>(
        self: &Arc<Self>,
        store: &mut InstanceStore,
        bucket: &BucketKey,
        ctx: &ConversationContext,
    ) -> ScopeResult<Resolution<T>> {
        let correlated = ctx
            .instance_id()
            .and_then(|id| store.record(bucket, id))
            .or_else(|| {
                ctx.message_id()
                    .and_then(|message| store.find_by_message(bucket, message))
            })
            .map(|record| record.id.clone());
        if let Some(id) = correlated {
            return self.reuse_locked(store, bucket, &id, ctx).map(Resolution::Found);
        }

        if ctx.event_kind().is_auto_complete() {
            return match store.find_by_kind(bucket, EventKind::AutoComplete) {
                Some(record) => {
                    let id = record.id.clone();
                    self.reuse_locked(store, bucket, &id, ctx).map(Resolution::Found)
                }
                None => Ok(Resolution::Vacant(None)),
            };
        }

        let current = store
            .find_by_kind(bucket, EventKind::Interaction)
            .map(|record| record.id.clone());
        let pending = store
            .find_by_kind(bucket, EventKind::AutoComplete)
            .map(|record| (record.id.clone(), record.policy.reuse_auto_complete_instance));
        let Some((pending_id, reusable)) = pending else {
            return match current {
                Some(id) => self.reuse_locked(store, bucket, &id, ctx).map(Resolution::Found),
                None => Ok(Resolution::Vacant(None)),
            };
        };

        // A pending autocomplete instance is always the newer of the two.
        if reusable {
            let mut found = self.promote_locked(store, bucket, &pending_id, ctx)?;
            found.superseded = current.and_then(|id| store.claim(&id));
            return Ok(Resolution::Found(found));
        }

        debug!(
            definition = %bucket.definition,
            instance_id = %pending_id,
            "Autocomplete instance is not reusable, abandoning it"
        );
        match current {
            Some(id) => {
                let mut found = self.reuse_locked(store, bucket, &id, ctx)?;
                found.abandoned = store.claim(&pending_id);
                Ok(Resolution::Found(found))
            }
            None => Ok(Resolution::Vacant(store.claim(&pending_id))),
        }
    }

    fn reuse_locked<T: ScopedHandler>(
        self: &Arc<Self>,
        store: &mut InstanceStore,
        bucket: &BucketKey,
        id: &InstanceId,
        ctx: &ConversationContext,
    ) -> ScopeResult<Found<T>> {
        let record = store
            .record(bucket, id)
            .ok_or_else(|| ScopeError::UnknownInstance(id.clone()))?;
        let instance = typed::<T>(record)?;
        let kind = record.event_kind;
        let timeout = record.timeout();
        let reset_observers = record.policy.reset_observer_timers_on_reuse;

        store.rearm(id, self.arm(id.clone(), timeout));
        if let Some(message) = ctx.message_id() {
            store.set_message_id_in(bucket, id, message);
        }
        trace!(
            definition = %bucket.definition,
            instance_id = %id,
            kind = %kind,
            "Reusing scoped instance"
        );

        Ok(Found {
            instance,
            id: id.clone(),
            kind,
            fresh: false,
            reset_observers,
            superseded: None,
            abandoned: None,
        })
    }

    fn promote_locked<T: ScopedHandler>(
        self: &Arc<Self>,
        store: &mut InstanceStore,
        bucket: &BucketKey,
        id: &InstanceId,
        ctx: &ConversationContext,
    ) -> ScopeResult<Found<T>> {
        let record = store
            .record(bucket, id)
            .ok_or_else(|| ScopeError::UnknownInstance(id.clone()))?;
        let instance = typed::<T>(record)?;
        let policy = record.policy;

        store.promote(id);
        store.rearm(id, self.arm(id.clone(), policy.idle_timeout));
        if let Some(message) = ctx.message_id() {
            store.set_message_id_in(bucket, id, message);
        }
        debug!(
            definition = %bucket.definition,
            instance_id = %id,
            "Promoted autocomplete instance to interaction"
        );

        Ok(Found {
            instance,
            id: id.clone(),
            kind: EventKind::Interaction,
            fresh: true,
            reset_observers: policy.reset_observer_timers_on_reuse,
            superseded: None,
            abandoned: None,
        })
    }

    /// Post-lock half of `get`.
    fn finish<T>(self: &Arc<Self>, found: Found<T>) -> ScopedInstance<T> {
        if let Some(abandoned) = found.abandoned {
            self.release_abandoned(abandoned);
        }
        if let Some(superseded) = found.superseded {
            let inner = Arc::clone(self);
            self.runtime.spawn(async move {
                inner.release(superseded, EvictReason::Superseded).await;
            });
        }
        if found.reset_observers {
            self.observers.reset_timers_for_instance(&found.id);
        }
        ScopedInstance {
            instance: found.instance,
            instance_id: found.id,
            fresh: found.fresh,
            event_kind: found.kind,
        }
    }

    fn arm(self: &Arc<Self>, id: InstanceId, after: Duration) -> TimerSlot {
        let inner = Arc::downgrade(self);
        TimerSlot::spawn(&self.runtime, after, move |generation| async move {
            if let Some(inner) = inner.upgrade() {
                inner.expire(id, generation).await;
            }
        })
    }

    async fn expire(&self, id: InstanceId, generation: Generation) {
        let claimed = self.store.lock().claim_expired(&id, generation);
        match claimed {
            Some(evicted) => self.release(evicted, EvictReason::IdleTimeout).await,
            None => trace!(instance_id = %id, "Stale eviction timer, ignoring"),
        }
    }

    /// Finishes an eviction claimed under the lock.
    async fn release(&self, evicted: EvictedInstance, reason: EvictReason) {
        let observers = if evicted.releases_observers() {
            self.observers.remove_by_owner(&evicted.id)
        } else {
            0
        };
        info!(
            instance_id = %evicted.id,
            definitions = ?evicted.definitions,
            kind = %evicted.event_kind,
            reason = reason.as_str(),
            observers,
            "Evicted scoped instance"
        );

        if !evicted.runs_destroy_hook() {
            return;
        }
        if let Err(failure) = run_hook(evicted.instance.handler().on_destroy()).await {
            warn!(
                instance_id = %evicted.id,
                handler = evicted.instance.type_name(),
                error = %failure,
                "Destroy hook failed"
            );
        }
    }

    /// Releases an autocomplete instance dropped in favour of a new one.
    /// Its destroy hook never runs.
    fn release_abandoned(&self, evicted: EvictedInstance) {
        let observers = if evicted.releases_observers() {
            self.observers.remove_by_owner(&evicted.id)
        } else {
            0
        };
        debug!(instance_id = %evicted.id, observers, "Abandoned autocomplete instance");
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        self.store.get_mut().cancel_all_timers();
    }
}

fn typed<T: ScopedHandler>(record: &InstanceRecord) -> ScopeResult<Arc<T>> {
    record
        .instance
        .downcast::<T>()
        .ok_or_else(|| ScopeError::TypeMismatch {
            definition: record.definition.to_string(),
            instance_id: record.id.clone(),
            expected: type_name::<T>(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tether_core::{PolicyOverrides, ServerId, UserId};

    const IDLE: Duration = Duration::from_secs(60);
    const TYPING: Duration = Duration::from_secs(10);

    #[derive(Clone, Default)]
    struct Tally {
        built: Arc<AtomicUsize>,
        destroyed: Arc<AtomicUsize>,
        seen: Arc<Mutex<HashSet<usize>>>,
        duplicates: Arc<AtomicUsize>,
    }

    impl Tally {
        fn built(&self) -> usize {
            self.built.load(Ordering::SeqCst)
        }

        fn destroyed(&self) -> usize {
            self.destroyed.load(Ordering::SeqCst)
        }

        fn next_serial(&self) -> usize {
            self.built.fetch_add(1, Ordering::SeqCst)
        }

        fn record_destroy(&self, serial: usize) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            if !self.seen.lock().insert(serial) {
                self.duplicates.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    struct Ticket {
        serial: usize,
        tally: Tally,
    }

    #[async_trait]
    impl ScopedHandler for Ticket {
        fn policy_overrides() -> PolicyOverrides {
            PolicyOverrides::INHERIT
                .idle_timeout(IDLE)
                .autocomplete_timeout(TYPING)
        }

        async fn on_destroy(&self) -> anyhow::Result<()> {
            self.tally.record_destroy(self.serial);
            Ok(())
        }
    }

    /// A ticket whose autocomplete instance is never promoted.
    struct OneShot {
        serial: usize,
        tally: Tally,
    }

    #[async_trait]
    impl ScopedHandler for OneShot {
        fn policy_overrides() -> PolicyOverrides {
            PolicyOverrides::INHERIT
                .reuse_auto_complete_instance(false)
                .or(Ticket::policy_overrides())
        }

        async fn on_destroy(&self) -> anyhow::Result<()> {
            self.tally.record_destroy(self.serial);
            Ok(())
        }
    }

    struct Flicker {
        serial: usize,
        tally: Tally,
    }

    #[async_trait]
    impl ScopedHandler for Flicker {
        fn policy_overrides() -> PolicyOverrides {
            PolicyOverrides::INHERIT.idle_timeout(Duration::from_millis(2))
        }

        async fn on_destroy(&self) -> anyhow::Result<()> {
            self.tally.record_destroy(self.serial);
            Ok(())
        }
    }

    /// Never goes idle in practice.
    struct Resident;

    impl ScopedHandler for Resident {
        fn policy_overrides() -> PolicyOverrides {
            PolicyOverrides::INHERIT.idle_timeout(Duration::MAX)
        }
    }

    fn ticket(tally: &Tally) -> impl FnOnce() -> anyhow::Result<Ticket> + use<> {
        let tally = tally.clone();
        move || {
            let serial = tally.next_serial();
            Ok(Ticket { serial, tally })
        }
    }

    fn one_shot(tally: &Tally) -> impl FnOnce() -> anyhow::Result<OneShot> + use<> {
        let tally = tally.clone();
        move || {
            let serial = tally.next_serial();
            Ok(OneShot { serial, tally })
        }
    }

    fn flicker(tally: &Tally) -> impl FnOnce() -> anyhow::Result<Flicker> + use<> {
        let tally = tally.clone();
        move || {
            let serial = tally.next_serial();
            Ok(Flicker { serial, tally })
        }
    }

    fn ctx(kind: EventKind) -> ConversationContext {
        ConversationContext::new(UserId(1), Some(ServerId(2)), kind)
    }

    fn manager() -> ScopedInstanceManager {
        ScopedInstanceManager::new(PolicyResolver::default()).unwrap()
    }

    async fn noop() -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn test_requires_runtime() {
        let err = ScopedInstanceManager::new(PolicyResolver::default()).unwrap_err();
        assert!(matches!(err, ScopeError::NoRuntime(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_instance_per_conversation() {
        let manager = manager();
        let tally = Tally::default();
        let interaction = ctx(EventKind::Interaction);

        let first = manager.get_in(Some(&interaction), "ticket", ticket(&tally)).unwrap();
        assert!(first.fresh);
        assert_eq!(first.event_kind, EventKind::Interaction);

        let second = manager.get_in(Some(&interaction), "ticket", ticket(&tally)).unwrap();
        assert!(!second.fresh);
        assert_eq!(second.instance_id, first.instance_id);

        let by_id = interaction.clone().with_instance_id(first.instance_id.clone());
        let third = manager.get_in(Some(&by_id), "ticket", ticket(&tally)).unwrap();
        assert_eq!(third.instance_id, first.instance_id);
        assert!(Arc::ptr_eq(&third.instance, &first.instance));

        assert_eq!(tally.built(), 1);
        assert_eq!(manager.stats().instances, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_reads_task_local_context() {
        let manager = manager();
        let tally = Tally::default();

        let scoped = ctx(EventKind::Interaction)
            .scope(async { manager.get("ticket", ticket(&tally)) })
            .await
            .unwrap();
        assert!(!scoped.is_stateless());
        assert!(manager.contains_instance(&scoped.instance_id));
        assert!(manager.has_armed_timer(&scoped.instance_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_autocomplete_converges() {
        let manager = manager();
        let tally = Tally::default();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                let tally = tally.clone();
                tokio::spawn(async move {
                    let typing = ctx(EventKind::AutoComplete);
                    manager
                        .get_in(Some(&typing), "ticket", ticket(&tally))
                        .unwrap()
                        .instance_id
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap());
        }
        assert_eq!(ids.len(), 1);
        let stats = manager.stats();
        assert_eq!(stats.instances, 1);
        assert_eq!(stats.autocomplete, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autocomplete_promotion_keeps_identity() {
        let manager = manager();
        let tally = Tally::default();

        let typing = manager
            .get_in(Some(&ctx(EventKind::AutoComplete)), "ticket", ticket(&tally))
            .unwrap();
        assert!(typing.fresh);
        assert_eq!(typing.event_kind, EventKind::AutoComplete);

        let again = manager
            .get_in(Some(&ctx(EventKind::AutoComplete)), "ticket", ticket(&tally))
            .unwrap();
        assert!(!again.fresh);
        assert_eq!(again.instance_id, typing.instance_id);

        let command = manager
            .get_in(Some(&ctx(EventKind::Interaction)), "ticket", ticket(&tally))
            .unwrap();
        assert!(command.fresh);
        assert_eq!(command.event_kind, EventKind::Interaction);
        assert_eq!(command.instance_id, typing.instance_id);
        assert_eq!(tally.built(), 1);

        // now on the interaction timeout
        tokio::time::sleep(TYPING * 2).await;
        assert!(manager.contains_instance(&command.instance_id));

        tokio::time::sleep(IDLE).await;
        assert!(!manager.contains_instance(&command.instance_id));
        assert_eq!(tally.destroyed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_reusable_autocomplete_is_abandoned() {
        let manager = manager();
        let tally = Tally::default();

        let typing = manager
            .get_in(Some(&ctx(EventKind::AutoComplete)), "ticket", one_shot(&tally))
            .unwrap();
        manager.observers().register_button_observer(
            MessageId(3),
            typing.instance_id.clone(),
            IDLE * 10,
            noop,
            ObserverOptions::default(),
        );

        let command = manager
            .get_in(Some(&ctx(EventKind::Interaction)), "ticket", one_shot(&tally))
            .unwrap();
        assert!(command.fresh);
        assert_ne!(command.instance_id, typing.instance_id);
        assert!(!manager.contains_instance(&typing.instance_id));
        assert!(manager.observers().is_empty());
        assert_eq!(tally.built(), 2);

        tokio::time::sleep(IDLE * 2).await;
        // only the interaction instance saw its hook
        assert_eq!(tally.destroyed(), 1);
        assert!(tally.seen.lock().contains(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_after_new_autocomplete_promotes_it() {
        let manager = manager();
        let tally = Tally::default();

        let first = manager
            .get_in(Some(&ctx(EventKind::Interaction)), "ticket", ticket(&tally))
            .unwrap();
        manager.observers().register_button_observer(
            MessageId(5),
            first.instance_id.clone(),
            IDLE * 10,
            noop,
            ObserverOptions::default(),
        );

        // the user starts typing the command again
        let typing = manager
            .get_in(Some(&ctx(EventKind::AutoComplete)), "ticket", ticket(&tally))
            .unwrap();
        assert!(typing.fresh);
        assert_ne!(typing.instance_id, first.instance_id);

        let command = manager
            .get_in(Some(&ctx(EventKind::Interaction)), "ticket", ticket(&tally))
            .unwrap();
        assert!(command.fresh);
        assert_eq!(command.event_kind, EventKind::Interaction);
        assert_eq!(command.instance_id, typing.instance_id);
        assert_eq!(tally.built(), 2);

        let stats = manager.stats();
        assert_eq!(stats.instances, 1);
        assert_eq!(stats.autocomplete, 0);
        assert!(!manager.contains_instance(&first.instance_id));
        assert!(manager.observers().owned_by(&first.instance_id).is_empty());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(tally.destroyed(), 1);
        assert!(tally.seen.lock().contains(&0));

        let again = manager
            .get_in(Some(&ctx(EventKind::Interaction)), "ticket", ticket(&tally))
            .unwrap();
        assert!(!again.fresh);
        assert_eq!(again.instance_id, typing.instance_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_reusable_autocomplete_leaves_live_interaction() {
        let manager = manager();
        let tally = Tally::default();

        let first = manager
            .get_in(Some(&ctx(EventKind::Interaction)), "ticket", one_shot(&tally))
            .unwrap();
        let typing = manager
            .get_in(Some(&ctx(EventKind::AutoComplete)), "ticket", one_shot(&tally))
            .unwrap();

        let command = manager
            .get_in(Some(&ctx(EventKind::Interaction)), "ticket", one_shot(&tally))
            .unwrap();
        assert!(!command.fresh);
        assert_eq!(command.instance_id, first.instance_id);
        assert!(!manager.contains_instance(&typing.instance_id));
        assert_eq!(manager.stats().autocomplete, 0);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(tally.destroyed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_runs_destroy_once_and_clears_observers() {
        let manager = manager();
        let tally = Tally::default();

        let scoped = manager
            .get_in(Some(&ctx(EventKind::Interaction)), "ticket", ticket(&tally))
            .unwrap();
        let key = ObserverKey::Message(MessageId(8));
        manager.observers().register_button_observer(
            MessageId(8),
            scoped.instance_id.clone(),
            IDLE * 10,
            noop,
            ObserverOptions::default(),
        );

        tokio::time::sleep(IDLE + Duration::from_secs(1)).await;
        assert_eq!(tally.destroyed(), 1);
        assert!(!manager.contains_instance(&scoped.instance_id));
        assert!(!manager.observers().contains(ObserverKind::Button, key));

        tokio::time::sleep(IDLE * 5).await;
        assert_eq!(tally.destroyed(), 1);
        assert_eq!(manager.stats(), ScopeStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_autocomplete_only_instance_skips_destroy_hook() {
        let manager = manager();
        let tally = Tally::default();

        let typing = manager
            .get_in(Some(&ctx(EventKind::AutoComplete)), "ticket", ticket(&tally))
            .unwrap();
        tokio::time::sleep(TYPING + Duration::from_secs(1)).await;

        assert!(!manager.contains_instance(&typing.instance_id));
        assert_eq!(tally.destroyed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_idle_timeout_does_not_panic() {
        let manager = manager();
        let interaction = ctx(EventKind::Interaction);

        let scoped = manager
            .get_in(Some(&interaction), "resident", || Ok(Resident))
            .unwrap();
        assert!(manager.has_armed_timer(&scoped.instance_id));

        let again = manager
            .get_in(Some(&interaction), "resident", || Ok(Resident))
            .unwrap();
        assert_eq!(again.instance_id, scoped.instance_id);

        tokio::time::sleep(Duration::from_secs(86_400 * 30)).await;
        assert!(manager.contains_instance(&scoped.instance_id));
        assert_eq!(manager.shutdown().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuse_postpones_eviction() {
        let manager = manager();
        let tally = Tally::default();
        let interaction = ctx(EventKind::Interaction);

        let scoped = manager.get_in(Some(&interaction), "ticket", ticket(&tally)).unwrap();
        let key = ObserverKey::Message(MessageId(4));
        manager.observers().register_button_observer(
            MessageId(4),
            scoped.instance_id.clone(),
            IDLE,
            noop,
            ObserverOptions::default(),
        );

        tokio::time::sleep(Duration::from_secs(50)).await;
        manager.get_in(Some(&interaction), "ticket", ticket(&tally)).unwrap();

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(manager.contains_instance(&scoped.instance_id));
        assert!(manager.observers().contains(ObserverKind::Button, key));
        assert_eq!(tally.destroyed(), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!manager.contains_instance(&scoped.instance_id));
        assert_eq!(tally.destroyed(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reuse_and_eviction_destroys_each_instance_once() {
        let manager = manager();
        let tally = Tally::default();
        let registered = Arc::new(AtomicUsize::new(0));
        let handed_out = Arc::new(Mutex::new(HashSet::new()));

        let tasks: Vec<_> = (0..8u64)
            .map(|worker| {
                let manager = manager.clone();
                let tally = tally.clone();
                let registered = Arc::clone(&registered);
                let handed_out = Arc::clone(&handed_out);
                tokio::spawn(async move {
                    for round in 0..200u64 {
                        let ctx = ConversationContext::new(
                            UserId(round % 3),
                            Some(ServerId(1)),
                            EventKind::Interaction,
                        );
                        let scoped = manager
                            .get_in(Some(&ctx), "flicker", flicker(&tally))
                            .unwrap();
                        if scoped.fresh {
                            registered.fetch_add(1, Ordering::SeqCst);
                        }
                        handed_out.lock().insert(scoped.instance_id.clone());

                        // outlives the instance unless its eviction drops it
                        manager.register_observer(
                            ObserverKind::Button,
                            ObserverKey::Message(MessageId(worker * 1000 + round)),
                            scoped.instance_id.clone(),
                            Duration::from_secs(60),
                            noop,
                            ObserverOptions::default(),
                        );

                        if (worker + round) % 17 == 0 {
                            manager.remove_by_instance_id(&scoped.instance_id).await;
                        }
                        if round % 10 == 0 {
                            tokio::time::sleep(Duration::from_millis(3)).await;
                        } else {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.stats(), ScopeStats::default());
        assert!(manager.observers().is_empty(), "observers outlived their owners");
        for id in handed_out.lock().iter() {
            assert!(!manager.has_armed_timer(id));
            assert!(manager.observers().owned_by(id).is_empty());
        }
        assert_eq!(tally.destroyed(), registered.load(Ordering::SeqCst));
        assert_eq!(tally.duplicates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_context_is_stateless() {
        let manager = manager();
        let tally = Tally::default();

        let a = manager.get("ticket", ticket(&tally)).unwrap();
        let b = manager.get("ticket", ticket(&tally)).unwrap();
        assert!(a.is_stateless() && b.is_stateless());
        assert!(a.fresh && b.fresh);
        assert_eq!(a.event_kind, EventKind::Other);
        assert!(!Arc::ptr_eq(&a.instance, &b.instance));
        assert_eq!(tally.built(), 2);
        assert_eq!(manager.stats(), ScopeStats::default());
    }

    #[tokio::test]
    async fn test_factory_error_is_surfaced() {
        let manager = manager();
        let result = manager.get_in::<Ticket, _>(Some(&ctx(EventKind::Interaction)), "ticket", || {
            Err(anyhow::anyhow!("database unavailable"))
        });

        let err = result.unwrap_err();
        assert!(matches!(err, ScopeError::Factory(_)));
        assert_eq!(err.to_string(), "database unavailable");
        assert_eq!(manager.stats().instances, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_mismatch() {
        let manager = manager();
        let tally = Tally::default();
        let interaction = ctx(EventKind::Interaction);

        manager.get_in(Some(&interaction), "ticket", ticket(&tally)).unwrap();
        let err = manager
            .get_in(Some(&interaction), "ticket", one_shot(&tally))
            .unwrap_err();
        assert!(matches!(err, ScopeError::TypeMismatch { .. }));
        assert_eq!(tally.built(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_id_correlation() {
        let manager = manager();
        let tally = Tally::default();

        let scoped = manager
            .get_in(Some(&ctx(EventKind::Interaction)), "ticket", ticket(&tally))
            .unwrap();
        assert!(manager.set_message_id_for_instance(&scoped.instance_id, MessageId(10)));

        // an autocomplete event from that message finds the interaction
        let typing = ctx(EventKind::AutoComplete).with_message_id(MessageId(10));
        let found = manager.get_in(Some(&typing), "ticket", ticket(&tally)).unwrap();
        assert_eq!(found.instance_id, scoped.instance_id);
        assert_eq!(found.event_kind, EventKind::Interaction);
        assert_eq!(manager.stats().autocomplete, 0);

        let info = manager.describe(&scoped.instance_id).unwrap();
        assert_eq!(info.message_id, Some(MessageId(10)));
        assert!(!manager.set_message_id_for_instance(&InstanceId::generate(), MessageId(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_linked_definition_shares_instance() {
        let manager = manager();
        let tally = Tally::default();
        let interaction = ctx(EventKind::Interaction);

        let scoped = manager.get_in(Some(&interaction), "ticket", ticket(&tally)).unwrap();
        manager
            .link_definition(&interaction, "ticket-admin", &scoped.instance_id)
            .unwrap();
        // linking twice is a no-op
        manager
            .link_definition(&interaction, "ticket-admin", &scoped.instance_id)
            .unwrap();

        let admin = manager
            .get_in(Some(&interaction), "ticket-admin", ticket(&tally))
            .unwrap();
        assert_eq!(admin.instance_id, scoped.instance_id);
        assert!(!admin.fresh);

        let info = manager.describe(&scoped.instance_id).unwrap();
        assert_eq!(info.definitions.len(), 2);
        assert_eq!(manager.stats().records, 2);
        assert_eq!(manager.lookup("ticket-admin", interaction.conversation_key()).len(), 1);

        let stranger = ConversationContext::new(UserId(99), None, EventKind::Interaction);
        let err = manager
            .link_definition(&stranger, "ticket-admin", &scoped.instance_id)
            .unwrap_err();
        assert!(matches!(err, ScopeError::UnknownInstance(_)));

        tokio::time::sleep(IDLE * 2).await;
        assert_eq!(tally.destroyed(), 1);
        assert_eq!(manager.stats(), ScopeStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_into_occupied_definition() {
        let manager = manager();
        let tally = Tally::default();
        let interaction = ctx(EventKind::Interaction);

        let first = manager.get_in(Some(&interaction), "ticket", ticket(&tally)).unwrap();
        manager.get_in(Some(&interaction), "report", ticket(&tally)).unwrap();

        let err = manager
            .link_definition(&interaction, "report", &first.instance_id)
            .unwrap_err();
        assert!(matches!(err, ScopeError::Occupied { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_removal() {
        let manager = manager();
        let tally = Tally::default();

        let scoped = manager
            .get_in(Some(&ctx(EventKind::Interaction)), "ticket", ticket(&tally))
            .unwrap();
        manager
            .observers()
            .register_modal_observer(UserId(1), scoped.instance_id.clone(), IDLE, noop);

        assert!(manager.remove_by_instance_id(&scoped.instance_id).await);
        assert!(!manager.remove_by_instance_id(&scoped.instance_id).await);
        assert_eq!(tally.destroyed(), 1);
        assert!(manager.observers().is_empty());

        tokio::time::sleep(IDLE * 2).await;
        assert_eq!(tally.destroyed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_observer_requires_live_owner() {
        let manager = manager();
        let tally = Tally::default();
        let key = ObserverKey::Message(MessageId(12));

        let scoped = manager
            .get_in(Some(&ctx(EventKind::Interaction)), "ticket", ticket(&tally))
            .unwrap();
        let owner = scoped.instance_id.clone();
        assert!(manager.register_observer(
            ObserverKind::Button,
            key,
            owner.clone(),
            IDLE,
            noop,
            ObserverOptions::default(),
        ));
        assert!(manager.observers().contains(ObserverKind::Button, key));

        manager.remove_by_instance_id(&owner).await;
        assert!(!manager.register_observer(
            ObserverKind::Button,
            key,
            owner.clone(),
            IDLE,
            noop,
            ObserverOptions::default(),
        ));
        assert!(manager.observers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_hook_disabled_by_policy() {
        let resolver = PolicyResolver::default().with_definition(
            "ticket",
            PolicyOverrides::INHERIT
                .call_destroy_on_evict(false)
                .remove_observers_on_evict(false),
        );
        let manager = ScopedInstanceManager::new(resolver).unwrap();
        let tally = Tally::default();

        let scoped = manager
            .get_in(Some(&ctx(EventKind::Interaction)), "ticket", ticket(&tally))
            .unwrap();
        manager.observers().register_button_observer(
            MessageId(2),
            scoped.instance_id.clone(),
            IDLE * 10,
            noop,
            ObserverOptions::default(),
        );

        tokio::time::sleep(IDLE * 2).await;
        assert!(!manager.contains_instance(&scoped.instance_id));
        assert_eq!(tally.destroyed(), 0);
        // orphaned observer expires on its own schedule
        assert_eq!(manager.observers().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_evicts_everything() {
        let manager = manager();
        let tally = Tally::default();

        manager
            .get_in(Some(&ctx(EventKind::Interaction)), "ticket", ticket(&tally))
            .unwrap();
        let other = ConversationContext::new(UserId(5), None, EventKind::Interaction);
        manager.get_in(Some(&other), "ticket", ticket(&tally)).unwrap();
        manager
            .get_in(Some(&ctx(EventKind::AutoComplete)), "search", ticket(&tally))
            .unwrap();

        assert_eq!(manager.shutdown().await, 3);
        // the autocomplete instance has no hook to run
        assert_eq!(tally.destroyed(), 2);
        assert_eq!(manager.stats(), ScopeStats::default());
    }
}
