//! The instance table behind [`ScopedInstanceManager`](crate::ScopedInstanceManager).
//!
//! Records are grouped in buckets keyed by `(definition, conversation)`; each
//! bucket maps instance ids to [`InstanceRecord`]s.  An instance registered
//! under several definitions (see
//! [`link_definition`](crate::ScopedInstanceManager::link_definition)) has one
//! record per bucket, all sharing one [`LiveInstance`] entry that owns the
//! eviction timer.
//!
//! The store is plain data.  Locking, timer spawning and hooks belong to the
//! manager; every method here runs under its lock and never calls user code.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tether_core::{ConversationKey, EventKind, InstanceId, MessageId, Policy};
use tokio::time::Instant;

use crate::instance::ErasedInstance;
use crate::timer::{Generation, TimerSlot};

/// Key of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct BucketKey {
    pub(crate) definition: Arc<str>,
    pub(crate) conversation: ConversationKey,
}

impl BucketKey {
    pub(crate) fn new(definition: &str, conversation: &ConversationKey) -> Self {
        Self {
            definition: Arc::from(definition),
            conversation: conversation.clone(),
        }
    }
}

/// One registration of a live instance under a definition name.
#[derive(Debug, Clone)]
pub(crate) struct InstanceRecord {
    pub(crate) definition: Arc<str>,
    pub(crate) conversation: ConversationKey,
    pub(crate) id: InstanceId,
    pub(crate) event_kind: EventKind,
    pub(crate) instance: ErasedInstance,
    pub(crate) message_id: Option<MessageId>,
    pub(crate) created_at: SystemTime,
    pub(crate) policy: Policy,
}

impl InstanceRecord {
    /// Idle period appropriate for the record's current stage.
    pub(crate) fn timeout(&self) -> Duration {
        timeout_for(&self.policy, self.event_kind)
    }
}

pub(crate) fn timeout_for(policy: &Policy, kind: EventKind) -> Duration {
    match kind {
        EventKind::AutoComplete => policy.autocomplete_timeout,
        EventKind::Interaction | EventKind::Other => policy.idle_timeout,
    }
}

#[derive(Debug)]
struct LiveInstance {
    timer: Option<TimerSlot>,
    buckets: Vec<BucketKey>,
}

/// Everything needed to finish an eviction once the store lock is released.
#[derive(Debug)]
pub(crate) struct EvictedInstance {
    pub(crate) id: InstanceId,
    pub(crate) definitions: Vec<Arc<str>>,
    pub(crate) event_kind: EventKind,
    pub(crate) instance: ErasedInstance,
    pub(crate) policy: Policy,
}

impl EvictedInstance {
    /// Autocomplete-only instances never see their destroy hook.
    pub(crate) fn runs_destroy_hook(&self) -> bool {
        self.policy.call_destroy_on_evict && self.event_kind == EventKind::Interaction
    }

    pub(crate) fn releases_observers(&self) -> bool {
        self.policy.remove_observers_on_evict
    }
}

// =============================================================================
// Inspection types
// =============================================================================

/// Snapshot of one live instance.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub instance_id: InstanceId,
    /// Every definition name the instance is registered under.
    pub definitions: Vec<String>,
    pub conversation: ConversationKey,
    pub event_kind: EventKind,
    pub message_id: Option<MessageId>,
    pub created_at: SystemTime,
    /// Rust type name of the handler.
    pub type_name: &'static str,
    pub policy: Policy,
    /// When the eviction timer fires, if one is armed.
    pub expires_at: Option<Instant>,
}

/// Aggregate counters of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeStats {
    /// Distinct live instances.
    pub instances: usize,
    /// Records across all buckets (linked instances count once per bucket).
    pub records: usize,
    /// Non-empty buckets.
    pub buckets: usize,
    /// Instances still in the autocomplete stage.
    pub autocomplete: usize,
}

// =============================================================================
// InstanceStore
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct InstanceStore {
    buckets: HashMap<BucketKey, HashMap<InstanceId, InstanceRecord>>,
    live: HashMap<InstanceId, LiveInstance>,
}

impl InstanceStore {
    pub(crate) fn record(&self, bucket: &BucketKey, id: &InstanceId) -> Option<&InstanceRecord> {
        self.buckets.get(bucket)?.get(id)
    }

    /// Any record of a live instance; all of them share instance and policy.
    pub(crate) fn any_record(&self, id: &InstanceId) -> Option<&InstanceRecord> {
        let live = self.live.get(id)?;
        live.buckets.iter().find_map(|bucket| self.record(bucket, id))
    }

    pub(crate) fn find_by_message(
        &self,
        bucket: &BucketKey,
        message: MessageId,
    ) -> Option<&InstanceRecord> {
        self.buckets
            .get(bucket)?
            .values()
            .find(|record| record.message_id == Some(message))
    }

    pub(crate) fn find_by_kind(
        &self,
        bucket: &BucketKey,
        kind: EventKind,
    ) -> Option<&InstanceRecord> {
        self.buckets
            .get(bucket)?
            .values()
            .find(|record| record.event_kind == kind)
    }

    pub(crate) fn contains(&self, id: &InstanceId) -> bool {
        self.live.contains_key(id)
    }

    pub(crate) fn has_armed_timer(&self, id: &InstanceId) -> bool {
        self.live
            .get(id)
            .and_then(|live| live.timer.as_ref())
            .is_some_and(TimerSlot::is_pending)
    }

    /// Registers a new instance with its first record and timer.
    pub(crate) fn insert(&mut self, record: InstanceRecord, timer: TimerSlot) {
        let bucket = BucketKey {
            definition: Arc::clone(&record.definition),
            conversation: record.conversation.clone(),
        };
        self.live.insert(
            record.id.clone(),
            LiveInstance {
                timer: Some(timer),
                buckets: vec![bucket.clone()],
            },
        );
        self.buckets
            .entry(bucket)
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Adds a record for an already live instance.  Returns `false` when the
    /// instance is not live.
    pub(crate) fn link(&mut self, record: InstanceRecord) -> bool {
        let Some(live) = self.live.get_mut(&record.id) else {
            return false;
        };
        let bucket = BucketKey {
            definition: Arc::clone(&record.definition),
            conversation: record.conversation.clone(),
        };
        if !live.buckets.contains(&bucket) {
            live.buckets.push(bucket.clone());
        }
        self.buckets
            .entry(bucket)
            .or_default()
            .insert(record.id.clone(), record);
        true
    }

    /// Installs `timer` as the instance's eviction timer, cancelling the one
    /// it replaces.  An instance that is no longer live gets its new timer
    /// cancelled instead.
    pub(crate) fn rearm(&mut self, id: &InstanceId, timer: TimerSlot) {
        match self.live.get_mut(id) {
            Some(live) => {
                if let Some(previous) = live.timer.replace(timer) {
                    previous.cancel();
                }
            }
            None => timer.cancel(),
        }
    }

    /// Flips every record of the instance to [`EventKind::Interaction`].
    pub(crate) fn promote(&mut self, id: &InstanceId) {
        self.for_each_record(id, |record| record.event_kind = EventKind::Interaction);
    }

    /// Records `message` on the instance's record in `bucket`.
    pub(crate) fn set_message_id_in(
        &mut self,
        bucket: &BucketKey,
        id: &InstanceId,
        message: MessageId,
    ) {
        if let Some(record) = self.buckets.get_mut(bucket).and_then(|b| b.get_mut(id)) {
            record.message_id = Some(message);
        }
    }

    /// Records `message` on every record of the instance.
    pub(crate) fn set_message_id(&mut self, id: &InstanceId, message: MessageId) -> bool {
        if !self.live.contains_key(id) {
            return false;
        }
        self.for_each_record(id, |record| record.message_id = Some(message));
        true
    }

    fn for_each_record(&mut self, id: &InstanceId, mut f: impl FnMut(&mut InstanceRecord)) {
        let Some(live) = self.live.get(id) else {
            return;
        };
        for bucket in &live.buckets {
            if let Some(record) = self.buckets.get_mut(bucket).and_then(|b| b.get_mut(id)) {
                f(record);
            }
        }
    }

    // ─── Claiming ────────────────────────────────────────────────────────────

    /// Removes the instance and cancels its timer.
    pub(crate) fn claim(&mut self, id: &InstanceId) -> Option<EvictedInstance> {
        let (evicted, timer) = self.take(id)?;
        if let Some(timer) = timer {
            timer.cancel();
        }
        Some(evicted)
    }

    /// Removes the instance if `generation` is still its armed timer.
    ///
    /// Called from the timer task itself, so the slot is dropped rather than
    /// cancelled.
    pub(crate) fn claim_expired(
        &mut self,
        id: &InstanceId,
        generation: Generation,
    ) -> Option<EvictedInstance> {
        let current = self.live.get(id)?.timer.as_ref()?.generation();
        if current != generation {
            return None;
        }
        self.take(id).map(|(evicted, _detached)| evicted)
    }

    /// Removes every instance, cancelling all timers.
    pub(crate) fn drain(&mut self) -> Vec<EvictedInstance> {
        let ids: Vec<InstanceId> = self.live.keys().cloned().collect();
        ids.iter().filter_map(|id| self.claim(id)).collect()
    }

    /// Cancels every pending timer without touching the records.
    pub(crate) fn cancel_all_timers(&mut self) {
        for live in self.live.values_mut() {
            if let Some(timer) = live.timer.take() {
                timer.cancel();
            }
        }
    }

    fn take(&mut self, id: &InstanceId) -> Option<(EvictedInstance, Option<TimerSlot>)> {
        let live = self.live.remove(id)?;
        let mut records = Vec::with_capacity(live.buckets.len());
        for bucket in &live.buckets {
            if let Some(records_in_bucket) = self.buckets.get_mut(bucket) {
                if let Some(record) = records_in_bucket.remove(id) {
                    records.push(record);
                }
                if records_in_bucket.is_empty() {
                    self.buckets.remove(bucket);
                }
            }
        }

        let first = records.first()?;
        let evicted = EvictedInstance {
            id: id.clone(),
            definitions: records.iter().map(|r| Arc::clone(&r.definition)).collect(),
            event_kind: first.event_kind,
            instance: first.instance.clone(),
            policy: first.policy,
        };
        Some((evicted, live.timer))
    }

    // ─── Inspection ──────────────────────────────────────────────────────────

    pub(crate) fn describe(&self, id: &InstanceId) -> Option<InstanceInfo> {
        let live = self.live.get(id)?;
        let record = self.any_record(id)?;
        Some(InstanceInfo {
            instance_id: id.clone(),
            definitions: live
                .buckets
                .iter()
                .map(|bucket| bucket.definition.to_string())
                .collect(),
            conversation: record.conversation.clone(),
            event_kind: record.event_kind,
            message_id: record.message_id,
            created_at: record.created_at,
            type_name: record.instance.type_name(),
            policy: record.policy,
            expires_at: live
                .timer
                .as_ref()
                .filter(|timer| timer.is_pending())
                .map(TimerSlot::deadline),
        })
    }

    pub(crate) fn lookup(&self, bucket: &BucketKey) -> Vec<InstanceInfo> {
        self.buckets
            .get(bucket)
            .map(|records| records.keys().filter_map(|id| self.describe(id)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn stats(&self) -> ScopeStats {
        ScopeStats {
            instances: self.live.len(),
            records: self.buckets.values().map(HashMap::len).sum(),
            buckets: self.buckets.len(),
            autocomplete: self
                .live
                .keys()
                .filter_map(|id| self.any_record(id))
                .filter(|record| record.event_kind.is_auto_complete())
                .count(),
        }
    }
}
