//! Registry of pending UI callbacks.
//!
//! When a handler sends a message carrying buttons or select menus, or opens
//! a modal, the messaging layer registers an *observer* for it here.  Each
//! observer has its own timeout and remembers the instance that owns it:
//!
//! - the owner being reused restarts the observer's timer
//!   ([`reset_timers_for_instance`](ObserverRegistry::reset_timers_for_instance));
//! - the owner being evicted cancels it
//!   ([`remove_by_owner`](ObserverRegistry::remove_by_owner));
//! - the observer timing out runs its `on_timeout` callback (typically
//!   disabling the components) and drops the entry, unless it was registered
//!   as stay-active.
//!
//! Buttons and select menus are keyed by the id of the message carrying them,
//! modals by the user they were shown to.  Unknown keys are never errors.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tether_core::{InstanceId, MessageId, UserId};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::hook::run_hook;
use crate::timer::{Generation, TimerSlot};

/// Callback run when an observer times out.
pub type TimeoutCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// The kind of UI element an observer watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserverKind {
    Button,
    StringSelect,
    EntitySelect,
    Modal,
}

/// Flavour of select menu, for [`ObserverRegistry::register_select_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMenu {
    String,
    Entity,
}

impl From<SelectMenu> for ObserverKind {
    fn from(menu: SelectMenu) -> Self {
        match menu {
            SelectMenu::String => Self::StringSelect,
            SelectMenu::Entity => Self::EntitySelect,
        }
    }
}

/// What an observer is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserverKey {
    /// The message carrying the component.
    Message(MessageId),
    /// The user a modal was shown to.
    User(UserId),
}

impl fmt::Display for ObserverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(id) => write!(f, "message:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// Optional behaviour of an observer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserverOptions {
    /// Users allowed to trigger the observer; everyone when empty.
    pub allowed_users: HashSet<UserId>,
    /// Keep the entry registered after it fires or times out.
    pub stay_active: bool,
}

impl ObserverOptions {
    pub fn allow_user(mut self, user: UserId) -> Self {
        self.allowed_users.insert(user);
        self
    }

    pub fn stay_active(mut self) -> Self {
        self.stay_active = true;
        self
    }
}

/// Outcome of [`ObserverRegistry::trigger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverTrigger {
    /// No observer is registered for the element.
    Missing,
    /// The observer is restricted to other users.
    Forbidden,
    /// The observer accepted the interaction; route it to `owner`.
    Fired { owner: InstanceId },
}

struct ObserverEntry {
    owner: InstanceId,
    duration: Duration,
    on_timeout: TimeoutCallback,
    options: ObserverOptions,
    /// `None` once a stay-active entry has timed out.
    timer: Option<TimerSlot>,
}

type EntryKey = (ObserverKind, ObserverKey);

// =============================================================================
// ObserverRegistry
// =============================================================================

/// Shared handle to the observer table.  Cheap to clone.
#[derive(Clone)]
pub struct ObserverRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    entries: Mutex<HashMap<EntryKey, ObserverEntry>>,
    runtime: Handle,
}

impl ObserverRegistry {
    /// Creates an empty registry whose timers run on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                runtime,
            }),
        }
    }

    /// Registers an observer, replacing any entry with the same kind and key.
    pub fn register<F, Fut>(
        &self,
        kind: ObserverKind,
        key: ObserverKey,
        owner: InstanceId,
        duration: Duration,
        on_timeout: F,
        options: ObserverOptions,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let on_timeout: TimeoutCallback = Arc::new(move || on_timeout().boxed());
        let slot = (kind, key);

        debug!(
            kind = ?kind,
            key = %key,
            owner = %owner,
            timeout_secs = duration.as_secs(),
            "Registered observer"
        );

        let replaced = {
            let mut entries = self.inner.entries.lock();
            let timer = self.inner.arm(slot, duration);
            entries.insert(
                slot,
                ObserverEntry {
                    owner,
                    duration,
                    on_timeout,
                    options,
                    timer: Some(timer),
                },
            )
        };
        if let Some(timer) = replaced.and_then(|old| old.timer) {
            timer.cancel();
        }
    }

    /// Registers an observer for the buttons of `message`.
    pub fn register_button_observer<F, Fut>(
        &self,
        message: MessageId,
        owner: InstanceId,
        duration: Duration,
        on_timeout: F,
        options: ObserverOptions,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(
            ObserverKind::Button,
            ObserverKey::Message(message),
            owner,
            duration,
            on_timeout,
            options,
        );
    }

    /// Registers an observer for a select menu on `message`.
    pub fn register_select_observer<F, Fut>(
        &self,
        menu: SelectMenu,
        message: MessageId,
        owner: InstanceId,
        duration: Duration,
        on_timeout: F,
        options: ObserverOptions,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(
            menu.into(),
            ObserverKey::Message(message),
            owner,
            duration,
            on_timeout,
            options,
        );
    }

    /// Registers an observer for a modal shown to `author`.  Only `author`
    /// may submit it.
    pub fn register_modal_observer<F, Fut>(
        &self,
        author: UserId,
        owner: InstanceId,
        duration: Duration,
        on_timeout: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(
            ObserverKind::Modal,
            ObserverKey::User(author),
            owner,
            duration,
            on_timeout,
            ObserverOptions::default().allow_user(author),
        );
    }

    /// Removes one observer.  Returns `false` if it was not registered.
    pub fn remove_observer(&self, kind: ObserverKind, key: ObserverKey) -> bool {
        let removed = self.inner.entries.lock().remove(&(kind, key));
        match removed {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Restarts the timer of every observer owned by `owner`, each for its
    /// original duration.  Returns the number of timers restarted.
    pub fn reset_timers_for_instance(&self, owner: &InstanceId) -> usize {
        let mut entries = self.inner.entries.lock();
        let mut reset = 0;
        for (slot, entry) in entries.iter_mut().filter(|(_, e)| &e.owner == owner) {
            let (kind, key) = *slot;
            if kind == ObserverKind::Modal && entry.options.allowed_users.is_empty() {
                warn!(
                    key = %key,
                    owner = %owner,
                    "Modal observer has no author restriction, not resetting its timer"
                );
                continue;
            }
            let timer = self.inner.arm(*slot, entry.duration);
            if let Some(previous) = entry.timer.replace(timer) {
                previous.cancel();
            }
            reset += 1;
        }
        if reset > 0 {
            trace!(owner = %owner, count = reset, "Reset observer timers");
        }
        reset
    }

    /// Cancels and removes every observer owned by `owner`.  Returns the
    /// number removed.
    pub fn remove_by_owner(&self, owner: &InstanceId) -> usize {
        let removed: Vec<ObserverEntry> = {
            let mut entries = self.inner.entries.lock();
            let keys: Vec<EntryKey> = entries
                .iter()
                .filter(|(_, entry)| &entry.owner == owner)
                .map(|(slot, _)| *slot)
                .collect();
            keys.iter().filter_map(|slot| entries.remove(slot)).collect()
        };
        let count = removed.len();
        for timer in removed.into_iter().filter_map(|entry| entry.timer) {
            timer.cancel();
        }
        if count > 0 {
            debug!(owner = %owner, count, "Removed observers of evicted instance");
        }
        count
    }

    /// Reports an interaction of `user` with the observed element.
    ///
    /// Observers that are not stay-active are consumed by the first accepted
    /// interaction.
    pub fn trigger(&self, kind: ObserverKind, key: ObserverKey, user: UserId) -> ObserverTrigger {
        let mut entries = self.inner.entries.lock();
        let slot = (kind, key);
        let Some(entry) = entries.get(&slot) else {
            return ObserverTrigger::Missing;
        };
        let allowed = &entry.options.allowed_users;
        if !allowed.is_empty() && !allowed.contains(&user) {
            debug!(
                kind = ?kind,
                key = %key,
                user = %user,
                "Observer triggered by a user it does not allow"
            );
            return ObserverTrigger::Forbidden;
        }

        let owner = entry.owner.clone();
        if !entry.options.stay_active {
            if let Some(timer) = entries.remove(&slot).and_then(|entry| entry.timer) {
                timer.cancel();
            }
        }
        ObserverTrigger::Fired { owner }
    }

    pub fn contains(&self, kind: ObserverKind, key: ObserverKey) -> bool {
        self.inner.entries.lock().contains_key(&(kind, key))
    }

    /// Returns `true` if the observer is registered and its timer pending.
    pub fn is_armed(&self, kind: ObserverKind, key: ObserverKey) -> bool {
        self.inner
            .entries
            .lock()
            .get(&(kind, key))
            .and_then(|entry| entry.timer.as_ref())
            .is_some_and(TimerSlot::is_pending)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of every observer owned by `owner`.
    pub fn owned_by(&self, owner: &InstanceId) -> Vec<(ObserverKind, ObserverKey)> {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| &entry.owner == owner)
            .map(|(slot, _)| *slot)
            .collect()
    }

    /// Cancels and removes every observer.
    pub fn clear(&self) {
        let drained: Vec<ObserverEntry> =
            self.inner.entries.lock().drain().map(|(_, e)| e).collect();
        for timer in drained.into_iter().filter_map(|entry| entry.timer) {
            timer.cancel();
        }
    }
}

impl fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.len())
            .finish_non_exhaustive()
    }
}

impl RegistryInner {
    fn arm(self: &Arc<Self>, slot: EntryKey, duration: Duration) -> TimerSlot {
        let registry: Weak<Self> = Arc::downgrade(self);
        TimerSlot::spawn(&self.runtime, duration, move |generation| async move {
            if let Some(registry) = registry.upgrade() {
                registry.expire(slot, generation).await;
            }
        })
    }

    async fn expire(&self, slot: EntryKey, generation: Generation) {
        let (kind, key) = slot;
        let expired = {
            let mut entries = self.entries.lock();
            let current = entries
                .get(&slot)
                .and_then(|entry| entry.timer.as_ref())
                .map(TimerSlot::generation);
            match entries.get_mut(&slot) {
                Some(entry) if current == Some(generation) => {
                    if entry.options.stay_active {
                        // Dropped, not cancelled: this task is the timer.
                        drop(entry.timer.take());
                        Some((entry.owner.clone(), Arc::clone(&entry.on_timeout)))
                    } else {
                        entries
                            .remove(&slot)
                            .map(|entry| (entry.owner, entry.on_timeout))
                    }
                }
                _ => None,
            }
        };

        let Some((owner, on_timeout)) = expired else {
            trace!(kind = ?kind, key = %key, "Stale observer timer, ignoring");
            return;
        };

        debug!(kind = ?kind, key = %key, owner = %owner, "Observer timed out");
        if let Err(failure) = run_hook(on_timeout()).await {
            warn!(
                kind = ?kind,
                key = %key,
                owner = %owner,
                error = %failure,
                "Observer timeout callback failed"
            );
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for (_, entry) in self.entries.get_mut().drain() {
            if let Some(timer) = entry.timer {
                timer.cancel();
            }
        }
    }
}
