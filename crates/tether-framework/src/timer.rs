//! Cancellable one-shot timers on the tokio timer wheel.
//!
//! A [`TimerSlot`] owns the task sleeping until its deadline.  Every slot is
//! tagged with a process-wide unique [`Generation`]; the callback receives
//! it and must check, under the owning structure's lock, that its generation
//! is still the registered one before touching shared state.  Cancelling a
//! slot only aborts the task on a best-effort basis, so that check is what
//! makes a superseded timer harmless.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Deadline used when `now + after` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Identity of one arming of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Generation(u64);

impl Generation {
    fn next() -> Self {
        Self(NEXT_GENERATION.fetch_add(1, Ordering::Relaxed))
    }
}

/// An armed timer.
///
/// Dropping a slot detaches the task without cancelling it; call
/// [`cancel`](Self::cancel) to abort it.  A callback removing its own slot
/// must drop it rather than cancel it, or it would abort itself.
#[derive(Debug)]
pub(crate) struct TimerSlot {
    generation: Generation,
    deadline: Instant,
    handle: JoinHandle<()>,
}

impl TimerSlot {
    /// Spawns a task on `runtime` that calls `on_fire` after `after`.
    pub(crate) fn spawn<F, Fut>(runtime: &Handle, after: Duration, on_fire: F) -> Self
    where
        F: FnOnce(Generation) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = Generation::next();
        let now = Instant::now();
        let deadline = now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE);
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_fire(generation).await;
        });
        Self {
            generation,
            deadline,
            handle,
        }
    }

    pub(crate) fn generation(&self) -> Generation {
        self.generation
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Returns `true` while the task has neither fired nor been aborted.
    pub(crate) fn is_pending(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Aborts the task.  A callback already running past its sleep keeps
    /// going until its next await point.
    pub(crate) fn cancel(self) {
        self.handle.abort();
    }
}
