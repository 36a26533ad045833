//! Delayed-task scheduling used for reconnect backoff, heartbeats and frame
//! flushes.
//!
//! [`TokioScheduler`] runs tasks on real tokio timers. [`ManualScheduler`] keeps
//! a virtual clock that only moves when [`ManualScheduler::advance`] is called,
//! which makes backoff and frame timing deterministic in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

pub trait Scheduler: Send + Sync {
    /// Runs `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancels a pending task. Returns `false` when it already ran or was
    /// cancelled before.
    fn cancel(&self, id: TimerId) -> bool;
}

pub struct TokioScheduler {
    handle: Handle,
    next_id: AtomicU64,
    timers: Arc<Mutex<HashMap<TimerId, AbortHandle>>>,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            next_id: AtomicU64::new(1),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Binds to the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, like `tokio::spawn`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let timers = Arc::clone(&self.timers);
        // Held across the spawn so a zero-delay task cannot look itself up
        // before it has been registered.
        let mut guard = self.timers.lock();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let armed = timers.lock().remove(&id).is_some();
            if armed {
                task();
            }
        });
        guard.insert(id, join.abort_handle());
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        match self.timers.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

struct PendingTask {
    id: TimerId,
    due: Duration,
    delay: Duration,
    task: Task,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    pending: Vec<PendingTask>,
}

/// Virtual-clock scheduler. Nothing runs until the clock is advanced.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed on the virtual clock.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Delays requested by the pending tasks, earliest due first.
    pub fn pending_delays(&self) -> Vec<Duration> {
        let state = self.state.lock();
        let mut due: Vec<(Duration, TimerId, Duration)> = state
            .pending
            .iter()
            .map(|task| (task.due, task.id, task.delay))
            .collect();
        due.sort();
        due.into_iter().map(|(_, _, delay)| delay).collect()
    }

    /// Moves the clock forward by `by`, running every task that falls due on
    /// the way in due order. Tasks scheduled by those tasks run too when they
    /// fall inside the window. Returns how many tasks ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        let mut ran = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                let position = state
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, task)| task.due <= target)
                    .min_by_key(|(_, task)| (task.due, task.id))
                    .map(|(index, _)| index);
                match position {
                    Some(index) => {
                        let task = state.pending.swap_remove(index);
                        state.now = task.due;
                        task
                    }
                    None => {
                        state.now = target;
                        break;
                    }
                }
            };
            trace!(target: "notesync::scheduler", id = next.id.0, "running manual task");
            (next.task)();
            ran += 1;
        }
        ran
    }

    /// Advances exactly to the earliest pending task and runs it.
    pub fn run_next(&self) -> bool {
        let step = {
            let state = self.state.lock();
            state
                .pending
                .iter()
                .map(|task| task.due)
                .min()
                .map(|due| due.saturating_sub(state.now))
        };
        match step {
            Some(step) => self.advance(step) > 0,
            None => false,
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = TimerId(state.next_id);
        let due = state.now + delay;
        state.pending.push(PendingTask {
            id,
            due,
            delay,
            task,
        });
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|task| task.id != id);
        state.pending.len() != before
    }
}
