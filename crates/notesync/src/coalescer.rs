//! Frame-rate coalescing of streamed text.
//!
//! Fragments appended between two frames are delivered to the host as one
//! string, so a burst of tiny model tokens costs a single render.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::scheduler::{Scheduler, TimerId};

const TARGET: &str = "notesync::coalescer";

/// Roughly one display frame at 60Hz.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

type FlushFn = dyn Fn(String) + Send + Sync;

/// Buffers text and hands it to `on_flush` at most once per frame.
///
/// Appends within one frame share a single pending flush. `flush` delivers
/// immediately and `reset` discards everything without delivering. The
/// callback never runs with an empty buffer.
#[derive(Clone)]
pub struct FrameCoalescer {
    inner: Arc<CoalescerInner>,
}

struct CoalescerInner {
    scheduler: Arc<dyn Scheduler>,
    interval: Duration,
    on_flush: Box<FlushFn>,
    state: Mutex<CoalescerState>,
}

#[derive(Default)]
struct CoalescerState {
    text: String,
    pending: Option<(TimerId, u64)>,
    epoch: u64,
}

impl FrameCoalescer {
    pub fn new<F>(scheduler: Arc<dyn Scheduler>, on_flush: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self::with_interval(scheduler, DEFAULT_FRAME_INTERVAL, on_flush)
    }

    pub fn with_interval<F>(scheduler: Arc<dyn Scheduler>, interval: Duration, on_flush: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(CoalescerInner {
                scheduler,
                interval,
                on_flush: Box::new(on_flush),
                state: Mutex::new(CoalescerState::default()),
            }),
        }
    }

    pub fn append(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock();
        state.text.push_str(text);
        if state.pending.is_some() {
            return;
        }

        state.epoch += 1;
        let epoch = state.epoch;
        let weak: Weak<CoalescerInner> = Arc::downgrade(&self.inner);
        let id = self.inner.scheduler.schedule(
            self.inner.interval,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.frame_elapsed(epoch);
                }
            }),
        );
        state.pending = Some((id, epoch));
    }

    /// Delivers whatever is buffered right now and cancels the pending frame.
    pub fn flush(&self) {
        let text = {
            let mut state = self.inner.state.lock();
            if let Some((id, _)) = state.pending.take() {
                self.inner.scheduler.cancel(id);
            }
            std::mem::take(&mut state.text)
        };
        self.inner.deliver(text);
    }

    /// Drops buffered text and the pending frame without delivering.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        if let Some((id, _)) = state.pending.take() {
            self.inner.scheduler.cancel(id);
        }
        state.text.clear();
    }

    /// Text appended since the last delivery.
    pub fn buffered(&self) -> String {
        self.inner.state.lock().text.clone()
    }

    pub fn has_pending_flush(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }
}

impl fmt::Debug for FrameCoalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FrameCoalescer")
            .field("interval", &self.inner.interval)
            .field("buffered", &state.text.len())
            .field("pending", &state.pending.is_some())
            .finish()
    }
}

impl CoalescerInner {
    fn frame_elapsed(&self, epoch: u64) {
        let text = {
            let mut state = self.state.lock();
            match state.pending {
                Some((_, pending)) if pending == epoch => {}
                _ => return,
            }
            state.pending = None;
            std::mem::take(&mut state.text)
        };
        self.deliver(text);
    }

    fn deliver(&self, text: String) {
        if text.is_empty() {
            return;
        }
        trace!(target: TARGET, bytes = text.len(), "flushing frame");
        (self.on_flush)(text);
    }
}
