//! Typed publish/subscribe registry used to fan channel events out to the
//! stores that care about them.
//!
//! Delivery is synchronous: [`EventBus::publish`] returns only after every
//! listener registered for the kind has run. A listener that panics is logged
//! and skipped; the remaining listeners still see the event.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, trace};

pub type Payload = serde_json::Value;

/// Closed set of event kinds carried by the bus.
///
/// `Connected`, `Disconnected` and `Error` are raised locally by the channel
/// and never appear on the wire. The rest mirror the `type` field of wire
/// frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Disconnected,
    Error,
    Ping,
    Pong,
    NoteCreate,
    NoteUpdate,
    NoteDelete,
    Collaboration,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::Error,
        EventKind::Ping,
        EventKind::Pong,
        EventKind::NoteCreate,
        EventKind::NoteUpdate,
        EventKind::NoteDelete,
        EventKind::Collaboration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Error => "error",
            EventKind::Ping => "ping",
            EventKind::Pong => "pong",
            EventKind::NoteCreate => "note_create",
            EventKind::NoteUpdate => "note_update",
            EventKind::NoteDelete => "note_delete",
            EventKind::Collaboration => "collaboration",
        }
    }

    /// Lifecycle kinds are raised by the channel itself.
    pub fn is_lifecycle(self) -> bool {
        matches!(
            self,
            EventKind::Connected | EventKind::Disconnected | EventKind::Error
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown event kind `{0}`")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// Callback handle registered on the bus.
///
/// Clones share identity, so the handle used to subscribe can later be used
/// to unsubscribe. Two listeners built from separate `new` calls are always
/// distinct, even when wrapping the same function.
#[derive(Clone)]
pub struct Listener(Arc<dyn Fn(&Payload) + Send + Sync>);

impl Listener {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    fn identity(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }

    fn call(&self, payload: &Payload) {
        (self.0)(payload)
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Listener {}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener").field(&self.identity()).finish()
    }
}

#[derive(Debug, Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` under `kind`. Registering the same listener twice
    /// is a no-op.
    pub fn subscribe(&self, kind: EventKind, listener: &Listener) {
        let mut guard = self.listeners.write();
        let entry = guard.entry(kind).or_default();
        if !entry.contains(listener) {
            entry.push(listener.clone());
        }
    }

    pub fn unsubscribe(&self, kind: EventKind, listener: &Listener) {
        let mut guard = self.listeners.write();
        if let Some(entry) = guard.get_mut(&kind) {
            entry.retain(|existing| existing != listener);
            if entry.is_empty() {
                guard.remove(&kind);
            }
        }
    }

    /// Invokes every listener currently registered under `kind` and returns
    /// how many ran to completion.
    ///
    /// The registry lock is released before any callback runs, so listeners
    /// may subscribe or unsubscribe from inside a callback. Such changes take
    /// effect for the next publish.
    pub fn publish(&self, kind: EventKind, payload: &Payload) -> usize {
        let snapshot: Vec<Listener> = match self.listeners.read().get(&kind) {
            Some(entry) => entry.clone(),
            None => {
                trace!(target: "event_bus", %kind, "no listeners");
                return 0;
            }
        };

        let mut delivered = 0;
        for listener in &snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.call(payload))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    error!(
                        target: "event_bus",
                        %kind,
                        panic = panic_message(panic.as_ref()),
                        "listener panicked"
                    );
                }
            }
        }
        delivered
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
