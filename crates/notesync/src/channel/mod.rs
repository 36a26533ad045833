//! Live note channel.
//!
//! A [`ReconnectingChannel`] owns at most one connection at a time. It
//! reconnects with exponential backoff after failures, keeps idle proxies
//! awake with a fire-and-forget heartbeat, and publishes lifecycle and data
//! events onto a shared [`EventBus`]. Subscriptions live on the bus, so they
//! survive reconnects and explicit close/open cycles.
//!
//! Every dial gets a fresh generation number. Timers, dial results and
//! reader tasks carry the generation they were started under and go quiet
//! once it is superseded, which keeps late callbacks from a previous
//! connection from touching the current one.

mod connector;
mod mock;
mod policy;
mod websocket;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use event_bus::{EventBus, EventKind};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

pub use connector::{Connector, Endpoint, Link, LinkEvent};
pub use mock::{MockConnector, MockPeer};
pub use policy::ReconnectPolicy;
pub use websocket::WebSocketConnector;

use crate::config::ChannelConfig;
use crate::error::SyncError;
use crate::event::ChannelEvent;
use crate::scheduler::{Scheduler, TimerId};

const TARGET: &str = "notesync::channel";

/// Floor for the heartbeat period; a zero interval would re-arm the ping
/// timer forever without yielding.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Clone)]
pub struct ReconnectingChannel {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    scheduler: Arc<dyn Scheduler>,
    bus: Arc<EventBus>,
    heartbeat_interval: Duration,
    shared: Mutex<Shared>,
}

struct Shared {
    state: ConnectionState,
    policy: ReconnectPolicy,
    endpoint: Option<Endpoint>,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// Resolves once the current link's transport has flushed and shut.
    finished: Option<oneshot::Receiver<()>>,
    /// Dial task while connecting, reader task while open.
    task: Option<JoinHandle<()>>,
    heartbeat: Option<TimerId>,
    reconnect: Option<TimerId>,
}

impl Shared {
    fn stop_timers(&mut self, scheduler: &dyn Scheduler) {
        if let Some(id) = self.heartbeat.take() {
            scheduler.cancel(id);
        }
        if let Some(id) = self.reconnect.take() {
            scheduler.cancel(id);
        }
    }
}

impl ReconnectingChannel {
    pub fn new(
        connector: Arc<dyn Connector>,
        scheduler: Arc<dyn Scheduler>,
        bus: Arc<EventBus>,
        config: &ChannelConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                scheduler,
                bus,
                heartbeat_interval: config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL),
                shared: Mutex::new(Shared {
                    state: ConnectionState::Idle,
                    policy: ReconnectPolicy::new(config.base_delay, config.max_attempts),
                    endpoint: None,
                    generation: 0,
                    outbound: None,
                    finished: None,
                    task: None,
                    heartbeat: None,
                    reconnect: None,
                }),
            }),
        }
    }

    /// Starts connecting to `endpoint`. No-op while a connection is open or
    /// being established.
    ///
    /// An explicit open also clears the reconnect budget, so a channel that
    /// gave up after exhausting its attempts starts over from attempt one.
    /// Must be called from within a tokio runtime.
    pub fn open(&self, endpoint: Endpoint) {
        let mut shared = self.inner.shared.lock();
        if matches!(
            shared.state,
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            debug!(target: TARGET, state = ?shared.state, "open ignored; connection already active");
            return;
        }
        if let Some(id) = shared.reconnect.take() {
            self.inner.scheduler.cancel(id);
        }
        shared.policy.reset();
        info!(target: TARGET, %endpoint, "opening channel");
        shared.endpoint = Some(endpoint);
        self.inner.begin_dial(&mut shared);
    }

    /// Closes the connection, stops the heartbeat and cancels any pending
    /// reconnection. Subscriptions on the bus are left alone.
    ///
    /// Frames already queued are still written by the transport in the
    /// background; use [`ReconnectingChannel::close_gracefully`] to wait for
    /// that. Background tasks keep the channel alive until it is closed, so
    /// hosts should close before dropping their last handle.
    pub fn close(&self) {
        drop(self.release());
    }

    /// [`ReconnectingChannel::close`], then waits until the transport has
    /// written every queued frame and shut the connection.
    pub async fn close_gracefully(&self) {
        if let Some(finished) = self.release() {
            let _ = finished.await;
            debug!(target: TARGET, "transport flushed");
        }
    }

    fn release(&self) -> Option<oneshot::Receiver<()>> {
        let (previous, finished) = {
            let mut shared = self.inner.shared.lock();
            let previous = shared.state;
            if previous == ConnectionState::Idle
                || (previous == ConnectionState::Closed && shared.reconnect.is_none())
            {
                return None;
            }
            debug!(target: TARGET, state = ?previous, "closing channel");
            shared.state = ConnectionState::Closing;
            shared.generation += 1;
            shared.stop_timers(self.inner.scheduler.as_ref());
            shared.outbound = None;
            if let Some(task) = shared.task.take() {
                task.abort();
            }
            shared.state = ConnectionState::Closed;
            (previous, shared.finished.take())
        };

        info!(target: TARGET, "channel closed");
        if previous == ConnectionState::Open {
            self.inner.bus.publish(EventKind::Disconnected, &json!({}));
        }
        finished
    }

    /// Queues `event` on the live connection.
    ///
    /// Returns `false` when the event was dropped because the channel is not
    /// open; callers racing a disconnect get a warning in the log, never an
    /// error.
    pub fn send(&self, event: &ChannelEvent) -> bool {
        if event.kind.is_lifecycle() {
            warn!(target: TARGET, kind = %event.kind, "lifecycle events are local-only; not sending");
            return false;
        }
        let shared = self.inner.shared.lock();
        let outbound = match (shared.state, shared.outbound.as_ref()) {
            (ConnectionState::Open, Some(outbound)) => outbound,
            (state, _) => {
                warn!(target: TARGET, kind = %event.kind, ?state, "channel is not open; dropping outbound event");
                return false;
            }
        };
        match event.encode() {
            Ok(frame) => {
                if outbound.send(frame).is_ok() {
                    trace!(target: TARGET, kind = %event.kind, "queued outbound event");
                    true
                } else {
                    warn!(target: TARGET, kind = %event.kind, "link already released; dropping outbound event");
                    false
                }
            }
            Err(err) => {
                error!(target: TARGET, kind = %event.kind, error = %err, "failed to encode outbound event");
                false
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Reconnection attempts made since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.inner.shared.lock().policy.attempt()
    }

    /// True once the channel has given up and waits for an explicit `open`.
    pub fn is_exhausted(&self) -> bool {
        let shared = self.inner.shared.lock();
        shared.state == ConnectionState::Closed
            && shared.reconnect.is_none()
            && shared.policy.is_exhausted()
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.shared.lock().endpoint.clone()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }
}

impl fmt::Debug for ReconnectingChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("ReconnectingChannel")
            .field("state", &shared.state)
            .field("attempt", &shared.policy.attempt())
            .field("endpoint", &shared.endpoint)
            .finish()
    }
}

impl Inner {
    fn begin_dial(self: &Arc<Self>, shared: &mut Shared) {
        shared.generation += 1;
        shared.state = ConnectionState::Connecting;
        shared.task = Some(tokio::spawn(Arc::clone(self).dial(shared.generation)));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared.lock().generation == generation
    }

    async fn dial(self: Arc<Self>, generation: u64) {
        let endpoint = {
            let shared = self.shared.lock();
            if shared.generation != generation {
                return;
            }
            match shared.endpoint.clone() {
                Some(endpoint) => endpoint,
                None => return,
            }
        };

        debug!(target: TARGET, %endpoint, generation, "dialing");
        match self.connector.connect(&endpoint).await {
            Ok(link) => self.established(generation, link),
            Err(err) => self.connection_lost(generation, Some(err)),
        }
    }

    fn established(self: &Arc<Self>, generation: u64, link: Link) {
        let (outbound, inbound, finished) = link.into_parts();
        {
            let mut shared = self.shared.lock();
            if shared.generation != generation || shared.state != ConnectionState::Connecting {
                debug!(target: TARGET, generation, "discarding link from superseded attempt");
                return;
            }
            shared.state = ConnectionState::Open;
            shared.policy.reset();
            shared.outbound = Some(outbound);
            shared.finished = finished;
            shared.heartbeat = Some(self.schedule_heartbeat(generation));
        }

        info!(target: TARGET, "channel connected");
        self.bus.publish(EventKind::Connected, &json!({}));

        // A `connected` listener may already have closed or reopened us.
        let mut shared = self.shared.lock();
        if shared.generation == generation && shared.state == ConnectionState::Open {
            shared.task = Some(tokio::spawn(
                Arc::clone(self).read_frames(generation, inbound),
            ));
        }
    }

    async fn read_frames(
        self: Arc<Self>,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        while let Some(event) = inbound.recv().await {
            if !self.is_current(generation) {
                return;
            }
            match event {
                LinkEvent::Frame(text) => self.deliver(&text),
                LinkEvent::Failed(reason) => {
                    self.connection_lost(generation, Some(SyncError::Connection(reason)));
                    return;
                }
                LinkEvent::Closed => {
                    self.connection_lost(generation, None);
                    return;
                }
            }
        }
        self.connection_lost(generation, None);
    }

    fn deliver(&self, text: &str) {
        match ChannelEvent::decode(text) {
            Ok(event) => {
                trace!(target: TARGET, kind = %event.kind, "inbound event");
                self.bus.publish(event.kind, &event.payload);
            }
            Err(err) => {
                error!(target: TARGET, error = %err, "dropping undecodable frame");
            }
        }
    }

    /// Shared exit path for failed dials, transport errors and peer closes.
    fn connection_lost(self: &Arc<Self>, generation: u64, error: Option<SyncError>) {
        {
            let mut shared = self.shared.lock();
            if shared.generation != generation
                || !matches!(
                    shared.state,
                    ConnectionState::Open | ConnectionState::Connecting
                )
            {
                return;
            }
            shared.state = ConnectionState::Closed;
            shared.outbound = None;
            shared.finished = None;
            shared.task = None;
            shared.stop_timers(self.scheduler.as_ref());
        }

        if let Some(err) = &error {
            warn!(target: TARGET, error = %err, "channel error");
            self.bus
                .publish(EventKind::Error, &json!({ "message": err.to_string() }));
        }
        info!(target: TARGET, "channel disconnected");
        self.bus.publish(EventKind::Disconnected, &json!({}));

        self.schedule_reconnect(generation);
    }

    fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let mut shared = self.shared.lock();
        if shared.generation != generation
            || shared.state != ConnectionState::Closed
            || shared.reconnect.is_some()
        {
            return;
        }
        match shared.policy.next_attempt() {
            Some((attempt, delay)) => {
                info!(
                    target: TARGET,
                    attempt,
                    max_attempts = shared.policy.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                let weak = Arc::downgrade(self);
                let id = self.scheduler.schedule(
                    delay,
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.reconnect(generation);
                        }
                    }),
                );
                shared.reconnect = Some(id);
            }
            None => {
                let err = SyncError::ExhaustedRetries {
                    attempts: shared.policy.max_attempts(),
                };
                error!(target: TARGET, error = %err, "giving up on channel");
            }
        }
    }

    fn reconnect(self: &Arc<Self>, generation: u64) {
        let mut shared = self.shared.lock();
        if shared.generation != generation || shared.state != ConnectionState::Closed {
            return;
        }
        shared.reconnect = None;
        info!(
            target: TARGET,
            attempt = shared.policy.attempt(),
            max_attempts = shared.policy.max_attempts(),
            "attempting reconnect"
        );
        self.begin_dial(&mut shared);
    }

    fn schedule_heartbeat(self: &Arc<Self>, generation: u64) -> TimerId {
        let weak = Arc::downgrade(self);
        self.scheduler.schedule(
            self.heartbeat_interval,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.heartbeat(generation);
                }
            }),
        )
    }

    fn heartbeat(self: &Arc<Self>, generation: u64) {
        let mut shared = self.shared.lock();
        if shared.generation != generation || shared.state != ConnectionState::Open {
            return;
        }
        if let Some(outbound) = shared.outbound.as_ref() {
            match ChannelEvent::ping().encode() {
                Ok(frame) => {
                    if outbound.send(frame).is_ok() {
                        trace!(target: TARGET, "heartbeat sent");
                    } else {
                        debug!(target: TARGET, "heartbeat skipped; link released");
                    }
                }
                Err(err) => warn!(target: TARGET, error = %err, "failed to encode heartbeat"),
            }
        }
        shared.heartbeat = Some(self.schedule_heartbeat(generation));
    }
}
