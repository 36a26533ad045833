use std::sync::Arc;

use event_bus::EventBus;
use tracing::info;

use crate::channel::{Connector, Endpoint, ReconnectingChannel, WebSocketConnector};
use crate::coalescer::FrameCoalescer;
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::ingest::StreamIngestor;
use crate::scheduler::{Scheduler, TokioScheduler};

/// One client's sync state: the event bus, the live channel on top of it,
/// and the scheduler both of them and any coalescers share.
///
/// Hosts construct one per session and call [`SyncRuntime::shutdown`] when
/// the session ends.
#[derive(Clone)]
pub struct SyncRuntime {
    config: SyncConfig,
    bus: Arc<EventBus>,
    channel: ReconnectingChannel,
    scheduler: Arc<dyn Scheduler>,
}

impl SyncRuntime {
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let channel = ReconnectingChannel::new(
            connector,
            Arc::clone(&scheduler),
            Arc::clone(&bus),
            &config.channel,
        );
        Self {
            config,
            bus,
            channel,
            scheduler,
        }
    }

    /// Runtime over real WebSockets and tokio timers.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn websocket(config: SyncConfig) -> Self {
        let connector = Arc::new(WebSocketConnector::new(config.channel.connect_timeout));
        Self::new(config, connector, Arc::new(TokioScheduler::current()))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn channel(&self) -> &ReconnectingChannel {
        &self.channel
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Channel endpoint for `note_id`, or the global room for `None`.
    pub fn endpoint(&self, note_id: Option<&str>) -> SyncResult<Endpoint> {
        Endpoint::parse(&self.config.ws_url, note_id)
    }

    /// Opens the live channel for a note room.
    pub fn connect(&self, note_id: Option<&str>) -> SyncResult<()> {
        let endpoint = self.endpoint(note_id)?;
        self.channel.open(endpoint);
        Ok(())
    }

    pub fn ingestor(&self) -> StreamIngestor {
        StreamIngestor::new()
    }

    /// Coalescer on the shared scheduler at the configured frame interval.
    pub fn coalescer<F>(&self, on_flush: F) -> FrameCoalescer
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        FrameCoalescer::with_interval(
            Arc::clone(&self.scheduler),
            self.config.frame_interval,
            on_flush,
        )
    }

    /// Closes the channel and drops every subscription.
    pub fn shutdown(&self) {
        info!(target: "notesync::runtime", "shutting down sync runtime");
        self.channel.close();
        self.bus.clear();
    }

    /// [`SyncRuntime::shutdown`] that also waits for frames already queued
    /// on the live connection to reach the wire.
    pub async fn shutdown_gracefully(&self) {
        info!(target: "notesync::runtime", "shutting down sync runtime");
        self.channel.close_gracefully().await;
        self.bus.clear();
    }
}
