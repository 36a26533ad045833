//! Client-side live sync for notesync.
//!
//! - [`ReconnectingChannel`] keeps a WebSocket to the notes backend alive and
//!   publishes what arrives onto an [`EventBus`].
//! - [`StreamIngestor`] decodes the AI endpoint's server-sent events.
//! - [`FrameCoalescer`] batches streamed text into one update per frame.
//! - [`SyncRuntime`] wires the pieces together for one session.

pub mod channel;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod event;
pub mod ingest;
pub mod runtime;
pub mod scheduler;

pub use channel::{
    ConnectionState, Connector, Endpoint, Link, LinkEvent, MockConnector, MockPeer,
    ReconnectPolicy, ReconnectingChannel, WebSocketConnector, MIN_HEARTBEAT_INTERVAL,
};
pub use coalescer::{FrameCoalescer, DEFAULT_FRAME_INTERVAL};
pub use config::{ChannelConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use event::{ChannelEvent, Note, NoteRef};
pub use event_bus::{EventBus, EventKind, Listener, Payload};
pub use ingest::{IngestOutcome, StreamIngestor};
pub use runtime::SyncRuntime;
pub use scheduler::{ManualScheduler, Scheduler, TimerId, TokioScheduler};
