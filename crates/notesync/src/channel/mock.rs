use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::connector::{Connector, Endpoint, Link, LinkEvent};
use crate::error::{SyncError, SyncResult};

enum Dial {
    Refuse(String),
    Accept(Link),
}

/// Scripted in-memory [`Connector`] for tests.
///
/// Each dial consumes the next scripted outcome; an empty script refuses.
#[derive(Default)]
pub struct MockConnector {
    script: Mutex<VecDeque<Dial>>,
    dialed: Mutex<Vec<Endpoint>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_next(&self, reason: impl Into<String>) {
        self.script.lock().push_back(Dial::Refuse(reason.into()));
    }

    /// Scripts a successful dial and returns the server side of that link.
    pub fn accept_next(&self) -> MockPeer {
        let (tx_out, rx_out) = mpsc::unbounded_channel();
        let (tx_in, rx_in) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = oneshot::channel();
        self.script.lock().push_back(Dial::Accept(
            Link::new(tx_out, rx_in).with_finished(finished_rx),
        ));
        MockPeer {
            sent: rx_out,
            events: tx_in,
            finished: Mutex::new(Some(finished_tx)),
        }
    }

    pub fn dial_count(&self) -> usize {
        self.dialed.lock().len()
    }

    pub fn dialed(&self) -> Vec<Endpoint> {
        self.dialed.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint) -> SyncResult<Link> {
        self.dialed.lock().push(endpoint.clone());
        let next = self.script.lock().pop_front();
        match next {
            Some(Dial::Accept(link)) => Ok(link),
            Some(Dial::Refuse(reason)) => Err(SyncError::Connection(reason)),
            None => Err(SyncError::Connection("no scripted dial".into())),
        }
    }
}

/// Server end of a mocked link.
pub struct MockPeer {
    sent: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<LinkEvent>,
    finished: Mutex<Option<oneshot::Sender<()>>>,
}

impl MockPeer {
    pub fn push_frame(&self, text: impl Into<String>) {
        let _ = self.events.send(LinkEvent::Frame(text.into()));
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.events.send(LinkEvent::Failed(reason.into()));
    }

    pub fn close(&self) {
        let _ = self.events.send(LinkEvent::Closed);
    }

    /// Reports the transport as flushed and shut, releasing a pending
    /// graceful close.
    pub fn finish(&self) {
        if let Some(finished) = self.finished.lock().take() {
            let _ = finished.send(());
        }
    }

    /// Next frame the client sent, or `None` once the client released the
    /// link and everything queued has been read.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    /// Frames sent so far without waiting.
    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// True once the client dropped its side of the link.
    pub fn is_released(&self) -> bool {
        self.events.is_closed()
    }
}
