use std::fmt;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::config::pin_loopback_host;
use crate::error::{SyncError, SyncResult};

/// WebSocket address of the live channel, optionally scoped to one note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Builds an endpoint from a base address and an optional note room.
    ///
    /// Addresses without a scheme get `ws://` for loopback hosts and `wss://`
    /// otherwise. Any scheme other than `ws`/`wss` is rejected.
    pub fn parse(base: &str, note_id: Option<&str>) -> SyncResult<Self> {
        let base = base.trim();
        if base.is_empty() {
            return Err(SyncError::InvalidEndpoint("empty address".into()));
        }
        let host = base.split([':', '/']).next().unwrap_or_default();
        let with_scheme = if base.contains("://") {
            base.to_string()
        } else if host == "localhost" || host == "127.0.0.1" {
            format!("ws://{base}")
        } else {
            format!("wss://{base}")
        };
        let mut url = Url::parse(&with_scheme)
            .map_err(|err| SyncError::InvalidEndpoint(format!("{base}: {err}")))?;
        pin_loopback_host(&mut url);
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(SyncError::InvalidEndpoint(format!(
                "{base}: scheme must be ws or wss"
            )));
        }
        if let Some(note_id) = note_id.filter(|id| !id.is_empty()) {
            url.query_pairs_mut().append_pair("note_id", note_id);
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn note_id(&self) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == "note_id")
            .map(|(_, value)| value.into_owned())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// What a link reports back to the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One inbound text frame.
    Frame(String),
    /// The transport failed; the link is dead.
    Failed(String),
    /// The peer closed the link.
    Closed,
}

/// An established connection as seen by the channel: a sender for outbound
/// text frames and a receiver for inbound [`LinkEvent`]s.
///
/// Dropping the outbound sender asks the transport to close the connection.
/// Transports that write on a background task may also hand over a
/// `finished` receiver, which resolves once every queued frame has been
/// written and the connection is shut.
#[derive(Debug)]
pub struct Link {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
    finished: Option<oneshot::Receiver<()>>,
}

impl Link {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            finished: None,
        }
    }

    /// Attaches the transport's completion signal. Dropping the paired
    /// sender counts as finished.
    pub fn with_finished(mut self, finished: oneshot::Receiver<()>) -> Self {
        self.finished = Some(finished);
        self
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<LinkEvent>,
        Option<oneshot::Receiver<()>>,
    ) {
        (self.outbound, self.inbound, self.finished)
    }
}

/// Dials an endpoint and hands back a live [`Link`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> SyncResult<Link>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_note_room() {
        let endpoint = Endpoint::parse("ws://127.0.0.1:8000/ws", Some("n-42")).unwrap();
        assert_eq!(endpoint.url().as_str(), "ws://127.0.0.1:8000/ws?note_id=n-42");
        assert_eq!(endpoint.note_id().as_deref(), Some("n-42"));
    }

    #[test]
    fn global_room_has_no_query() {
        let endpoint = Endpoint::parse("wss://notes.example.com/ws", None).unwrap();
        assert_eq!(endpoint.to_string(), "wss://notes.example.com/ws");
        assert_eq!(endpoint.note_id(), None);
    }

    #[test]
    fn infers_scheme_and_normalizes_localhost() {
        let local = Endpoint::parse("localhost:8000/ws", None).unwrap();
        assert_eq!(local.url().as_str(), "ws://127.0.0.1:8000/ws");

        let remote = Endpoint::parse("notes.example.com/ws", None).unwrap();
        assert_eq!(remote.url().scheme(), "wss");

        let lookalike = Endpoint::parse("localhost.example.com/ws", None).unwrap();
        assert_eq!(lookalike.url().as_str(), "wss://localhost.example.com/ws");
    }

    #[test]
    fn localhost_inside_host_or_path_is_kept() {
        let endpoint = Endpoint::parse("wss://devlocalhost.example.com/ws", None).unwrap();
        assert_eq!(endpoint.url().host_str(), Some("devlocalhost.example.com"));

        let endpoint = Endpoint::parse("wss://notes.example.com/localhost/ws", None).unwrap();
        assert_eq!(endpoint.url().host_str(), Some("notes.example.com"));
        assert_eq!(endpoint.url().path(), "/localhost/ws");

        let endpoint = Endpoint::parse("ws://localhost:8000/localhost/ws", Some("n-1")).unwrap();
        assert_eq!(
            endpoint.url().as_str(),
            "ws://127.0.0.1:8000/localhost/ws?note_id=n-1"
        );
    }

    #[test]
    fn rejects_non_websocket_schemes() {
        assert!(matches!(
            Endpoint::parse("http://127.0.0.1:8000/ws", None),
            Err(SyncError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::parse("   ", None),
            Err(SyncError::InvalidEndpoint(_))
        ));
    }
}
