use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::connector::{Connector, Endpoint, Link, LinkEvent};
use crate::error::{SyncError, SyncResult};

const TARGET: &str = "notesync::websocket";

/// [`Connector`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &Endpoint) -> SyncResult<Link> {
        let (ws_stream, _) =
            match tokio::time::timeout(self.connect_timeout, connect_async(endpoint.url().as_str()))
                .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => return Err(SyncError::Connection(err.to_string())),
                Err(_) => {
                    return Err(SyncError::Connection(format!(
                        "timed out after {}ms",
                        self.connect_timeout.as_millis()
                    )))
                }
            };

        let (tx_out, rx_out) = mpsc::unbounded_channel::<String>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<LinkEvent>();
        let (finished_tx, finished_rx) = oneshot::channel();
        tokio::spawn(async move {
            handle_websocket(ws_stream, rx_out, tx_in).await;
            let _ = finished_tx.send(());
        });

        Ok(Link::new(tx_out, rx_in).with_finished(finished_rx))
    }
}

/// Pumps frames between the socket and the link until either side goes away.
///
/// Outbound frames win over inbound reads, so everything the channel queued
/// before releasing the link is written ahead of the Close frame.
async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<String>,
    tx_in: mpsc::UnboundedSender<LinkEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            biased;
            outbound = rx_out.recv() => match outbound {
                Some(text) => {
                    if let Err(err) = ws_sender.send(Message::Text(text)).await {
                        let _ = tx_in.send(LinkEvent::Failed(err.to_string()));
                        break;
                    }
                }
                None => {
                    // Channel released the link.
                    debug!(target: TARGET, "closing websocket");
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = ws_receiver.next() => match inbound {
                // A released link has no reader; keep pumping until the
                // outbound side drains and closes.
                Some(Ok(Message::Text(text))) => {
                    let _ = tx_in.send(LinkEvent::Frame(text));
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        let _ = tx_in.send(LinkEvent::Frame(text));
                    }
                    Err(err) => {
                        warn!(target: TARGET, error = %err, "dropping non-utf8 binary frame");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(target: TARGET, ?frame, "peer closed websocket");
                    let _ = tx_in.send(LinkEvent::Closed);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = tx_in.send(LinkEvent::Failed(err.to_string()));
                    break;
                }
                None => {
                    let _ = tx_in.send(LinkEvent::Closed);
                    break;
                }
            },
        }
    }
}
