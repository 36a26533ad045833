use std::time::Duration;

use anyhow::{bail, Context, Result};
use notesync::{ChannelEvent, EventKind, Listener, SyncConfig, SyncRuntime};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{info, warn};

const EXHAUSTION_POLL: Duration = Duration::from_millis(250);

pub async fn listen(
    config: SyncConfig,
    note_id: Option<String>,
    kinds: Vec<EventKind>,
) -> Result<()> {
    let runtime = SyncRuntime::websocket(config);
    let kinds = if kinds.is_empty() {
        EventKind::ALL
            .into_iter()
            .filter(|kind| !kind.is_lifecycle())
            .collect()
    } else {
        kinds
    };
    for kind in kinds {
        runtime.bus().subscribe(
            kind,
            &Listener::new(move |payload| {
                match ChannelEvent::new(kind, payload.clone()).encode() {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(%kind, error = %err, "failed to print event"),
                }
            }),
        );
    }
    runtime.bus().subscribe(
        EventKind::Connected,
        &Listener::new(|_| info!("connected")),
    );
    runtime.bus().subscribe(
        EventKind::Error,
        &Listener::new(|payload| warn!(reason = %payload["message"], "channel error")),
    );

    let endpoint = runtime
        .endpoint(note_id.as_deref())
        .context("invalid websocket address")?;
    info!(%endpoint, "listening");
    runtime.channel().open(endpoint.clone());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut poll = tokio::time::interval(EXHAUSTION_POLL);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            _ = poll.tick() => {
                if runtime.channel().is_exhausted() {
                    runtime.shutdown();
                    bail!("gave up reconnecting to {endpoint}");
                }
            }
        }
    }

    runtime.shutdown();
    Ok(())
}

pub async fn send(
    config: SyncConfig,
    note_id: Option<String>,
    kind: EventKind,
    payload: &str,
    wait: Duration,
) -> Result<()> {
    if kind.is_lifecycle() {
        bail!("`{kind}` is raised locally and cannot be sent");
    }
    let payload: Value = serde_json::from_str(payload).context("payload must be valid JSON")?;

    let runtime = SyncRuntime::websocket(config);
    let (connected_tx, connected_rx) = oneshot::channel();
    let connected_tx = Mutex::new(Some(connected_tx));
    runtime.bus().subscribe(
        EventKind::Connected,
        &Listener::new(move |_| {
            if let Some(tx) = connected_tx.lock().take() {
                let _ = tx.send(());
            }
        }),
    );
    runtime
        .connect(note_id.as_deref())
        .context("invalid websocket address")?;

    if !matches!(timeout(wait, connected_rx).await, Ok(Ok(()))) {
        runtime.shutdown();
        bail!("channel did not connect within {}s", wait.as_secs());
    }

    let sent = runtime.channel().send(&ChannelEvent::new(kind, payload));
    if timeout(wait, runtime.shutdown_gracefully()).await.is_err() {
        warn!(%kind, "socket did not close within {}s", wait.as_secs());
    }

    if !sent {
        bail!("channel closed before `{kind}` could be sent");
    }
    info!(%kind, "event sent");
    Ok(())
}
