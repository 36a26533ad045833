use std::fmt::Display;
use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::Stream;
use notesync::{
    FrameCoalescer, IngestOutcome, Scheduler, StreamIngestor, SyncConfig, TokioScheduler,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
struct ProcessRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    note_id: Option<&'a str>,
}

/// Posts `text` to the AI endpoint and renders the streamed edit on stdout.
pub async fn process(config: SyncConfig, text: &str, note: Option<&str>) -> Result<()> {
    let url = format!("{}/api/ai/process", config.api_url.trim_end_matches('/'));
    let client = reqwest::Client::new();
    let mut request = client.post(&url).json(&ProcessRequest {
        text,
        note_id: note,
    });
    if let Some(token) = &config.token {
        request = request.bearer_auth(token);
    }

    debug!(%url, "requesting ai edit");
    let response = request
        .send()
        .await
        .with_context(|| format!("POST {url}"))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("{url} returned {status}: {body}");
    }

    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    match render(
        response.bytes_stream(),
        io::stdout(),
        Arc::new(TokioScheduler::current()),
        config.frame_interval,
        interrupt,
    )
    .await?
    {
        IngestOutcome::Aborted => info!("ai edit cancelled"),
        outcome => debug!(?outcome, "ai edit finished"),
    }
    Ok(())
}

/// Where coalesced frames go. The first write failure is kept and later
/// frames are discarded.
struct Output<W> {
    writer: W,
    error: Option<io::Error>,
}

impl<W: Write> Output<W> {
    fn write(&mut self, text: &str) -> bool {
        if self.error.is_some() {
            return false;
        }
        let result = self
            .writer
            .write_all(text.as_bytes())
            .and_then(|()| self.writer.flush());
        match result {
            Ok(()) => true,
            Err(err) => {
                self.error = Some(err);
                false
            }
        }
    }
}

/// Feeds `body` through the ingestor and a frame coalescer into `out`.
///
/// `interrupt` firing, or `out` failing a write, aborts the stream. A write
/// failure and a failed stream are both errors; an interrupt resolves to
/// [`IngestOutcome::Aborted`].
async fn render<S, B, E, W, I>(
    body: S,
    out: W,
    scheduler: Arc<dyn Scheduler>,
    frame_interval: Duration,
    interrupt: I,
) -> Result<IngestOutcome>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
    W: Write + Send + 'static,
    I: Future<Output = ()>,
{
    let output = Arc::new(Mutex::new(Output {
        writer: out,
        error: None,
    }));
    let write_failed = Arc::new(Notify::new());

    let coalescer = {
        let output = Arc::clone(&output);
        let write_failed = Arc::clone(&write_failed);
        FrameCoalescer::with_interval(scheduler, frame_interval, move |text| {
            if !output.lock().write(&text) {
                write_failed.notify_one();
            }
        })
    };

    let mut failure = None;
    let outcome = {
        let on_complete = coalescer.clone();
        let (ingest, abort) = StreamIngestor::new().ingest_abortable(
            body,
            |fragment| coalescer.append(fragment),
            |err| failure = Some(err),
            move || on_complete.flush(),
        );
        tokio::pin!(ingest);
        tokio::pin!(interrupt);
        tokio::select! {
            outcome = &mut ingest => outcome,
            _ = &mut interrupt => {
                abort.abort();
                ingest.await
            }
            _ = write_failed.notified() => {
                warn!("output closed; abandoning ai stream");
                abort.abort();
                ingest.await
            }
        }
    };

    // Deliver whatever arrived before a failure or interrupt.
    coalescer.flush();
    let mut output = output.lock();
    output.write("\n");
    if let Some(err) = output.error.take() {
        return Err(anyhow::Error::new(err).context("failed to write ai edit"));
    }

    match outcome {
        IngestOutcome::Failed => Err(failure
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow!("ai stream failed"))),
        outcome => Ok(outcome),
    }
}
