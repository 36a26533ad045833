//! Server-sent event ingestion for the AI processing endpoint.
//!
//! The response body is a sequence of `data: <json>` lines terminated by
//! `data: [DONE]`. Each JSON frame carries either a `content` fragment or an
//! `error` message.

use std::fmt;
use std::future::Future;
use std::pin::pin;

use futures::future::{AbortHandle, Abortable};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::SyncError;

const TARGET: &str = "notesync::ingest";

pub const DATA_MARKER: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";

/// How an ingestion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// `[DONE]` arrived; `on_complete` ran.
    Completed,
    /// `on_error` ran with the reason.
    Failed,
    /// The host aborted; no terminal callback ran.
    Aborted,
}

enum Termination {
    Done,
    Failed(SyncError),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StreamIngestor;

impl StreamIngestor {
    pub fn new() -> Self {
        Self
    }

    /// Reads `stream` to the end of the event sequence.
    ///
    /// `on_fragment` runs once per non-empty `content` fragment, in arrival
    /// order. Exactly one of `on_complete` or `on_error` runs afterwards. The
    /// stream is dropped before either terminal callback, and on every other
    /// exit path too, including dropping the returned future.
    pub async fn ingest<S, B, E, F, R, C>(
        self,
        stream: S,
        mut on_fragment: F,
        on_error: R,
        on_complete: C,
    ) -> IngestOutcome
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: fmt::Display,
        F: FnMut(&str),
        R: FnOnce(SyncError),
        C: FnOnce(),
    {
        match read_events(stream, &mut on_fragment).await {
            Termination::Done => {
                debug!(target: TARGET, "stream completed");
                on_complete();
                IngestOutcome::Completed
            }
            Termination::Failed(err) => {
                warn!(target: TARGET, error = %err, "stream failed");
                on_error(err);
                IngestOutcome::Failed
            }
        }
    }

    /// Like [`StreamIngestor::ingest`], paired with a handle that cancels it.
    ///
    /// Aborting releases the stream at the next suspension point and resolves
    /// the future to [`IngestOutcome::Aborted`] without calling `on_error` or
    /// `on_complete`.
    pub fn ingest_abortable<S, B, E, F, R, C>(
        self,
        stream: S,
        on_fragment: F,
        on_error: R,
        on_complete: C,
    ) -> (impl Future<Output = IngestOutcome>, AbortHandle)
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: fmt::Display,
        F: FnMut(&str),
        R: FnOnce(SyncError),
        C: FnOnce(),
    {
        let (handle, registration) = AbortHandle::new_pair();
        let task = Abortable::new(
            async move {
                self.ingest(stream, on_fragment, on_error, on_complete)
                    .await
            },
            registration,
        );
        let future = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(target: TARGET, "ingestion aborted");
                    IngestOutcome::Aborted
                }
            }
        };
        (future, handle)
    }
}

/// Owns the stream for the duration of the read; it is dropped on return.
async fn read_events<S, B, E, F>(stream: S, on_fragment: &mut F) -> Termination
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
    F: FnMut(&str),
{
    let mut stream = pin!(stream);
    let mut carry: Vec<u8> = Vec::new();

    while let Some(item) = stream.next().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => return Termination::Failed(SyncError::Connection(err.to_string())),
        };
        // Bytes before `scanned` hold no newline; `start` is the first byte
        // of the unfinished line.
        let scanned = carry.len();
        carry.extend_from_slice(chunk.as_ref());

        let mut start = 0;
        let mut cursor = scanned;
        while let Some(offset) = carry[cursor..].iter().position(|byte| *byte == b'\n') {
            let newline = cursor + offset;
            if let Some(end) = process_line(&carry[start..newline], on_fragment) {
                return end;
            }
            start = newline + 1;
            cursor = start;
        }
        carry.drain(..start);
    }

    if !carry.is_empty() {
        if let Some(end) = process_line(&carry, on_fragment) {
            return end;
        }
    }
    Termination::Failed(SyncError::Connection(format!(
        "stream ended before {DONE_SENTINEL}"
    )))
}

fn process_line<F>(raw: &[u8], on_fragment: &mut F) -> Option<Termination>
where
    F: FnMut(&str),
{
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line,
        Err(err) => {
            warn!(target: TARGET, error = %err, "ignoring line with invalid utf-8");
            return None;
        }
    };

    let data = line.strip_prefix(DATA_MARKER)?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.trim().is_empty() {
        return None;
    }
    if data.trim_end() == DONE_SENTINEL {
        return Some(Termination::Done);
    }

    let frame: Value = match serde_json::from_str(data) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(target: TARGET, error = %err, data, "ignoring malformed event");
            return None;
        }
    };

    match frame.get("content") {
        Some(Value::String(content)) if !content.is_empty() => {
            on_fragment(content);
            return None;
        }
        _ => {}
    }

    match frame.get("error") {
        None | Some(Value::Null) => {
            trace!(target: TARGET, "event without content");
            None
        }
        Some(Value::String(message)) => {
            Some(Termination::Failed(SyncError::StreamTermination(message.clone())))
        }
        Some(other) => Some(Termination::Failed(SyncError::StreamTermination(
            other.to_string(),
        ))),
    }
}
