//! Asynchronous, non-blocking trace writer.
//!
//! Producers call [`TraceHandle::record`], which never awaits: events go
//! into a bounded channel with `try_send`, and a full channel drops the
//! event and counts it. A background task drains the channel into the
//! trace file. Write failures are counted and logged; they never reach
//! the run that produced the events.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{EventKind, Stage, TraceEvent};

/// Counters reported when a logger is finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub events_written: u64,
    pub events_dropped: u64,
    pub write_errors: u64,
}

struct Sequencer {
    next: u64,
    tx: Option<mpsc::Sender<TraceEvent>>,
}

struct HandleInner {
    run_id: String,
    sequencer: Mutex<Sequencer>,
    dropped: AtomicU64,
}

/// Cheap, cloneable producer side of a run's trace.
#[derive(Clone)]
pub struct TraceHandle {
    inner: Arc<HandleInner>,
}

impl TraceHandle {
    /// A handle that discards everything. Useful for tests and for tools
    /// that only need the pure parts of the harness.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                run_id: String::new(),
                sequencer: Mutex::new(Sequencer { next: 0, tx: None }),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Appends an event. Never blocks and never fails.
    pub fn record(&self, stage: Stage, kind: EventKind) {
        let Ok(mut guard) = self.inner.sequencer.lock() else {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let seq: &mut Sequencer = &mut guard;
        let Some(tx) = seq.tx.as_ref() else {
            return;
        };
        let event = TraceEvent {
            seq: seq.next,
            timestamp: Utc::now(),
            run_id: self.inner.run_id.clone(),
            stage,
            kind,
        };
        // Sequence numbers are assigned under the same lock as the send, so
        // file order always matches sequence order.
        match tx.try_send(event) {
            Ok(()) => seq.next += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 {
                    warn!(run_id = %self.inner.run_id, "Trace buffer full, dropping events");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Shorthand for a diagnostic message.
    pub fn diagnostic(&self, stage: Stage, message: impl Into<String>) {
        self.record(
            stage,
            EventKind::Diagnostic {
                message: message.into(),
            },
        );
    }

    fn close(&self) {
        if let Ok(mut seq) = self.inner.sequencer.lock() {
            seq.tx = None;
        }
    }

    fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// Owner of a run's trace writer task.
pub struct ArtifactLogger {
    handle: TraceHandle,
    writer: JoinHandle<(u64, u64)>,
    path: PathBuf,
}

impl ArtifactLogger {
    /// Starts a writer appending to `path`. Must be called inside a Tokio runtime.
    pub fn spawn(run_id: impl Into<String>, path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = TraceHandle {
            inner: Arc::new(HandleInner {
                run_id: run_id.into(),
                sequencer: Mutex::new(Sequencer {
                    next: 0,
                    tx: Some(tx),
                }),
                dropped: AtomicU64::new(0),
            }),
        };
        let writer = tokio::spawn(write_events(path.clone(), rx));
        Self {
            handle,
            writer,
            path,
        }
    }

    /// Returns a producer handle.
    pub fn handle(&self) -> TraceHandle {
        self.handle.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the channel, waits for buffered events to be flushed, and
    /// returns the counters. Events recorded after this call are dropped.
    pub async fn finish(self) -> TraceSummary {
        self.handle.close();
        let (written, write_errors) = match self.writer.await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(error = %e, "Trace writer task failed");
                (0, 1)
            }
        };
        TraceSummary {
            events_written: written,
            events_dropped: self.handle.dropped(),
            write_errors,
        }
    }
}

async fn write_events(path: PathBuf, mut rx: mpsc::Receiver<TraceEvent>) -> (u64, u64) {
    let mut written = 0u64;
    let mut errors = 0u64;

    let file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot open trace file, events will be discarded");
            errors += 1;
            None
        }
    };
    let mut out = file.map(BufWriter::new);

    while let Some(event) = rx.recv().await {
        let Some(writer) = out.as_mut() else {
            continue;
        };
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                errors += 1;
                debug!(error = %e, "Failed to serialize trace event");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).await {
            errors += 1;
            warn!(path = %path.display(), error = %e, "Trace write failed");
            continue;
        }
        written += 1;
        // Flush whenever the channel drains so a crash loses little.
        if rx.is_empty() {
            if let Err(e) = writer.flush().await {
                errors += 1;
                warn!(path = %path.display(), error = %e, "Trace flush failed");
            }
        }
    }

    if let Some(writer) = out.as_mut() {
        if let Err(e) = writer.flush().await {
            errors += 1;
            warn!(path = %path.display(), error = %e, "Final trace flush failed");
        }
    }
    (written, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::ExecutionTrace;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_events_are_written_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.jsonl");
        let logger = ArtifactLogger::spawn("run-1", &path, 64);
        let handle = logger.handle();

        for i in 0..10 {
            handle.diagnostic(Stage::Run, format!("event {i}"));
        }
        let summary = logger.finish().await;
        assert_eq!(summary.events_written, 10);
        assert_eq!(summary.events_dropped, 0);

        let trace = ExecutionTrace::load(&path).unwrap();
        assert_eq!(trace.events.len(), 10);
        assert!(trace.is_ordered());
        assert_eq!(trace.events[0].run_id, "run-1");
    }

    #[tokio::test]
    async fn test_record_after_finish_is_dropped_silently() {
        let dir = TempDir::new().unwrap();
        let logger = ArtifactLogger::spawn("run-2", dir.path().join("t.jsonl"), 4);
        let handle = logger.handle();
        let summary = logger.finish().await;
        assert_eq!(summary.events_written, 0);
        handle.diagnostic(Stage::Run, "late");
    }

    #[tokio::test]
    async fn test_unwritable_path_does_not_fail_producers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-dir").join("trace.jsonl");
        let logger = ArtifactLogger::spawn("run-3", &path, 4);
        let handle = logger.handle();
        handle.diagnostic(Stage::Run, "one");
        handle.diagnostic(Stage::Run, "two");
        let summary = logger.finish().await;
        assert_eq!(summary.events_written, 0);
        assert!(summary.write_errors >= 1);
    }

    #[test]
    fn test_disabled_handle_is_noop() {
        let handle = TraceHandle::disabled();
        handle.diagnostic(Stage::Run, "ignored");
        assert_eq!(handle.dropped(), 0);
        assert_eq!(handle.run_id(), "");
    }

    #[tokio::test]
    async fn test_full_buffer_drops_instead_of_blocking() {
        let dir = TempDir::new().unwrap();
        let logger = ArtifactLogger::spawn("run-4", dir.path().join("t.jsonl"), 1);
        let handle = logger.handle();
        // No await between records: the writer cannot drain the channel.
        for i in 0..50 {
            handle.diagnostic(Stage::Run, format!("burst {i}"));
        }
        let summary = logger.finish().await;
        assert_eq!(summary.events_written + summary.events_dropped, 50);
        assert!(summary.events_dropped > 0);
    }
}
