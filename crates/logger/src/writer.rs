//! The single writer task. Every record goes through here, so storage
//! writes are serialized no matter how fast the bus delivers.
//!
//! A record that still fails after the retry budget is appended to the
//! dead-letter file as one JSON line, or logged in full when no file is
//! configured (or the file cannot be written).

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::db::EventStore;
use crate::message::EventRecord;

/// Queue depth between the bus loop and the writer.
pub const QUEUE_CAP: usize = 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub written: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

pub struct Writer {
    store: EventStore,
    retry: RetryPolicy,
    dead_letter_path: Option<PathBuf>,
    stats: WriterStats,
}

impl Writer {
    pub fn new(store: EventStore, retry: RetryPolicy, dead_letter_path: Option<PathBuf>) -> Self {
        Self {
            store,
            retry,
            dead_letter_path,
            stats: WriterStats::default(),
        }
    }

    /// Start the writer. It runs until every sender is dropped and the queue
    /// is drained, then returns its counters.
    pub fn spawn(self) -> (mpsc::Sender<EventRecord>, JoinHandle<WriterStats>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAP);
        (tx, tokio::spawn(self.run(rx)))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<EventRecord>) -> WriterStats {
        while let Some(record) = rx.recv().await {
            self.persist(&record).await;
        }
        info!(
            written = self.stats.written,
            dead_lettered = self.stats.dead_lettered,
            "writer stopped"
        );
        self.stats
    }

    /// Write one record with retries; dead-letter it if all attempts fail.
    pub async fn persist(&mut self, record: &EventRecord) {
        let attempts = self.retry.attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match self.store.upsert_event(record).await {
                Ok(write) => {
                    debug!(topic = %record.topic, id = ?record.id, ?write, "event stored");
                    self.stats.written += 1;
                    return;
                }
                Err(e) => {
                    warn!(attempt, attempts, topic = %record.topic, "store failed: {e:#}");
                    last_err = Some(e);
                    if attempt < attempts {
                        self.stats.retried += 1;
                        sleep(self.retry.delay_after(attempt)).await;
                    }
                }
            }
        }

        let reason = last_err.map(|e| format!("{e:#}")).unwrap_or_default();
        self.give_up(record, &reason).await;
    }

    async fn give_up(&mut self, record: &EventRecord, reason: &str) {
        self.stats.dead_lettered += 1;
        dead_letter(self.dead_letter_path.as_deref(), record, reason).await;
    }
}

/// Append `record` to the dead-letter file as one JSON line. Without a path,
/// or when the append fails, the full record is logged instead.
pub async fn dead_letter(path: Option<&Path>, record: &EventRecord, reason: &str) {
    let entry = json!({
        "failedAt": Utc::now().to_rfc3339(),
        "error": reason,
        "record": record,
    });

    let Some(path) = path else {
        error!(record = %entry, "event dropped: {reason}");
        return;
    };

    match append_line(path, &entry.to_string()).await {
        Ok(()) => {
            warn!(path = %path.display(), topic = %record.topic, "event dead-lettered: {reason}")
        }
        Err(e) => error!(record = %entry, "dead-letter write failed: {e:#}"),
    }
}

async fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(format!("{line}\n").as_bytes())
        .await
        .with_context(|| format!("append to {}", path.display()))?;
    file.flush().await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
