// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, BusSubscription};
use crate::record::SessionRecord;
use crate::store::parse_committed;

/// Incremental reader over one session log, keyed on a byte offset.
///
/// Wakes on event-bus file changes for its path, with a polling fallback.
/// Only committed records (trailing newline observed) are surfaced; a
/// partial last line stays buffered on disk until its newline arrives.
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    poll_interval: Duration,
}

impl LogTail {
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: 0, poll_interval: Duration::from_secs(5) }
    }

    /// Start from a byte offset, skipping already-processed records.
    pub fn with_offset(path: PathBuf, offset: u64) -> Self {
        Self { path, offset, poll_interval: Duration::from_secs(5) }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Current byte offset into the log file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read newly committed records appended since the last read.
    pub fn read_new_records(&mut self) -> anyhow::Result<Vec<SessionRecord>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        // File shrank below our offset: it was truncated or replaced.
        // Reset and re-read from the beginning.
        if (bytes.len() as u64) < self.offset {
            self.offset = 0;
        }

        let tail = &bytes[self.offset as usize..];
        let (records, committed_len) = parse_committed(tail);
        self.offset += committed_len as u64;
        Ok(records)
    }

    /// Tail loop: emit record batches until cancelled or the channel closes.
    ///
    /// `changes` is an event-bus subscription; only `file-change` events for
    /// this tail's path trigger an immediate read.
    pub async fn run(
        mut self,
        mut changes: BusSubscription,
        batch_tx: mpsc::Sender<Vec<SessionRecord>>,
        shutdown: CancellationToken,
    ) {
        let mut poll = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = changes.recv() => {
                    match event {
                        Some(BusEvent::FileChange { path, .. }) if path == self.path => {}
                        Some(_) => continue,
                        None => break,
                    }
                }
                _ = poll.tick() => {}
            }

            match self.read_new_records() {
                Ok(records) if !records.is_empty() => {
                    if batch_tx.send(records).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "log tail read failed");
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tail_tests.rs"]
mod tests;
