// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only per-session JSONL log store.
//!
//! Each session is one newline-delimited file under
//! `<root>/<projectId>/<sessionId>.jsonl` (optionally nested one level
//! deeper under a hostname directory). A record is committed once its
//! trailing newline is on disk; readers ignore a partial last line.

pub mod tail;

pub use tail::LogTail;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::record::{encode_project_id, SessionRecord};

/// Summary of one session log file, for project listings.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub modified_ms: u64,
    pub size_bytes: u64,
}

/// Owns the on-disk logs: one write lock per file, shared reads.
pub struct LogStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LogStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root, locks: Mutex::new(HashMap::new()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the logs for a project, by encoded id.
    pub fn project_dir(&self, project_path: &Path) -> PathBuf {
        self.root.join(encode_project_id(project_path))
    }

    /// Canonical log path for `(projectPath, sessionId)`.
    pub fn session_path(&self, project_path: &Path, session_id: &str) -> PathBuf {
        self.project_dir(project_path).join(format!("{session_id}.jsonl"))
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    /// Append one record and its trailing newline.
    ///
    /// I/O failure here is fatal to the owning process; the caller is
    /// responsible for the `aborted{log-write-failed}` transition. A record
    /// whose newline never hit the disk is not committed.
    pub async fn append(&self, path: &Path, record: &SessionRecord) -> anyhow::Result<()> {
        let lock = self.lock_for(path).await;
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Read every committed record in file order.
    ///
    /// A missing file reads as empty. Malformed lines are skipped. The
    /// final segment without a trailing newline is in-flight and excluded.
    pub fn read_all(path: &Path) -> anyhow::Result<Vec<SessionRecord>> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_committed(&bytes).0)
    }

    /// Incremental read for clients: committed records after `after_uuid`,
    /// with book-keeping kinds and stream chunks filtered out.
    ///
    /// If `after_uuid` is not found, all visible records are returned.
    pub fn read_after(path: &Path, after_uuid: Option<&str>) -> anyhow::Result<Vec<SessionRecord>> {
        let all = Self::read_all(path)?;
        let visible: Vec<SessionRecord> =
            all.into_iter().filter(|r| !r.is_bookkeeping() && !r.is_stream_chunk()).collect();

        let Some(after) = after_uuid else {
            return Ok(visible);
        };
        match visible.iter().position(|r| r.uuid() == Some(after)) {
            Some(i) => Ok(visible[i + 1..].to_vec()),
            None => Ok(visible),
        }
    }

    /// Move a session log to a new id within the same directory.
    ///
    /// Takes the file's write lock so no append lands mid-rename.
    pub async fn rename_session(&self, old_path: &Path, new_path: &Path) -> anyhow::Result<()> {
        let lock = self.lock_for(old_path).await;
        let _guard = lock.lock().await;
        if old_path == new_path || !old_path.exists() {
            return Ok(());
        }
        std::fs::rename(old_path, new_path)?;
        let mut locks = self.locks.lock().await;
        locks.remove(old_path);
        Ok(())
    }

    /// Enumerate session logs across a project's session directories.
    ///
    /// Ordered most-recently-modified first.
    pub fn list_sessions(dirs: &[PathBuf]) -> Vec<SessionSummary> {
        let mut sessions = Vec::new();
        for dir in dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                let modified_ms = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                sessions.push(SessionSummary {
                    session_id: stem.to_owned(),
                    path,
                    modified_ms,
                    size_bytes: meta.len(),
                });
            }
        }
        sessions.sort_by(|a, b| b.modified_ms.cmp(&a.modified_ms));
        sessions
    }

    /// Locate a session's log file across a project's directories.
    pub fn find_session_file(dirs: &[PathBuf], session_id: &str) -> Option<PathBuf> {
        let name = format!("{session_id}.jsonl");
        dirs.iter().map(|d| d.join(&name)).find(|p| p.exists())
    }
}

/// Split a byte buffer into committed records plus the committed byte length.
///
/// Only segments terminated by `\n` count; the tail past the last newline is
/// an in-flight record. Malformed committed lines are skipped with a log.
pub fn parse_committed(bytes: &[u8]) -> (Vec<SessionRecord>, usize) {
    let committed_len = match bytes.iter().rposition(|&b| b == b'\n') {
        Some(i) => i + 1,
        None => return (vec![], 0),
    };
    let mut records = Vec::new();
    for line in bytes[..committed_len].split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<SessionRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed log line");
            }
        }
    }
    (records, committed_len)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
