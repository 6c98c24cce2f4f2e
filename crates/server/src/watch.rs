// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sessions-root filesystem watcher feeding the event bus.
//!
//! Uses `notify` for filesystem events; tailers and the project index add
//! their own polling fallbacks, so a missed event only delays them.

use std::path::{Path, PathBuf};

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, EventBus, FileChangeKind, WatchedFileType};

fn classify(path: &Path) -> WatchedFileType {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jsonl") => WatchedFileType::Session,
        _ => WatchedFileType::AgentSession,
    }
}

fn change_kind(kind: &EventKind) -> Option<FileChangeKind> {
    match kind {
        EventKind::Create(_) => Some(FileChangeKind::Created),
        EventKind::Modify(_) => Some(FileChangeKind::Modified),
        EventKind::Remove(_) => Some(FileChangeKind::Removed),
        _ => None,
    }
}

/// Watch the sessions root and publish `file-change` bus events.
pub fn spawn_session_watcher(
    root: PathBuf,
    bus: EventBus,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let _ = std::fs::create_dir_all(&root);
        let (raw_tx, mut raw_rx) = mpsc::channel::<notify::Event>(64);

        let watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if let Ok(event) = event {
                let _ = raw_tx.try_send(event);
            }
        });
        let mut watcher = match watcher {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::warn!(error = %e, "session watcher unavailable");
                return;
            }
        };
        if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
            tracing::warn!(error = %e, root = %root.display(), "session watch failed");
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = raw_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let Some(kind) = change_kind(&event.kind) else {
                        continue;
                    };
                    for path in event.paths {
                        let file_type = classify(&path);
                        bus.publish(BusEvent::FileChange { path, kind, file_type });
                    }
                }
            }
        }
    })
}

#[cfg(test)]
#[path = "watch_tests.rs"]
mod tests;
