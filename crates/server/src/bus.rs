// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide event bus: one publish fans out to every live subscriber.
//!
//! Built on a `tokio::sync::broadcast` channel so publishing never blocks on
//! a slow subscriber; receivers that fall behind observe `Lagged` and skip
//! ahead rather than stalling the publisher.

use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::process::ProcessState;
use crate::record::PermissionMode;

/// Kind of filesystem change reported on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created,
    Modified,
    Removed,
}

/// Classification of the file a change event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedFileType {
    /// A session log (`*.jsonl`) under the sessions root.
    Session,
    /// A provider-owned session artifact (anything else under a project dir).
    AgentSession,
    /// Files outside any project directory.
    Other,
}

/// Whether a session currently has a live owning process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOwnership {
    Owned,
    Released,
}

/// Closed union of events carried by the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    FileChange { path: PathBuf, kind: FileChangeKind, file_type: WatchedFileType },
    ProcessStateChanged { process_id: String, state: ProcessState },
    SessionStatusChanged { session_id: String, ownership: SessionOwnership },
    SessionCreated { project_id: String, session_id: String },
    SessionUpdated { project_id: String, session_id: String },
    ModeChange { process_id: String, mode: PermissionMode, mode_version: u64 },
}

/// Cloneable handle to the process-wide bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

/// Receiving side of a bus subscription. Dropping it unsubscribes.
pub struct BusSubscription {
    rx: broadcast::Receiver<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers that received it. A publish with
    /// zero subscribers is not an error.
    pub fn publish(&self, event: BusEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription { rx: self.tx.subscribe() }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusSubscription {
    /// Receive the next event, skipping over any lagged gap.
    ///
    /// Returns `None` once the bus itself is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "bus subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive for callers polling from a select loop.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
