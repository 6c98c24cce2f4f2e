// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One running agent subprocess: state machine, message queue, history,
//! and event fan-out. The driver loop lives in [`run`].

pub mod run;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, EventBus};
use crate::error::ErrorCode;
use crate::provider::Provider;
use crate::queue::{Attachment, MessageQueue, QueueFull, QueuedMessage};
use crate::record::{now_ms, PendingRequest, PermissionMode, SessionRecord};
use crate::store::LogStore;

/// Process lifecycle states. `aborted` and `exited` are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ProcessState {
    Spawning,
    InTurn,
    WaitingInput { request: PendingRequest },
    Idle { since_ms: u64 },
    Aborted { reason: String },
    Exited { code: Option<i32> },
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::InTurn => "in-turn",
            Self::WaitingInput { .. } => "waiting-input",
            Self::Idle { .. } => "idle",
            Self::Aborted { .. } => "aborted",
            Self::Exited { .. } => "exited",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted { .. } | Self::Exited { .. })
    }

    pub fn pending_request(&self) -> Option<&PendingRequest> {
        match self {
            Self::WaitingInput { request } => Some(request),
            _ => None,
        }
    }
}

/// Events delivered to process subscribers.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    StateChange { state: ProcessState },
    ModeChange { mode: PermissionMode, mode_version: u64 },
    Message { record: SessionRecord },
    StreamEvent { event: serde_json::Value, uuid: Option<String> },
    SessionIdChanged { old: String, new: String },
    Error { message: String },
    Complete { state: ProcessState },
}

impl ProcessEvent {
    /// Stream deltas may be shed under back-pressure; everything else is
    /// preserved.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::StreamEvent { .. })
    }
}

/// Outcome of queueing a message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOk {
    pub message_id: String,
    pub position: usize,
}

/// Typed failures for [`Process::queue_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    QueueFull,
    ProcessTerminated,
}

impl From<QueueError> for ErrorCode {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::QueueFull => ErrorCode::QueueFull,
            QueueError::ProcessTerminated => ErrorCode::ProcessTerminated,
        }
    }
}

pub(crate) struct ModeState {
    pub mode: PermissionMode,
    pub version: u64,
    /// Staged change applied at the next idle transition.
    pub pending: Option<(PermissionMode, u64)>,
}

pub(crate) struct Listener {
    pub id: u64,
    pub tx: mpsc::Sender<ProcessEvent>,
}

/// History and listeners share one lock so a subscriber's snapshot and its
/// event tail never overlap or gap.
pub(crate) struct FanoutState {
    pub history: Vec<SessionRecord>,
    pub listeners: Vec<Listener>,
    pub next_listener_id: u64,
}

/// Per-subscriber event buffer size. Deltas are shed first when it fills;
/// a subscriber too slow even for essential events is disconnected.
const SUBSCRIBER_BUFFER: usize = 256;

pub(crate) struct ProcessInner {
    pub process_id: String,
    pub project_path: PathBuf,
    pub provider: Arc<dyn Provider>,
    pub store: Arc<LogStore>,
    pub bus: EventBus,

    pub session_id: parking_lot::RwLock<String>,
    pub state: parking_lot::RwLock<ProcessState>,
    pub mode: parking_lot::Mutex<ModeState>,
    pub mode_counter: AtomicU64,
    pub fanout: parking_lot::Mutex<FanoutState>,
    pub queue: parking_lot::Mutex<MessageQueue>,
    pub queue_notify: tokio::sync::Notify,

    /// Current log path; promotion defers the physical rename until idle.
    pub log_path: parking_lot::Mutex<PathBuf>,
    pub pending_rename: parking_lot::Mutex<Option<PathBuf>>,

    /// Lines for the child's stdin.
    pub input_tx: mpsc::Sender<String>,
    pub abort: CancellationToken,
    pub abort_reason: parking_lot::Mutex<Option<String>>,
    pub abort_grace: Duration,
    /// Cancelled once the driver loop has fully torn down.
    pub done: CancellationToken,

    pub on_session_id_change: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
}

impl ProcessInner {
    /// Transition to `state`, notifying subscribers and the bus.
    pub(crate) fn set_state(&self, state: ProcessState) {
        *self.state.write() = state.clone();
        self.bus.publish(BusEvent::ProcessStateChanged {
            process_id: self.process_id.clone(),
            state: state.clone(),
        });
        self.emit(ProcessEvent::StateChange { state });
    }

    /// Fan an event out to every listener, applying the drop policy.
    ///
    /// `Message` events are appended to history under the same lock, so a
    /// concurrent subscribe sees each record exactly once.
    pub(crate) fn emit(&self, event: ProcessEvent) {
        let mut fanout = self.fanout.lock();
        if let ProcessEvent::Message { ref record } = event {
            fanout.history.push(record.clone());
        }
        let droppable = event.is_droppable();
        fanout.listeners.retain(|listener| match listener.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if droppable {
                    tracing::trace!(listener = listener.id, "dropping stream delta for slow subscriber");
                    true
                } else {
                    tracing::warn!(listener = listener.id, "disconnecting subscriber too slow for essential events");
                    false
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Consistent view handed to a new subscriber before the event tail.
#[derive(Debug, Clone)]
pub struct SubscriptionSnapshot {
    pub process_id: String,
    pub session_id: String,
    pub state: ProcessState,
    pub mode: PermissionMode,
    pub mode_version: u64,
    pub pending_request: Option<PendingRequest>,
    pub history: Vec<SessionRecord>,
}

/// A registered subscriber: snapshot plus the live event receiver.
/// Dropping it unsubscribes.
pub struct ProcessSubscription {
    pub snapshot: SubscriptionSnapshot,
    pub rx: mpsc::Receiver<ProcessEvent>,
    listener_id: u64,
    inner: Arc<ProcessInner>,
}

impl Drop for ProcessSubscription {
    fn drop(&mut self) {
        let mut fanout = self.inner.fanout.lock();
        fanout.listeners.retain(|l| l.id != self.listener_id);
    }
}

/// Handle to one running agent subprocess.
#[derive(Clone)]
pub struct Process {
    pub(crate) inner: Arc<ProcessInner>,
}

impl Process {
    pub fn process_id(&self) -> String {
        self.inner.process_id.clone()
    }

    pub fn session_id(&self) -> String {
        self.inner.session_id.read().clone()
    }

    pub fn project_path(&self) -> PathBuf {
        self.inner.project_path.clone()
    }

    pub fn provider_name(&self) -> &'static str {
        self.inner.provider.name()
    }

    pub fn state(&self) -> ProcessState {
        self.inner.state.read().clone()
    }

    pub fn mode(&self) -> (PermissionMode, u64) {
        let mode = self.inner.mode.lock();
        (mode.mode, mode.version)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// In-memory committed records (replay source for subscribers).
    pub fn history(&self) -> Vec<SessionRecord> {
        self.inner.fanout.lock().history.clone()
    }

    /// Enqueue a user message behind any in-flight turn.
    pub async fn queue_message(
        &self,
        text: String,
        attachments: Vec<Attachment>,
    ) -> Result<QueuedOk, QueueError> {
        if self.state().is_terminal() {
            return Err(QueueError::ProcessTerminated);
        }
        let msg = QueuedMessage::new(text, attachments);
        let message_id = msg.id.clone();
        let position = {
            let mut queue = self.inner.queue.lock();
            match queue.push(msg) {
                Ok(pos) => pos,
                Err(QueueFull { .. }) => return Err(QueueError::QueueFull),
            }
        };
        let log_path = self.inner.log_path.lock().clone();
        let record = SessionRecord::QueueOperation {
            timestamp: now_ms(),
            op: crate::record::QueueOp::Enqueue,
            message_id: Some(message_id.clone()),
        };
        if let Err(e) = self.inner.store.append(&log_path, &record).await {
            tracing::warn!(error = %e, "failed to record enqueue");
        }
        // Wake the driver in case it is parked on an empty queue.
        self.inner.queue_notify.notify_one();
        Ok(QueuedOk { message_id, position })
    }

    /// Set the permission mode, immediately when idle, deferred otherwise.
    ///
    /// Returns the monotonically increasing mode version assigned to this
    /// change; subscribers see it echoed on the resulting `mode-change`.
    pub fn set_permission_mode(&self, mode: PermissionMode) -> u64 {
        let version = self.inner.mode_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let apply_now = {
            let state = self.inner.state.read();
            matches!(*state, ProcessState::Idle { .. } | ProcessState::Spawning)
        };
        let mut mode_state = self.inner.mode.lock();
        if apply_now {
            mode_state.mode = mode;
            mode_state.version = version;
            mode_state.pending = None;
            drop(mode_state);
            self.inner.emit(ProcessEvent::ModeChange { mode, mode_version: version });
            self.inner.bus.publish(BusEvent::ModeChange {
                process_id: self.inner.process_id.clone(),
                mode,
                mode_version: version,
            });
            if let Some(line) = self.inner.provider.encode_set_mode(mode) {
                let _ = self.inner.input_tx.try_send(line);
            }
        } else {
            mode_state.pending = Some((mode, version));
        }
        version
    }

    /// Cycle to the next permission mode.
    pub fn cycle_permission_mode(&self) -> (PermissionMode, u64) {
        let next = self.inner.mode.lock().mode.cycle_next();
        let version = self.set_permission_mode(next);
        (next, version)
    }

    /// Deliver the response to a pending tool-approval or question.
    pub fn respond(
        &self,
        request_id: &str,
        approve: bool,
        answer: Option<&str>,
    ) -> Result<(), ErrorCode> {
        let matches_request = {
            let state = self.inner.state.read();
            state.pending_request().map(|r| r.id == request_id).unwrap_or(false)
        };
        if !matches_request {
            return Err(ErrorCode::InvalidRequest);
        }
        let line = self.inner.provider.encode_approval(request_id, approve, answer);
        self.inner.input_tx.try_send(line).map_err(|_| ErrorCode::ProcessTerminated)?;
        self.inner.set_state(ProcessState::InTurn);
        Ok(())
    }

    /// Request termination. The driver drains output within the grace
    /// window, then escalates to SIGKILL.
    pub fn abort(&self, reason: impl Into<String>) {
        *self.inner.abort_reason.lock() = Some(reason.into());
        self.inner.abort.cancel();
    }

    /// Resolve once the driver loop has torn down.
    pub async fn wait_terminated(&self) {
        self.inner.done.cancelled().await;
    }

    /// Register a subscriber: snapshot and event tail are gap-free.
    pub fn subscribe(&self) -> ProcessSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let (listener_id, history) = {
            let mut fanout = self.inner.fanout.lock();
            fanout.next_listener_id += 1;
            let id = fanout.next_listener_id;
            fanout.listeners.push(Listener { id, tx });
            (id, fanout.history.clone())
        };
        let state = self.state();
        let (mode, mode_version) = self.mode();
        let snapshot = SubscriptionSnapshot {
            process_id: self.process_id(),
            session_id: self.session_id(),
            pending_request: state.pending_request().cloned(),
            state,
            mode,
            mode_version,
            history,
        };
        ProcessSubscription { snapshot, rx, listener_id, inner: Arc::clone(&self.inner) }
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
