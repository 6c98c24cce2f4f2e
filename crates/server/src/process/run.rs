// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Driver loop for one agent subprocess.
//!
//! Three tasks per process: a stdin writer, a stdout reader that normalizes
//! lines into [`AgentEvent`]s, and the driver itself selecting over
//! subprocess events, the message queue, and the abort signal.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, EventBus};
use crate::provider::{AgentEvent, Provider, SpawnOptions};
use crate::queue::{MessageQueue, QueuedMessage};
use crate::record::{
    encode_project_id, now_ms, MessageBody, PermissionMode, QueueOp, SessionRecord,
};
use crate::store::LogStore;

use super::{
    FanoutState, ModeState, Process, ProcessEvent, ProcessInner, ProcessState,
};

/// Everything needed to spawn one process.
pub struct ProcessSpawn {
    pub process_id: String,
    pub session_id: String,
    pub project_path: PathBuf,
    pub provider: Arc<dyn Provider>,
    pub mode: PermissionMode,
    pub queue_cap: usize,
    pub abort_grace: Duration,
    pub agent_cmd: Option<String>,
    /// Resume an existing session: replay its log into history and pass
    /// `--resume` to the provider.
    pub resume: bool,
    pub initial_message: Option<QueuedMessage>,
    pub store: Arc<LogStore>,
    pub bus: EventBus,
    pub on_session_id_change: Option<Arc<dyn Fn(&str, &str) + Send + Sync>>,
}

impl Process {
    /// Spawn the subprocess and its driver tasks.
    pub async fn spawn(cfg: ProcessSpawn) -> anyhow::Result<Process> {
        let log_path = cfg.store.session_path(&cfg.project_path, &cfg.session_id);

        // Resume replays the on-disk log into in-memory history before the
        // first new message is dispatched.
        let history = if cfg.resume {
            LogStore::read_all(&log_path)?
                .into_iter()
                .filter(|r| !r.is_bookkeeping())
                .collect()
        } else {
            Vec::new()
        };

        let opts = SpawnOptions {
            project_path: cfg.project_path.clone(),
            mode: cfg.mode,
            resume_session_id: cfg.resume.then(|| cfg.session_id.clone()),
            agent_cmd: cfg.agent_cmd.clone(),
        };
        let mut command = cfg.provider.command(&opts);
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        command.kill_on_drop(true);
        let mut child = command.spawn()?;

        let (input_tx, input_rx) = mpsc::channel::<String>(64);
        let (agent_tx, agent_rx) = mpsc::channel::<AgentEvent>(256);

        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(write_stdin(stdin, input_rx));
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stdout(stdout, Arc::clone(&cfg.provider), agent_tx));
        }
        if let Some(stderr) = child.stderr.take() {
            let process_id = cfg.process_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(%process_id, %line, "agent stderr");
                }
            });
        }

        let inner = Arc::new(ProcessInner {
            process_id: cfg.process_id,
            project_path: cfg.project_path,
            provider: cfg.provider,
            store: cfg.store,
            bus: cfg.bus,
            session_id: parking_lot::RwLock::new(cfg.session_id),
            state: parking_lot::RwLock::new(ProcessState::Spawning),
            mode: parking_lot::Mutex::new(ModeState {
                mode: cfg.mode,
                version: 0,
                pending: None,
            }),
            mode_counter: AtomicU64::new(0),
            fanout: parking_lot::Mutex::new(FanoutState {
                history,
                listeners: Vec::new(),
                next_listener_id: 0,
            }),
            queue: parking_lot::Mutex::new(MessageQueue::new(cfg.queue_cap)),
            queue_notify: tokio::sync::Notify::new(),
            log_path: parking_lot::Mutex::new(log_path),
            pending_rename: parking_lot::Mutex::new(None),
            input_tx,
            abort: CancellationToken::new(),
            abort_reason: parking_lot::Mutex::new(None),
            abort_grace: cfg.abort_grace,
            done: CancellationToken::new(),
            on_session_id_change: cfg.on_session_id_change,
        });

        let process = Process { inner: Arc::clone(&inner) };

        let mut driver = Driver { inner, child, agent_rx, turn: Turn::default() };
        if let Some(msg) = cfg.initial_message {
            driver.inject(msg).await;
        }
        tokio::spawn(async move {
            driver.run().await;
            driver.inner.done.cancel();
        });

        Ok(process)
    }
}

async fn write_stdin(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn read_stdout(
    stdout: tokio::process::ChildStdout,
    provider: Arc<dyn Provider>,
    tx: mpsc::Sender<AgentEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let events = provider.normalize(&line);
                if events.is_empty() && !line.trim().is_empty() {
                    tracing::debug!(%line, "skipping unparseable agent output");
                }
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "agent stdout read failed");
                return;
            }
        }
    }
}

/// Accumulates text deltas for the currently-forming assistant message.
#[derive(Default)]
struct Turn {
    uuid: Option<String>,
    text: String,
}

impl Turn {
    fn push(&mut self, delta: &str) -> &str {
        if self.uuid.is_none() {
            self.uuid = Some(uuid::Uuid::new_v4().to_string());
        }
        self.text.push_str(delta);
        self.uuid.as_deref().unwrap_or("")
    }

    fn reset(&mut self) {
        self.uuid = None;
        self.text.clear();
    }
}

struct Driver {
    inner: Arc<ProcessInner>,
    child: tokio::process::Child,
    agent_rx: mpsc::Receiver<AgentEvent>,
    turn: Turn,
}

impl Driver {
    async fn run(&mut self) {
        loop {
            // Queued messages may be injected while idle, or while still
            // spawning when no initial message claimed the first turn.
            let idle = matches!(
                *self.inner.state.read(),
                ProcessState::Idle { .. } | ProcessState::Spawning
            );
            tokio::select! {
                _ = self.inner.abort.cancelled() => {
                    self.finish_aborted().await;
                    return;
                }
                status = self.child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    self.drain_tail().await;
                    self.finalize(ProcessState::Exited { code });
                    return;
                }
                event = self.agent_rx.recv() => {
                    match event {
                        Some(event) => {
                            if self.handle_event(event).await.is_break() {
                                return;
                            }
                        }
                        None => {
                            // Stdout closed; the child is on its way out.
                            let status = tokio::time::timeout(
                                self.inner.abort_grace,
                                self.child.wait(),
                            )
                            .await;
                            let code = match status {
                                Ok(Ok(s)) => s.code(),
                                _ => {
                                    let _ = self.child.start_kill();
                                    None
                                }
                            };
                            self.finalize(ProcessState::Exited { code });
                            return;
                        }
                    }
                }
                _ = self.inner.queue_notify.notified(), if idle => {
                    if self.drain_queue().await.is_break() {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: AgentEvent) -> ControlFlow<()> {
        match event {
            AgentEvent::SessionStarted { session_id } => {
                self.promote_session_id(session_id).await
            }
            AgentEvent::StreamDelta { text } => {
                self.ensure_in_turn();
                let uuid = self.turn.push(&text).to_owned();
                self.inner.emit(ProcessEvent::StreamEvent {
                    event: serde_json::json!({"type": "text_delta", "text": text}),
                    uuid: Some(uuid),
                });
                ControlFlow::Continue(())
            }
            AgentEvent::ThinkingDelta { text } => {
                self.ensure_in_turn();
                self.inner.emit(ProcessEvent::StreamEvent {
                    event: serde_json::json!({"type": "thinking_delta", "thinking": text}),
                    uuid: self.turn.uuid.clone(),
                });
                ControlFlow::Continue(())
            }
            AgentEvent::Record { record } => {
                // System records are not message-producing: they must not
                // drag a freshly spawned process into a turn.
                if !matches!(
                    record,
                    SessionRecord::SystemInit { .. } | SessionRecord::SystemStatus { .. }
                ) {
                    self.ensure_in_turn();
                }
                // A full assistant message from the provider is the sealed
                // form of any deltas accumulated for it.
                if matches!(record, SessionRecord::Assistant { .. }) {
                    self.turn.reset();
                }
                self.commit(record).await
            }
            AgentEvent::PermissionRequest { request } => {
                self.inner.set_state(ProcessState::WaitingInput { request });
                ControlFlow::Continue(())
            }
            AgentEvent::TurnComplete { result } => self.complete_turn(result).await,
            AgentEvent::Raw { event } => {
                self.inner.emit(ProcessEvent::StreamEvent { event, uuid: None });
                ControlFlow::Continue(())
            }
        }
    }

    /// `spawning → in-turn` on the first message-producing event, and
    /// `idle → in-turn` when a late event arrives without an injection.
    fn ensure_in_turn(&self) {
        let current = self.inner.state.read().clone();
        if matches!(current, ProcessState::Spawning | ProcessState::Idle { .. }) {
            self.inner.set_state(ProcessState::InTurn);
        }
    }

    /// Append a record to the log and fan it out. Log I/O failure is fatal.
    async fn commit(&mut self, record: SessionRecord) -> ControlFlow<()> {
        let log_path = self.inner.log_path.lock().clone();
        if let Err(e) = self.inner.store.append(&log_path, &record).await {
            tracing::error!(error = %e, "session log write failed");
            self.inner.emit(ProcessEvent::Error { message: format!("log write failed: {e}") });
            let _ = self.child.start_kill();
            self.finalize(ProcessState::Aborted { reason: "log-write-failed".to_owned() });
            return ControlFlow::Break(());
        }
        self.inner.emit(ProcessEvent::Message { record });
        ControlFlow::Continue(())
    }

    /// The subprocess reported the turn done: seal any accumulated deltas,
    /// run the deferred rename, apply a staged mode change, then either
    /// inject the next queued message or go idle.
    async fn complete_turn(&mut self, _result: Option<serde_json::Value>) -> ControlFlow<()> {
        if let Some(uuid) = self.turn.uuid.take() {
            if !self.turn.text.is_empty() {
                let record = SessionRecord::Assistant {
                    uuid,
                    parent_uuid: None,
                    timestamp: now_ms(),
                    message: MessageBody::assistant_text(std::mem::take(&mut self.turn.text)),
                };
                self.commit(record).await?;
            }
        }
        self.turn.reset();

        self.perform_pending_rename().await;
        self.apply_pending_mode();

        let next = self.inner.queue.lock().pop();
        match next {
            Some(msg) => {
                self.record_dequeue(&msg).await?;
                self.inject(msg).await;
            }
            None => {
                self.inner.set_state(ProcessState::Idle { since_ms: now_ms() });
            }
        }
        ControlFlow::Continue(())
    }

    /// Idle wakeup: a message was queued while nothing was in flight.
    async fn drain_queue(&mut self) -> ControlFlow<()> {
        self.apply_pending_mode();
        let next = self.inner.queue.lock().pop();
        if let Some(msg) = next {
            self.record_dequeue(&msg).await?;
            self.inject(msg).await;
        }
        ControlFlow::Continue(())
    }

    async fn record_dequeue(&mut self, msg: &QueuedMessage) -> ControlFlow<()> {
        let record = SessionRecord::QueueOperation {
            timestamp: now_ms(),
            op: QueueOp::Dequeue,
            message_id: Some(msg.id.clone()),
        };
        self.commit_bookkeeping(record).await
    }

    /// Book-keeping appends share the fatal-I/O policy but skip fan-out.
    async fn commit_bookkeeping(&mut self, record: SessionRecord) -> ControlFlow<()> {
        let log_path = self.inner.log_path.lock().clone();
        if let Err(e) = self.inner.store.append(&log_path, &record).await {
            tracing::error!(error = %e, "session log write failed");
            let _ = self.child.start_kill();
            self.finalize(ProcessState::Aborted { reason: "log-write-failed".to_owned() });
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    /// Write the user record and hand the message to the subprocess.
    async fn inject(&mut self, msg: QueuedMessage) {
        let record = SessionRecord::User {
            uuid: msg.id.clone(),
            parent_uuid: None,
            timestamp: now_ms(),
            message: MessageBody::user_text(msg.text.clone()),
        };
        if self.commit(record).await.is_break() {
            return;
        }
        let line = self.inner.provider.encode_user_message(&msg);
        if self.inner.input_tx.send(line).await.is_err() {
            tracing::warn!("agent stdin closed before message delivery");
        }
        self.inner.set_state(ProcessState::InTurn);
    }

    fn apply_pending_mode(&self) {
        let staged = {
            let mut mode_state = self.inner.mode.lock();
            match mode_state.pending.take() {
                Some((mode, version)) => {
                    mode_state.mode = mode;
                    mode_state.version = version;
                    Some((mode, version))
                }
                None => None,
            }
        };
        if let Some((mode, version)) = staged {
            self.inner.emit(ProcessEvent::ModeChange { mode, mode_version: version });
            self.inner.bus.publish(BusEvent::ModeChange {
                process_id: self.inner.process_id.clone(),
                mode,
                mode_version: version,
            });
            if let Some(line) = self.inner.provider.encode_set_mode(mode) {
                let _ = self.inner.input_tx.try_send(line);
            }
        }
    }

    /// The child revealed its own session id: re-key everything that maps
    /// the session, but leave the physical rename for the next idle edge.
    async fn promote_session_id(&mut self, new_id: String) -> ControlFlow<()> {
        let old = self.inner.session_id.read().clone();
        if old == new_id {
            return ControlFlow::Continue(());
        }
        *self.inner.session_id.write() = new_id.clone();
        self.inner.emit(ProcessEvent::SessionIdChanged {
            old: old.clone(),
            new: new_id.clone(),
        });
        if let Some(ref callback) = self.inner.on_session_id_change {
            callback(&old, &new_id);
        }
        self.inner.bus.publish(BusEvent::SessionUpdated {
            project_id: encode_project_id(&self.inner.project_path),
            session_id: new_id.clone(),
        });

        let new_path = self.inner.store.session_path(&self.inner.project_path, &new_id);
        *self.inner.pending_rename.lock() = Some(new_path);
        let record = SessionRecord::SystemStatus {
            timestamp: now_ms(),
            subtype: "rename-pending".to_owned(),
            detail: Some(serde_json::json!({"old": old, "new": new_id})),
        };
        self.commit_bookkeeping(record).await
    }

    async fn perform_pending_rename(&mut self) {
        let Some(new_path) = self.inner.pending_rename.lock().take() else {
            return;
        };
        let old_path = self.inner.log_path.lock().clone();
        match self.inner.store.rename_session(&old_path, &new_path).await {
            Ok(()) => {
                *self.inner.log_path.lock() = new_path;
            }
            Err(e) => {
                tracing::warn!(error = %e, "deferred session rename failed; keeping old path");
            }
        }
    }

    /// Abort: SIGTERM, drain output within the grace window, then SIGKILL.
    async fn finish_aborted(&mut self) {
        let reason =
            self.inner.abort_reason.lock().clone().unwrap_or_else(|| "aborted".to_owned());

        if let Some(pid) = self.child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        let deadline = tokio::time::Instant::now() + self.inner.abort_grace;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = self.child.start_kill();
                    break;
                }
                status = self.child.wait() => {
                    let _ = status;
                    break;
                }
                event = self.agent_rx.recv() => {
                    match event {
                        Some(event) => {
                            let _ = self.handle_event(event).await;
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = self.child.start_kill();
        self.finalize(ProcessState::Aborted { reason });
    }

    /// Pull any events the reader already parsed before the exit won the race.
    async fn drain_tail(&mut self) {
        loop {
            match tokio::time::timeout(Duration::from_millis(100), self.agent_rx.recv()).await {
                Ok(Some(event)) => {
                    if self.handle_event(event).await.is_break() {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Enter a terminal state: flag undelivered queue items, notify, stop.
    fn finalize(&mut self, state: ProcessState) {
        if self.inner.state.read().is_terminal() {
            return;
        }
        let abandoned = self.inner.queue.lock().clear();
        if !abandoned.is_empty() {
            tracing::info!(
                count = abandoned.len(),
                "marking undelivered queued messages on terminal transition"
            );
            let store = Arc::clone(&self.inner.store);
            let log_path = self.inner.log_path.lock().clone();
            tokio::spawn(async move {
                for msg in abandoned {
                    let record = SessionRecord::QueueOperation {
                        timestamp: now_ms(),
                        op: QueueOp::NotDelivered,
                        message_id: Some(msg.id),
                    };
                    if let Err(e) = store.append(&log_path, &record).await {
                        tracing::warn!(error = %e, "failed to record undelivered message");
                        break;
                    }
                }
            });
        }
        self.inner.set_state(state.clone());
        self.inner.emit(ProcessEvent::Complete { state });
    }
}
