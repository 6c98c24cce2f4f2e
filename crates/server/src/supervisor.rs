// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Owner of all processes: session indexing, per-project admission caps,
//! and the FIFO waiting queue for starts past the cap.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, EventBus, SessionOwnership};
use crate::process::run::ProcessSpawn;
use crate::process::Process;
use crate::provider::ProviderRegistry;
use crate::queue::QueuedMessage;
use crate::record::{encode_project_id, PermissionMode};
use crate::store::LogStore;

/// Static supervisor settings, cut from the server config.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub message_queue_cap: usize,
    pub per_project_cap: usize,
    pub global_cap: usize,
    pub max_queue_size: usize,
    pub abort_grace: Duration,
    pub agent_cmd: Option<String>,
    pub default_provider: String,
}

/// A start request, direct or queued.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub project_path: PathBuf,
    pub initial_message: Option<String>,
    pub mode: PermissionMode,
    pub provider: Option<String>,
}

/// Result of `start_session`.
pub enum StartOutcome {
    Started(Process),
    Queued { queue_id: String, position: usize },
    QueueFull,
}

/// Observable state of an admission ticket.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TicketStatus {
    Pending { position: usize },
    #[serde(rename_all = "camelCase")]
    Started { session_id: String },
    Cancelled,
}

struct Ticket {
    queue_id: String,
    request: StartRequest,
}

#[derive(Default)]
struct SupervisorInner {
    by_process: HashMap<String, Process>,
    by_session: HashMap<String, Process>,
    waiting: HashMap<PathBuf, VecDeque<Ticket>>,
    /// Ticket history in issue order (debug listing follows admission order).
    tickets: IndexMap<String, TicketStatus>,
}

impl SupervisorInner {
    fn running_in(&self, project_path: &Path) -> usize {
        self.by_process
            .values()
            .filter(|p| p.project_path() == project_path && !p.state().is_terminal())
            .count()
    }

    fn running_total(&self) -> usize {
        self.by_process.values().filter(|p| !p.state().is_terminal()).count()
    }

    fn index(&mut self, process: &Process) {
        self.by_process.insert(process.process_id(), process.clone());
        self.by_session.insert(process.session_id(), process.clone());
    }

    fn refresh_pending_positions(&mut self, project_path: &Path) {
        if let Some(queue) = self.waiting.get(project_path) {
            for (position, ticket) in queue.iter().enumerate() {
                self.tickets.insert(ticket.queue_id.clone(), TicketStatus::Pending { position });
            }
        }
    }
}

/// The supervisor: one per server.
pub struct Supervisor {
    config: SupervisorConfig,
    store: Arc<LogStore>,
    bus: EventBus,
    providers: Arc<ProviderRegistry>,
    inner: Mutex<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        store: Arc<LogStore>,
        bus: EventBus,
        providers: Arc<ProviderRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self { config, store, bus, providers, inner: Mutex::new(SupervisorInner::default()) })
    }

    /// Start a new session, or queue the request when the project is at its
    /// concurrency cap. Tickets complete in FIFO order as slots free.
    pub async fn start_session(self: &Arc<Self>, request: StartRequest) -> anyhow::Result<StartOutcome> {
        let mut inner = self.inner.lock().await;

        let at_cap = inner.running_in(&request.project_path) >= self.config.per_project_cap
            || (self.config.global_cap > 0 && inner.running_total() >= self.config.global_cap);

        if at_cap {
            let queue = inner.waiting.entry(request.project_path.clone()).or_default();
            if queue.len() >= self.config.max_queue_size {
                return Ok(StartOutcome::QueueFull);
            }
            let queue_id = uuid::Uuid::new_v4().to_string();
            queue.push_back(Ticket { queue_id: queue_id.clone(), request });
            let position = queue.len() - 1;
            inner.tickets.insert(queue_id.clone(), TicketStatus::Pending { position });
            return Ok(StartOutcome::Queued { queue_id, position });
        }

        let process = self.spawn_process(&mut inner, &request, None).await?;
        Ok(StartOutcome::Started(process))
    }

    /// Reuse the live process for `session_id`, or recreate one bound to it,
    /// replaying the on-disk log before the initial message is dispatched.
    pub async fn resume_session(
        self: &Arc<Self>,
        session_id: &str,
        project_path: &Path,
        initial_message: Option<String>,
        mode: PermissionMode,
        provider: Option<String>,
    ) -> anyhow::Result<Process> {
        if let Some(process) = self.get_process_for_session(session_id).await {
            if !process.state().is_terminal() {
                if let Some(text) = initial_message {
                    process
                        .queue_message(text, vec![])
                        .await
                        .map_err(|e| anyhow::anyhow!("queue on resume failed: {e:?}"))?;
                }
                return Ok(process);
            }
        }

        let request = StartRequest {
            project_path: project_path.to_path_buf(),
            initial_message,
            mode,
            provider,
        };
        let mut inner = self.inner.lock().await;
        let process = self.spawn_process(&mut inner, &request, Some(session_id)).await?;
        Ok(process)
    }

    /// Abort, remove from both indices, and wait for teardown. Frees a slot
    /// for the project's waiting queue.
    pub async fn abort_process(self: &Arc<Self>, process_id: &str) -> bool {
        let process = {
            let mut inner = self.inner.lock().await;
            let Some(process) = inner.by_process.remove(process_id) else {
                return false;
            };
            inner.by_session.retain(|_, p| p.process_id() != process_id);
            process
        };
        process.abort("aborted by request");
        process.wait_terminated().await;
        self.bus.publish(BusEvent::SessionStatusChanged {
            session_id: process.session_id(),
            ownership: SessionOwnership::Released,
        });
        self.admit_waiting(&process.project_path()).await;
        true
    }

    pub async fn get_process(&self, process_id: &str) -> Option<Process> {
        self.inner.lock().await.by_process.get(process_id).cloned()
    }

    pub async fn get_process_for_session(&self, session_id: &str) -> Option<Process> {
        let inner = self.inner.lock().await;
        if let Some(process) = inner.by_session.get(session_id) {
            return Some(process.clone());
        }
        // The re-index after an id promotion is asynchronous; fall back to
        // the process table so both ids resolve throughout the swap.
        inner.by_process.values().find(|p| p.session_id() == session_id).cloned()
    }

    pub async fn all_processes(&self) -> Vec<Process> {
        self.inner.lock().await.by_process.values().cloned().collect()
    }

    pub async fn ticket_status(&self, queue_id: &str) -> Option<TicketStatus> {
        self.inner.lock().await.tickets.get(queue_id).cloned()
    }

    /// Cancel a pending ticket. Already-started tickets are unaffected.
    pub async fn cancel_ticket(&self, queue_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let mut cancelled = false;
        for queue in inner.waiting.values_mut() {
            if let Some(i) = queue.iter().position(|t| t.queue_id == queue_id) {
                queue.remove(i);
                cancelled = true;
                break;
            }
        }
        if cancelled {
            inner.tickets.insert(queue_id.to_owned(), TicketStatus::Cancelled);
            let paths: Vec<PathBuf> = inner.waiting.keys().cloned().collect();
            for path in paths {
                inner.refresh_pending_positions(&path);
            }
        }
        cancelled
    }

    /// Pending waiting-queue depth across all projects (debug surface).
    pub async fn waiting_depth(&self) -> usize {
        self.inner.lock().await.waiting.values().map(VecDeque::len).sum()
    }

    /// Watch for terminal process states: drop them from the indices and
    /// admit the next waiting start for the project.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let mut sub = supervisor.bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = sub.recv() => match event {
                        Some(BusEvent::ProcessStateChanged { process_id, state })
                            if state.is_terminal() =>
                        {
                            supervisor.reap(&process_id).await;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        })
    }

    async fn reap(self: &Arc<Self>, process_id: &str) {
        let project_path = {
            let mut inner = self.inner.lock().await;
            let Some(process) = inner.by_process.remove(process_id) else {
                return;
            };
            inner.by_session.retain(|_, p| p.process_id() != process_id);
            self.bus.publish(BusEvent::SessionStatusChanged {
                session_id: process.session_id(),
                ownership: SessionOwnership::Released,
            });
            process.project_path()
        };
        self.admit_waiting(&project_path).await;
    }

    /// Start queued tickets while slots are free, strictly FIFO.
    async fn admit_waiting(self: &Arc<Self>, project_path: &Path) {
        loop {
            let mut inner = self.inner.lock().await;
            if inner.running_in(project_path) >= self.config.per_project_cap {
                return;
            }
            if self.config.global_cap > 0 && inner.running_total() >= self.config.global_cap {
                return;
            }
            let Some(ticket) =
                inner.waiting.get_mut(project_path).and_then(VecDeque::pop_front)
            else {
                return;
            };
            match self.spawn_process(&mut inner, &ticket.request, None).await {
                Ok(process) => {
                    inner.tickets.insert(
                        ticket.queue_id,
                        TicketStatus::Started { session_id: process.session_id() },
                    );
                    inner.refresh_pending_positions(project_path);
                }
                Err(e) => {
                    tracing::error!(error = %e, "queued start failed");
                    inner.tickets.insert(ticket.queue_id, TicketStatus::Cancelled);
                }
            }
        }
    }

    /// Spawn and index one process. `resume_id` binds to an existing session.
    async fn spawn_process(
        self: &Arc<Self>,
        inner: &mut SupervisorInner,
        request: &StartRequest,
        resume_id: Option<&str>,
    ) -> anyhow::Result<Process> {
        let provider_name =
            request.provider.clone().unwrap_or_else(|| self.config.default_provider.clone());
        let provider = self
            .providers
            .get(&provider_name)
            .ok_or_else(|| anyhow::anyhow!("unknown provider: {provider_name}"))?;

        let process_id = uuid::Uuid::new_v4().to_string();
        let session_id = match resume_id {
            Some(id) => id.to_owned(),
            None => format!("tmp-{}", uuid::Uuid::new_v4()),
        };

        let supervisor = Arc::downgrade(self);
        let on_session_id_change: Arc<dyn Fn(&str, &str) + Send + Sync> =
            Arc::new(move |old: &str, new: &str| {
                let Some(supervisor) = supervisor.upgrade() else {
                    return;
                };
                let old = old.to_owned();
                let new = new.to_owned();
                tokio::spawn(async move {
                    supervisor.reindex_session(&old, &new).await;
                });
            });

        let process = Process::spawn(ProcessSpawn {
            process_id,
            session_id,
            project_path: request.project_path.clone(),
            provider,
            mode: request.mode,
            queue_cap: self.config.message_queue_cap,
            abort_grace: self.config.abort_grace,
            agent_cmd: self.config.agent_cmd.clone(),
            resume: resume_id.is_some(),
            initial_message: request
                .initial_message
                .clone()
                .map(|text| QueuedMessage::new(text, vec![])),
            store: Arc::clone(&self.store),
            bus: self.bus.clone(),
            on_session_id_change: Some(on_session_id_change),
        })
        .await?;

        inner.index(&process);
        self.bus.publish(BusEvent::SessionCreated {
            project_id: encode_project_id(&request.project_path),
            session_id: process.session_id(),
        });
        Ok(process)
    }

    /// Swap the session index key after an id promotion.
    async fn reindex_session(&self, old: &str, new: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(process) = inner.by_session.remove(old) {
            inner.by_session.insert(new.to_owned(), process);
        }
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
