// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP request/response types and axum handler implementations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{error_message, ErrorCode};
use crate::process::{Process, ProcessEvent, ProcessState};
use crate::record::{decode_project_id, PermissionMode, SessionRecord};
use crate::state::Services;
use crate::store::LogStore;
use crate::supervisor::{StartOutcome, StartRequest};
use crate::transport::{session_cookie, COOKIE_NAME};

// -- Types --------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub project_path: PathBuf,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub session_id: String,
    pub process_id: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    #[serde(default)]
    pub project_path: Option<PathBuf>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub text: String,
    #[serde(default)]
    pub blocking: bool,
}

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondRequest {
    pub request_id: String,
    pub approve: bool,
    #[serde(default)]
    pub answer: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AfterQuery {
    #[serde(default)]
    pub after_message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    pub process_id: String,
    pub session_id: String,
    pub project_path: PathBuf,
    pub provider: String,
    pub state: String,
    pub queue_len: usize,
    pub mode: PermissionMode,
    pub mode_version: u64,
}

fn summarize(process: &Process) -> ProcessSummary {
    let (mode, mode_version) = process.mode();
    ProcessSummary {
        process_id: process.process_id(),
        session_id: process.session_id(),
        project_path: process.project_path(),
        provider: process.provider_name().to_owned(),
        state: process.state().as_str().to_owned(),
        queue_len: process.queue_len(),
        mode,
        mode_version,
    }
}

/// Truncate `records` to those after `after`; unknown ids fall back to the
/// full list.
pub fn filter_after(records: Vec<SessionRecord>, after: Option<&str>) -> Vec<SessionRecord> {
    let Some(after) = after else {
        return records;
    };
    match records.iter().position(|r| r.uuid() == Some(after)) {
        Some(i) => records[i + 1..].to_vec(),
        None => records,
    }
}

fn err(code: ErrorCode) -> Response {
    code.to_http_response(error_message(code)).into_response()
}

// -- Health & meta ------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<Services>>) -> impl IntoResponse {
    let processes = s.supervisor.all_processes().await.len();
    Json(serde_json::json!({
        "status": "running",
        "uptimeMs": s.uptime_ms(),
        "processes": processes,
        "installId": s.install_id,
    }))
}

/// `GET /api/v1/settings`
pub async fn settings(State(s): State<Arc<Services>>) -> impl IntoResponse {
    let c = &s.config;
    Json(serde_json::json!({
        "port": c.port,
        "host": c.host,
        "dataDir": c.resolved_data_dir(),
        "profileName": c.profile_name,
        "authEnabled": c.auth_enabled,
        "allowedHosts": c.allowed_hosts,
        "persistRemoteSessions": c.persist_remote_sessions,
        "idleTimeoutMs": c.idle_timeout_ms,
        "messageQueueCap": c.message_queue_cap,
        "perProjectCap": c.per_project_cap,
        "maxQueueSize": c.max_queue_size,
        "cacheTtlMs": c.cache_ttl_ms,
        "provider": c.provider,
        "remoteExecutors": c.remote_executor_list(),
        "installId": s.install_id,
    }))
}

/// `GET /api/v1/providers`
pub async fn list_providers(State(s): State<Arc<Services>>) -> impl IntoResponse {
    let providers: Vec<serde_json::Value> = s
        .providers
        .names()
        .into_iter()
        .filter_map(|name| s.providers.get(name))
        .map(|p| {
            serde_json::json!({
                "name": p.name(),
                "installed": p.is_installed(),
                "authStatus": p.auth_status(),
            })
        })
        .collect();
    Json(serde_json::json!({ "providers": providers }))
}

/// `GET /api/v1/debug/processes`
pub async fn debug_processes(State(s): State<Arc<Services>>) -> impl IntoResponse {
    let processes: Vec<ProcessSummary> =
        s.supervisor.all_processes().await.iter().map(summarize).collect();
    Json(serde_json::json!({
        "processes": processes,
        "waitingDepth": s.supervisor.waiting_depth().await,
    }))
}

// -- Projects & session reads -------------------------------------------------

/// `GET /api/v1/projects`
pub async fn list_projects(State(s): State<Arc<Services>>) -> impl IntoResponse {
    let projects = s.projects.snapshot().await;
    Json(serde_json::json!({ "projects": *projects }))
}

/// `GET /api/v1/projects/{id}/sessions`
pub async fn list_sessions(
    State(s): State<Arc<Services>>,
    Path(id): Path<String>,
) -> Response {
    if decode_project_id(&id).is_err() {
        return err(ErrorCode::InvalidRequest);
    }
    let Some(project) = s.projects.find(&id).await else {
        return err(ErrorCode::NotFound);
    };
    let sessions = LogStore::list_sessions(&project.all_session_dirs());
    Json(serde_json::json!({ "sessions": sessions })).into_response()
}

/// `GET /api/v1/projects/{id}/sessions/{sid}?afterMessageId=…`
pub async fn get_session(
    State(s): State<Arc<Services>>,
    Path((id, sid)): Path<(String, String)>,
    Query(query): Query<AfterQuery>,
) -> Response {
    let Ok(project_path) = decode_project_id(&id) else {
        return err(ErrorCode::InvalidRequest);
    };
    let after = query.after_message_id.as_deref();

    // A live process answers from memory; both the temporary and promoted
    // ids resolve to the same history.
    if let Some(process) = s.supervisor.get_process_for_session(&sid).await {
        let visible: Vec<SessionRecord> = process
            .history()
            .into_iter()
            .filter(|r| !r.is_bookkeeping() && !r.is_stream_chunk())
            .collect();
        return Json(serde_json::json!({ "messages": filter_after(visible, after) }))
            .into_response();
    }

    let dirs = match s.projects.find(&id).await {
        Some(project) => project.all_session_dirs(),
        None => vec![s.store.project_dir(&project_path)],
    };
    let Some(path) = LogStore::find_session_file(&dirs, &sid) else {
        return err(ErrorCode::NotFound);
    };
    match LogStore::read_after(&path, after) {
        Ok(messages) => Json(serde_json::json!({ "messages": messages })).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "session read failed");
            err(ErrorCode::Internal)
        }
    }
}

/// `GET /api/v1/sessions/recent`
pub async fn recent_sessions(State(s): State<Arc<Services>>) -> impl IntoResponse {
    let projects = s.projects.snapshot().await;
    let mut sessions: Vec<serde_json::Value> = Vec::new();
    for project in projects.iter() {
        for summary in LogStore::list_sessions(&project.all_session_dirs()) {
            sessions.push(serde_json::json!({
                "projectId": project.id,
                "projectName": project.name,
                "sessionId": summary.session_id,
                "modifiedMs": summary.modified_ms,
                "sizeBytes": summary.size_bytes,
            }));
        }
    }
    sessions.sort_by_key(|s| std::cmp::Reverse(s["modifiedMs"].as_u64().unwrap_or(0)));
    sessions.truncate(50);
    Json(serde_json::json!({ "sessions": sessions }))
}

// -- Session lifecycle --------------------------------------------------------

/// `POST /api/v1/sessions/create`
pub async fn create_session(
    State(s): State<Arc<Services>>,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    if !req.project_path.is_absolute() || !req.project_path.is_dir() {
        return err(ErrorCode::InvalidRequest);
    }
    let mode = match req.mode.as_deref() {
        None => PermissionMode::Default,
        Some(raw) => match PermissionMode::parse(raw) {
            Some(mode) => mode,
            None => return err(ErrorCode::InvalidRequest),
        },
    };

    let outcome = s
        .supervisor
        .start_session(StartRequest {
            project_path: req.project_path,
            initial_message: req.message,
            mode,
            provider: req.provider,
        })
        .await;
    match outcome {
        Ok(StartOutcome::Started(process)) => Json(SessionCreated {
            session_id: process.session_id(),
            process_id: process.process_id(),
            state: process.state().as_str().to_owned(),
        })
        .into_response(),
        Ok(StartOutcome::Queued { queue_id, position }) => Json(serde_json::json!({
            "queued": true,
            "queueId": queue_id,
            "position": position,
        }))
        .into_response(),
        Ok(StartOutcome::QueueFull) => err(ErrorCode::QueueFull),
        Err(e) => {
            tracing::error!(error = %e, "session start failed");
            err(ErrorCode::Internal)
        }
    }
}

/// `POST /api/v1/sessions/{sid}/resume`
///
/// Reuses the live process when one exists; otherwise recreates one bound
/// to the session id, replaying its on-disk log before dispatching the
/// initial message.
pub async fn resume_session(
    State(s): State<Arc<Services>>,
    Path(sid): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Response {
    let mode = match req.mode.as_deref() {
        None => PermissionMode::Default,
        Some(raw) => match PermissionMode::parse(raw) {
            Some(mode) => mode,
            None => return err(ErrorCode::InvalidRequest),
        },
    };
    let project_path = match req.project_path {
        Some(path) if path.is_absolute() => path,
        Some(_) => return err(ErrorCode::InvalidRequest),
        None => {
            // Locate the project owning this session's log.
            let mut found = None;
            for project in s.projects.snapshot().await.iter() {
                if LogStore::find_session_file(&project.all_session_dirs(), &sid).is_some() {
                    found = Some(project.path.clone());
                    break;
                }
            }
            match found {
                Some(path) => path,
                None => return err(ErrorCode::NotFound),
            }
        }
    };

    match s.supervisor.resume_session(&sid, &project_path, req.message, mode, req.provider).await
    {
        Ok(process) => Json(SessionCreated {
            session_id: process.session_id(),
            process_id: process.process_id(),
            state: process.state().as_str().to_owned(),
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "session resume failed");
            err(ErrorCode::Internal)
        }
    }
}

/// `POST /api/v1/sessions/{sid}/send`
pub async fn send_message(
    State(s): State<Arc<Services>>,
    Path(sid): Path<String>,
    Json(req): Json<SendRequest>,
) -> Response {
    let Some(process) = s.supervisor.get_process_for_session(&sid).await else {
        return err(ErrorCode::NotFound);
    };

    // Subscribe before queueing so the idle edge cannot be missed.
    let mut sub = req.blocking.then(|| process.subscribe());

    let queued = match process.queue_message(req.text, vec![]).await {
        Ok(queued) => queued,
        Err(e) => return err(e.into()),
    };

    if let Some(ref mut sub) = sub {
        let deadline = Duration::from_millis(s.config.idle_timeout_ms);
        let waited = tokio::time::timeout(deadline, async {
            while let Some(event) = sub.rx.recv().await {
                match event {
                    ProcessEvent::StateChange { state: ProcessState::Idle { .. } }
                    | ProcessEvent::Complete { .. } => return,
                    _ => continue,
                }
            }
        })
        .await;
        if waited.is_err() {
            return err(ErrorCode::Timeout);
        }
    }

    Json(serde_json::json!({
        "queued": true,
        "messageId": queued.message_id,
        "position": queued.position,
    }))
    .into_response()
}

/// `POST /api/v1/sessions/{sid}/mode`
pub async fn set_mode(
    State(s): State<Arc<Services>>,
    Path(sid): Path<String>,
    Json(req): Json<ModeRequest>,
) -> Response {
    let Some(process) = s.supervisor.get_process_for_session(&sid).await else {
        return err(ErrorCode::NotFound);
    };
    let Some(mode) = PermissionMode::parse(&req.mode) else {
        return err(ErrorCode::InvalidRequest);
    };
    if process.state().is_terminal() {
        return err(ErrorCode::ProcessTerminated);
    }
    let mode_version = process.set_permission_mode(mode);
    Json(serde_json::json!({ "mode": mode, "modeVersion": mode_version })).into_response()
}

/// `POST /api/v1/sessions/{sid}/respond`
pub async fn respond(
    State(s): State<Arc<Services>>,
    Path(sid): Path<String>,
    Json(req): Json<RespondRequest>,
) -> Response {
    let Some(process) = s.supervisor.get_process_for_session(&sid).await else {
        return err(ErrorCode::NotFound);
    };
    match process.respond(&req.request_id, req.approve, req.answer.as_deref()) {
        Ok(()) => Json(serde_json::json!({ "delivered": true })).into_response(),
        Err(code) => err(code),
    }
}

/// `DELETE /api/v1/sessions/{sid}`
pub async fn abort_session(
    State(s): State<Arc<Services>>,
    Path(sid): Path<String>,
) -> Response {
    let Some(process) = s.supervisor.get_process_for_session(&sid).await else {
        return err(ErrorCode::NotFound);
    };
    let aborted = s.supervisor.abort_process(&process.process_id()).await;
    Json(serde_json::json!({ "aborted": aborted })).into_response()
}

/// `GET /api/v1/sessions/queue/{queue_id}`
pub async fn queue_status(
    State(s): State<Arc<Services>>,
    Path(queue_id): Path<String>,
) -> Response {
    match s.supervisor.ticket_status(&queue_id).await {
        Some(status) => Json(serde_json::json!({ "ticket": status })).into_response(),
        None => err(ErrorCode::NotFound),
    }
}

/// `DELETE /api/v1/sessions/queue/{queue_id}`
pub async fn cancel_queued(
    State(s): State<Arc<Services>>,
    Path(queue_id): Path<String>,
) -> Response {
    if s.supervisor.ticket_status(&queue_id).await.is_none() {
        return err(ErrorCode::NotFound);
    }
    let cancelled = s.supervisor.cancel_ticket(&queue_id).await;
    Json(serde_json::json!({ "cancelled": cancelled })).into_response()
}

// -- Auth ---------------------------------------------------------------------

/// `GET /api/v1/auth/status`
pub async fn auth_status(State(s): State<Arc<Services>>) -> impl IntoResponse {
    Json(s.auth.status())
}

/// `POST /api/v1/auth/setup`
pub async fn auth_setup(
    State(s): State<Arc<Services>>,
    Json(req): Json<PasswordRequest>,
) -> Response {
    match s.auth.setup(&req.password) {
        Ok(()) => Json(serde_json::json!({ "created": true })).into_response(),
        Err(code) => err(code),
    }
}

/// `POST /api/v1/auth/login`
pub async fn auth_login(
    State(s): State<Arc<Services>>,
    Json(req): Json<PasswordRequest>,
) -> Response {
    match s.auth.login(&req.password) {
        Ok(token) => {
            let cookie = format!("{COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Strict");
            ([(axum::http::header::SET_COOKIE, cookie)], Json(serde_json::json!({"ok": true})))
                .into_response()
        }
        Err(code) => err(code),
    }
}

/// `POST /api/v1/auth/logout`
pub async fn auth_logout(State(s): State<Arc<Services>>, headers: HeaderMap) -> Response {
    if let Some(token) = session_cookie(&headers) {
        s.auth.logout(&token);
    }
    let clear = format!("{COOKIE_NAME}=; Path=/; HttpOnly; Max-Age=0");
    ([(axum::http::header::SET_COOKIE, clear)], Json(serde_json::json!({"ok": true})))
        .into_response()
}

/// `POST /api/v1/auth/password`
pub async fn auth_change_password(
    State(s): State<Arc<Services>>,
    Json(req): Json<ChangePasswordRequest>,
) -> Response {
    match s.auth.change_password(&req.old_password, &req.new_password) {
        Ok(()) => Json(serde_json::json!({ "changed": true })).into_response(),
        Err(code) => err(code),
    }
}
