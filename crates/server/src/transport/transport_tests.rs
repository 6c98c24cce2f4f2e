// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::future::Future;
use std::time::Duration;

use axum_test::TestServer;
use clap::Parser;
use serde_json::Value;

use crate::config::Config;
use crate::record::encode_project_id;
use crate::run::prepare;

struct Harness {
    _dir: tempfile::TempDir,
    project_path: std::path::PathBuf,
    server: TestServer,
}

/// Stub agent: announce a real session id, answer every message, park.
const ECHO_AGENT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"real-xyz","cwd":"/tmp"}'
i=0
while read line; do
  i=$((i+1))
  printf '{"type":"assistant","message":{"id":"reply_%s","role":"assistant","content":[{"type":"text","text":"ack %s"}]}}\n' "$i" "$i"
  printf '{"type":"result","subtype":"success"}\n'
done
sleep 30
"#;

fn harness_with(extra_args: &[&str], agent: &str) -> anyhow::Result<Harness> {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir()?;
    let agent_path = dir.path().join("agent.sh");
    std::fs::write(&agent_path, agent)?;
    let mut perms = std::fs::metadata(&agent_path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&agent_path, perms)?;

    let project_path = dir.path().join("project");
    std::fs::create_dir_all(&project_path)?;
    let data_dir = dir.path().join("data");

    let mut argv = vec![
        "porter".to_owned(),
        "--data-dir".to_owned(),
        data_dir.to_string_lossy().into_owned(),
        "--agent-cmd".to_owned(),
        agent_path.to_string_lossy().into_owned(),
        "--cache-ttl-ms".to_owned(),
        "0".to_owned(),
    ];
    argv.extend(extra_args.iter().map(|s| s.to_string()));
    let config = Config::try_parse_from(argv)?;

    let services = prepare(config)?;
    let router = services
        .internal_router()
        .ok_or_else(|| anyhow::anyhow!("router missing"))?;
    let mut server = TestServer::new(router).map_err(|e| anyhow::anyhow!("{e}"))?;
    server.save_cookies();

    Ok(Harness { _dir: dir, project_path, server })
}

fn harness() -> anyhow::Result<Harness> {
    harness_with(&[], ECHO_AGENT)
}

/// Poll `f` until it returns `Some` or five seconds pass.
async fn wait_for<T, F, Fut>(f: F) -> anyhow::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = f().await {
            return Ok(value);
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn health_reports_running() -> anyhow::Result<()> {
    let h = harness()?;
    let response = h.server.get("/api/v1/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "running");
    assert!(body["installId"].is_string());
    Ok(())
}

#[tokio::test]
async fn empty_scan_lists_virtual_home_project() -> anyhow::Result<()> {
    let h = harness()?;
    let body: Value = h.server.get("/api/v1/projects").await.json();
    let projects = body["projects"].as_array().cloned().unwrap_or_default();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0]["synthetic"], true);
    Ok(())
}

#[tokio::test]
async fn invalid_project_id_is_rejected() -> anyhow::Result<()> {
    let h = harness()?;
    let response = h.server.get("/api/v1/projects/not%20base64!/sessions").await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn create_send_and_incremental_read() -> anyhow::Result<()> {
    let h = harness()?;
    let project_id = encode_project_id(&h.project_path);

    // Scenario: start with an initial message; the response is in-turn.
    let response = h
        .server
        .post("/api/v1/sessions/create")
        .json(&serde_json::json!({
            "projectPath": h.project_path,
            "message": "hi",
        }))
        .await;
    response.assert_status_ok();
    let created: Value = response.json();
    assert_eq!(created["state"], "in-turn");
    let tmp_sid = created["sessionId"].as_str().unwrap_or_default().to_owned();
    assert!(tmp_sid.starts_with("tmp-"));

    // The child promotes the session id; both ids serve the same history.
    // Wait until the first assistant reply has been committed.
    let messages = wait_for(|| async {
        let response = h
            .server
            .get(&format!("/api/v1/projects/{project_id}/sessions/real-xyz"))
            .await;
        if response.status_code() != axum::http::StatusCode::OK {
            return None;
        }
        let body: Value = response.json();
        let messages = body["messages"].as_array().cloned().unwrap_or_default();
        messages.iter().any(|m| m["type"] == "assistant").then_some(messages)
    })
    .await?;

    assert_eq!(messages[0]["type"], "user");
    assert_eq!(messages[0]["message"]["content"][0]["text"], "hi");

    // Incremental read: after the first uuid only the tail returns.
    let first_uuid = messages[0]["uuid"].as_str().unwrap_or_default().to_owned();
    let body: Value = h
        .server
        .get(&format!(
            "/api/v1/projects/{project_id}/sessions/real-xyz?afterMessageId={first_uuid}"
        ))
        .await
        .json();
    let tail = body["messages"].as_array().cloned().unwrap_or_default();
    assert_eq!(tail.len(), messages.len() - 1);

    // After the last uuid the list is empty.
    let last_uuid = messages[messages.len() - 1]["uuid"].as_str().unwrap_or_default().to_owned();
    let body: Value = h
        .server
        .get(&format!(
            "/api/v1/projects/{project_id}/sessions/real-xyz?afterMessageId={last_uuid}"
        ))
        .await
        .json();
    assert_eq!(body["messages"].as_array().map(Vec::len), Some(0));

    // Unknown uuid falls back to the full visible history.
    let body: Value = h
        .server
        .get(&format!(
            "/api/v1/projects/{project_id}/sessions/real-xyz?afterMessageId=unknown"
        ))
        .await
        .json();
    assert_eq!(body["messages"].as_array().map(Vec::len), Some(messages.len()));

    // Follow-up send succeeds against the promoted id.
    let response = h
        .server
        .post("/api/v1/sessions/real-xyz/send")
        .json(&serde_json::json!({"text": "again"}))
        .await;
    response.assert_status_ok();
    Ok(())
}

#[tokio::test]
async fn blocking_send_waits_for_idle() -> anyhow::Result<()> {
    let h = harness()?;
    let response = h
        .server
        .post("/api/v1/sessions/create")
        .json(&serde_json::json!({"projectPath": h.project_path}))
        .await;
    response.assert_status_ok();

    let sid = wait_for(|| async {
        let body: Value = h.server.get("/api/v1/debug/processes").await.json();
        body["processes"][0]["sessionId"].as_str().map(str::to_owned)
    })
    .await?;

    let response = h
        .server
        .post(&format!("/api/v1/sessions/{sid}/send"))
        .json(&serde_json::json!({"text": "ping", "blocking": true}))
        .await;
    response.assert_status_ok();

    // After a blocking send the process has returned to idle.
    let body: Value = h.server.get("/api/v1/debug/processes").await.json();
    assert_eq!(body["processes"][0]["state"], "idle");
    Ok(())
}

#[tokio::test]
async fn admission_queue_over_http() -> anyhow::Result<()> {
    let h = harness_with(&["--per-project-cap", "1"], ECHO_AGENT)?;

    let first: Value = h
        .server
        .post("/api/v1/sessions/create")
        .json(&serde_json::json!({"projectPath": h.project_path, "message": "one"}))
        .await
        .json();
    let first_sid = first["sessionId"].as_str().unwrap_or_default().to_owned();

    let queued: Value = h
        .server
        .post("/api/v1/sessions/create")
        .json(&serde_json::json!({"projectPath": h.project_path, "message": "two"}))
        .await
        .json();
    assert_eq!(queued["queued"], true);
    assert_eq!(queued["position"], 0);
    let queue_id = queued["queueId"].as_str().unwrap_or_default().to_owned();

    let ticket: Value =
        h.server.get(&format!("/api/v1/sessions/queue/{queue_id}")).await.json();
    assert_eq!(ticket["ticket"]["status"], "pending");

    // Aborting the first session advances the queue.
    h.server.delete(&format!("/api/v1/sessions/{first_sid}")).await.assert_status_ok();

    let started_sid = wait_for(|| async {
        let ticket: Value =
            h.server.get(&format!("/api/v1/sessions/queue/{queue_id}")).await.json();
        if ticket["ticket"]["status"] == "started" {
            ticket["ticket"]["sessionId"].as_str().map(str::to_owned)
        } else {
            None
        }
    })
    .await?;

    // The admitted process is live and in-turn (or already idle).
    let body: Value = h.server.get("/api/v1/debug/processes").await.json();
    let states: Vec<&str> = body["processes"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter(|p| p["sessionId"] == started_sid.as_str())
                .filter_map(|p| p["state"].as_str())
                .collect()
        })
        .unwrap_or_default();
    assert!(!states.is_empty());
    Ok(())
}

#[tokio::test]
async fn resume_recreates_aborted_session_from_disk() -> anyhow::Result<()> {
    let h = harness()?;
    let project_id = encode_project_id(&h.project_path);

    h.server
        .post("/api/v1/sessions/create")
        .json(&serde_json::json!({"projectPath": h.project_path, "message": "hi"}))
        .await
        .assert_status_ok();

    // Wait for the turn to finish so the promoted log is on disk.
    wait_for(|| async {
        let response = h
            .server
            .get(&format!("/api/v1/projects/{project_id}/sessions/real-xyz"))
            .await;
        if response.status_code() != axum::http::StatusCode::OK {
            return None;
        }
        let body: Value = response.json();
        let messages = body["messages"].as_array().cloned().unwrap_or_default();
        messages.iter().any(|m| m["type"] == "assistant").then_some(())
    })
    .await?;

    h.server.delete("/api/v1/sessions/real-xyz").await.assert_status_ok();
    let body: Value = h.server.get("/api/v1/debug/processes").await.json();
    assert_eq!(body["processes"].as_array().map(Vec::len), Some(0));

    // Resume by id alone: the project is located from the on-disk log.
    let response = h
        .server
        .post("/api/v1/sessions/real-xyz/resume")
        .json(&serde_json::json!({"message": "back again"}))
        .await;
    response.assert_status_ok();
    let resumed: Value = response.json();
    assert_eq!(resumed["sessionId"], "real-xyz");

    // The replayed history precedes the new message.
    let body: Value = h
        .server
        .get(&format!("/api/v1/projects/{project_id}/sessions/real-xyz"))
        .await
        .json();
    let texts: Vec<String> = body["messages"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .filter(|m| m["type"] == "user")
        .filter_map(|m| m["message"]["content"][0]["text"].as_str().map(str::to_owned))
        .collect();
    assert_eq!(texts, vec!["hi".to_owned(), "back again".to_owned()]);
    Ok(())
}

#[tokio::test]
async fn send_to_unknown_session_is_404() -> anyhow::Result<()> {
    let h = harness()?;
    let response = h
        .server
        .post("/api/v1/sessions/ghost/send")
        .json(&serde_json::json!({"text": "hello"}))
        .await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn mode_endpoint_validates_and_versions() -> anyhow::Result<()> {
    let h = harness()?;
    h.server
        .post("/api/v1/sessions/create")
        .json(&serde_json::json!({"projectPath": h.project_path}))
        .await
        .assert_status_ok();
    let sid = wait_for(|| async {
        let body: Value = h.server.get("/api/v1/debug/processes").await.json();
        body["processes"][0]["sessionId"].as_str().map(str::to_owned)
    })
    .await?;

    let response = h
        .server
        .post(&format!("/api/v1/sessions/{sid}/mode"))
        .json(&serde_json::json!({"mode": "acceptEdits"}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["modeVersion"], 1);

    let response = h
        .server
        .post(&format!("/api/v1/sessions/{sid}/mode"))
        .json(&serde_json::json!({"mode": "yolo"}))
        .await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn auth_flow_guards_endpoints() -> anyhow::Result<()> {
    let h = harness_with(&["--auth-enabled"], ECHO_AGENT)?;

    // No account yet: nothing is guarded.
    let status: Value = h.server.get("/api/v1/auth/status").await.json();
    assert_eq!(status["accountExists"], false);
    assert_eq!(status["authRequired"], false);
    h.server.get("/api/v1/projects").await.assert_status_ok();

    h.server
        .post("/api/v1/auth/setup")
        .json(&serde_json::json!({"password": "correct horse battery"}))
        .await
        .assert_status_ok();

    // Account exists and auth is on: unauthenticated requests are rejected.
    let response = h.server.get("/api/v1/projects").await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    // Health stays open.
    h.server.get("/api/v1/health").await.assert_status_ok();

    let response = h
        .server
        .post("/api/v1/auth/login")
        .json(&serde_json::json!({"password": "wrong"}))
        .await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);

    h.server
        .post("/api/v1/auth/login")
        .json(&serde_json::json!({"password": "correct horse battery"}))
        .await
        .assert_status_ok();

    // The saved cookie now authorizes requests.
    h.server.get("/api/v1/projects").await.assert_status_ok();

    h.server.post("/api/v1/auth/logout").await.assert_status_ok();
    let response = h.server.get("/api/v1/projects").await;
    response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn settings_and_providers_endpoints() -> anyhow::Result<()> {
    let h = harness()?;
    let settings: Value = h.server.get("/api/v1/settings").await.json();
    assert_eq!(settings["perProjectCap"], 3);
    assert_eq!(settings["provider"], "claude");

    let providers: Value = h.server.get("/api/v1/providers").await.json();
    let names: Vec<&str> = providers["providers"]
        .as_array()
        .map(|list| list.iter().filter_map(|p| p["name"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(names, vec!["claude", "codex"]);
    Ok(())
}

#[tokio::test]
async fn recents_surface_sessions_across_projects() -> anyhow::Result<()> {
    let h = harness()?;
    h.server
        .post("/api/v1/sessions/create")
        .json(&serde_json::json!({"projectPath": h.project_path, "message": "hello"}))
        .await
        .assert_status_ok();

    // Wait until the log file exists on disk, then list recents.
    let sessions = wait_for(|| async {
        let body: Value = h.server.get("/api/v1/sessions/recent").await.json();
        let sessions = body["sessions"].as_array().cloned().unwrap_or_default();
        (!sessions.is_empty()).then_some(sessions)
    })
    .await?;
    assert_eq!(sessions[0]["projectId"], encode_project_id(&h.project_path));
    Ok(())
}

#[tokio::test]
async fn host_allowlist_blocks_unknown_hosts() -> anyhow::Result<()> {
    use tower::util::ServiceExt;

    let dir = tempfile::tempdir()?;
    let config = Config::try_parse_from([
        "porter",
        "--data-dir",
        &dir.path().to_string_lossy(),
        "--allowed-hosts",
        "allowed.example",
    ])?;
    let services = prepare(config)?;
    let router = services
        .internal_router()
        .ok_or_else(|| anyhow::anyhow!("router missing"))?;

    let request = axum::http::Request::builder()
        .uri("/api/v1/health")
        .header("host", "evil.example")
        .body(axum::body::Body::empty())?;
    let response = router.clone().oneshot(request).await?;
    assert_eq!(response.status(), axum::http::StatusCode::FORBIDDEN);

    let request = axum::http::Request::builder()
        .uri("/api/v1/health")
        .header("host", "allowed.example")
        .body(axum::body::Body::empty())?;
    let response = router.oneshot(request).await?;
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn create_rejects_missing_project_dir() -> anyhow::Result<()> {
    let h = harness()?;
    let response = h
        .server
        .post("/api/v1/sessions/create")
        .json(&serde_json::json!({"projectPath": "/definitely/not/here/porter"}))
        .await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);

    let response = h
        .server
        .post("/api/v1/sessions/create")
        .json(&serde_json::json!({"projectPath": "relative/path"}))
        .await;
    response.assert_status(axum::http::StatusCode::BAD_REQUEST);
    Ok(())
}
