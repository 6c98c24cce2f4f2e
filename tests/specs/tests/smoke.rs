// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `porter` binary and exercise
//! HTTP, SSE, and the relay WebSocket, including the SRP handshake.

use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use porter::relay::crypto;
use porter::srp::ClientHandshake;
use porter_specs::PorterProcess;

const TIMEOUT: Duration = Duration::from_secs(10);
const PASSWORD: &str = "correct horse battery";
const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn next_message(ws: &mut WsStream) -> anyhow::Result<Message> {
    let msg = tokio::time::timeout(TIMEOUT, ws.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("socket closed"))??;
    Ok(msg)
}

async fn next_json(ws: &mut WsStream) -> anyhow::Result<serde_json::Value> {
    match next_message(ws).await? {
        Message::Text(text) => Ok(serde_json::from_str(text.as_str())?),
        other => anyhow::bail!("expected text frame, got {other:?}"),
    }
}

// -- HTTP ---------------------------------------------------------------------

#[tokio::test]
async fn http_health() -> anyhow::Result<()> {
    let porter = PorterProcess::start()?;
    porter.wait_healthy(TIMEOUT).await?;

    let resp: serde_json::Value =
        reqwest::get(format!("{}/api/v1/health", porter.base_url())).await?.json().await?;

    assert_eq!(resp["status"], "running");
    assert!(resp["installId"].is_string());
    Ok(())
}

#[tokio::test]
async fn start_send_stream_complete() -> anyhow::Result<()> {
    let porter = PorterProcess::start()?;
    porter.wait_healthy(TIMEOUT).await?;
    let client = reqwest::Client::new();

    // Start a session with an initial message; the reply is in-turn.
    let created: serde_json::Value = client
        .post(format!("{}/api/v1/sessions/create", porter.base_url()))
        .json(&serde_json::json!({
            "projectPath": porter.project_path(),
            "message": "hi",
        }))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(created["state"], "in-turn");

    // Wait for the child to promote the session id.
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let debug: serde_json::Value = client
            .get(format!("{}/api/v1/debug/processes", porter.base_url()))
            .send()
            .await?
            .json()
            .await?;
        if debug["processes"][0]["sessionId"] == "smoke-session" {
            break;
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "promotion never happened");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The stream replays connected + the echoed user message.
    let mut resp = client
        .get(format!("{}/api/v1/sessions/smoke-session/stream", porter.base_url()))
        .send()
        .await?;
    let mut body = String::new();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !(body.contains("event: connected") && body.contains("\"hi\"")) {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "stream never replayed: {body}");
        let Some(chunk) = tokio::time::timeout(TIMEOUT, resp.chunk()).await?? else {
            anyhow::bail!("stream ended early: {body}");
        };
        body.push_str(&String::from_utf8_lossy(&chunk));
    }

    // Aborting the session ends the stream with a complete event.
    client
        .delete(format!("{}/api/v1/sessions/smoke-session", porter.base_url()))
        .send()
        .await?
        .error_for_status()?;
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !body.contains("event: complete") {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "no complete event: {body}");
        match tokio::time::timeout(TIMEOUT, resp.chunk()).await?? {
            Some(chunk) => body.push_str(&String::from_utf8_lossy(&chunk)),
            None => break,
        }
    }
    assert!(body.contains("event: complete"));
    Ok(())
}

// -- Relay WebSocket ----------------------------------------------------------

#[tokio::test]
async fn relay_plaintext_tunnel_when_unrestricted() -> anyhow::Result<()> {
    let porter = PorterProcess::start()?;
    porter.wait_healthy(TIMEOUT).await?;

    let (mut ws, _) = connect_async(porter.relay_url()).await?;

    ws.send(Message::text(r#"{"type":"ping","id":"p1"}"#)).await?;
    let pong = next_json(&mut ws).await?;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["id"], "p1");

    ws.send(Message::text(
        r#"{"type":"request","id":"r1","method":"GET","path":"/api/v1/health"}"#,
    ))
    .await?;
    let reply = next_json(&mut ws).await?;
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["id"], "r1");
    assert_eq!(reply["status"], 200);
    let body = reply["body"].as_str().unwrap_or_default();
    assert!(body.contains("running"));
    Ok(())
}

#[tokio::test]
async fn relay_rejects_plaintext_when_srp_required() -> anyhow::Result<()> {
    let porter = PorterProcess::build().arg("--auth-enabled").spawn()?;
    porter.wait_healthy(TIMEOUT).await?;

    let (mut ws, _) = connect_async(porter.relay_url()).await?;
    ws.send(Message::text(r#"{"type":"ping","id":"p1"}"#)).await?;

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "no close frame");
        match next_message(&mut ws).await? {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4001);
                return Ok(());
            }
            Message::Close(None) => anyhow::bail!("close without code"),
            _ => continue,
        }
    }
}

/// Run the client side of the SRP handshake over a fresh socket.
async fn srp_establish(ws: &mut WsStream) -> anyhow::Result<(String, [u8; 32])> {
    let client = ClientHandshake::begin("default");
    ws.send(Message::text(r#"{"type":"srp_hello","identity":"default"}"#)).await?;
    let challenge = next_json(ws).await?;
    assert_eq!(challenge["type"], "srp_challenge");

    let salt = B64.decode(challenge["salt"].as_str().unwrap_or_default())?;
    let b_pub = B64.decode(challenge["b"].as_str().unwrap_or_default())?;
    let (m1, key) =
        client.proof(PASSWORD, &salt, &b_pub).map_err(|_| anyhow::anyhow!("bad challenge"))?;

    ws.send(Message::text(
        serde_json::json!({
            "type": "srp_proof",
            "a": B64.encode(client.a_pub()),
            "m1": B64.encode(&m1),
        })
        .to_string(),
    ))
    .await?;
    let verify = next_json(ws).await?;
    assert_eq!(verify["type"], "srp_verify");
    assert!(client.confirm(
        &m1,
        &key,
        &B64.decode(verify["m2"].as_str().unwrap_or_default())?
    ));

    let session_id = verify["sessionId"].as_str().unwrap_or_default().to_owned();
    let nonce = B64.decode(verify["nonce"].as_str().unwrap_or_default())?;
    let base = crypto::derive_traffic_key(&key);
    let transport = crypto::derive_transport_key(&base, &nonce);
    Ok((session_id, transport))
}

fn sealed_ping(key: &[u8; 32], id: &str, seq: u64) -> anyhow::Result<Vec<u8>> {
    let frame = serde_json::json!({"type": "ping", "id": id, "seq": seq}).to_string();
    crypto::seal(key, frame.as_bytes()).map_err(|_| anyhow::anyhow!("seal failed"))
}

async fn setup_account(porter: &PorterProcess) -> anyhow::Result<()> {
    reqwest::Client::new()
        .post(format!("{}/api/v1/auth/setup", porter.base_url()))
        .json(&serde_json::json!({"password": PASSWORD}))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[tokio::test]
async fn relay_srp_handshake_and_replay_defense() -> anyhow::Result<()> {
    let porter = PorterProcess::build().arg("--auth-enabled").spawn()?;
    porter.wait_healthy(TIMEOUT).await?;
    setup_account(&porter).await?;

    let (mut ws, _) = connect_async(porter.relay_url()).await?;
    let (_session_id, transport) = srp_establish(&mut ws).await?;

    // First encrypted frame with seq 0 is accepted.
    let envelope = sealed_ping(&transport, "p1", 0)?;
    ws.send(Message::Binary(envelope.clone().into())).await?;
    match next_message(&mut ws).await? {
        Message::Binary(reply) => {
            let plain = crypto::open(&transport, &reply)
                .map_err(|_| anyhow::anyhow!("cannot decrypt reply"))?;
            let pong: serde_json::Value = serde_json::from_slice(&plain)?;
            assert_eq!(pong["type"], "pong");
            assert_eq!(pong["seq"], 0);
        }
        other => anyhow::bail!("expected binary reply, got {other:?}"),
    }

    // Replaying the exact same frame closes the socket with 4004.
    ws.send(Message::Binary(envelope.into())).await?;
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "no close frame");
        match next_message(&mut ws).await? {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 4004);
                assert_eq!(frame.reason.as_str(), "Replay detected");
                break;
            }
            _ => continue,
        }
    }
    Ok(())
}

#[tokio::test]
async fn relay_resume_after_reconnect() -> anyhow::Result<()> {
    let porter = PorterProcess::build().arg("--auth-enabled").spawn()?;
    porter.wait_healthy(TIMEOUT).await?;
    setup_account(&porter).await?;

    let (mut first, _) = connect_async(porter.relay_url()).await?;
    let (session_id, transport) = srp_establish(&mut first).await?;
    drop(first);

    // Reconnect and resume without a second SRP exchange.
    let (mut ws, _) = connect_async(porter.relay_url()).await?;
    ws.send(Message::text(
        serde_json::json!({
            "type": "srp_resume_init",
            "sessionId": session_id,
            "identity": "default",
        })
        .to_string(),
    ))
    .await?;
    let challenge = next_json(&mut ws).await?;
    assert_eq!(challenge["type"], "srp_resume_challenge");
    let nonce = challenge["nonce"].as_str().unwrap_or_default().to_owned();

    let payload = serde_json::json!({
        "timestamp": std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)?
            .as_millis() as u64,
        "sessionId": session_id,
        "challengeNonce": nonce,
    });
    let proof = crypto::seal(&transport, payload.to_string().as_bytes())
        .map_err(|_| anyhow::anyhow!("seal failed"))?;
    ws.send(Message::text(
        serde_json::json!({
            "type": "srp_resume",
            "sessionId": session_id,
            "identity": "default",
            "proof": B64.encode(proof),
        })
        .to_string(),
    ))
    .await?;
    let resumed = next_json(&mut ws).await?;
    assert_eq!(resumed["type"], "srp_resumed");
    assert_eq!(resumed["sessionId"], session_id.as_str());

    // The resumed connection is usable immediately.
    ws.send(Message::Binary(sealed_ping(&transport, "p2", 0)?.into())).await?;
    match next_message(&mut ws).await? {
        Message::Binary(reply) => {
            let plain = crypto::open(&transport, &reply)
                .map_err(|_| anyhow::anyhow!("cannot decrypt reply"))?;
            let pong: serde_json::Value = serde_json::from_slice(&plain)?;
            assert_eq!(pong["type"], "pong");
        }
        other => anyhow::bail!("expected binary reply, got {other:?}"),
    }
    Ok(())
}
