// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The relay endpoint: one WebSocket carrying SRP control frames and
//! encrypted, sequenced tunneled requests and event streams.

pub mod conn;
pub mod crypto;
pub mod msg;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::sync::mpsc;
use tower::util::ServiceExt;

use crate::auth::policy::{classify, ConnectionPolicy, PolicyInput};
use crate::auth::AuthStore;
use crate::error::ErrorCode;
use crate::record::now_ms;
use crate::relay::conn::{AuthState, RelayConnection};
use crate::relay::msg::{ControlMessage, TunnelFrame, TunnelReply};
use crate::srp::limit::{connection_gate, FailureGate, IdentityLimiter};
use crate::srp::resume::{ResumeProofPayload, ResumeStore, StoredSession};
use crate::srp::ServerHandshake;
use crate::state::Services;
use crate::subscribe::SessionStream;

/// Header the off-host relay stamps on forwarded connections.
pub const RELAY_FORWARD_HEADER: &str = "x-porter-relay";

/// Handshake must complete within this window after `srp_hello`.
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);
/// A resume challenge stays answerable for its full validity window.
pub const RESUME_CHALLENGE_DEADLINE: Duration = Duration::from_secs(60);

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// What the handshake engine wants done with the socket. Close codes come
/// from [`ErrorCode::ws_close_code`].
pub enum ControlOutcome {
    Reply(ControlMessage),
    Close { code: ErrorCode, reason: &'static str },
    ReplyThenClose { reply: ControlMessage, code: ErrorCode, reason: &'static str },
}

/// Everything the handshake engine needs from the wider server.
pub struct RelayContext {
    pub auth: Arc<AuthStore>,
    pub limiter: Arc<IdentityLimiter>,
    pub resume: Arc<ResumeStore>,
}

/// Socket-free handshake and framing state machine for one connection.
pub struct RelaySession {
    pub conn: RelayConnection,
    ctx: Arc<RelayContext>,
    gate: FailureGate,
    handshake: Option<(String, ServerHandshake)>,
    /// Armed at `srp_hello` (handshake window) or `srp_resume_init`
    /// (challenge validity), disarmed once the transport is established.
    pub deadline: Option<tokio::time::Instant>,
}

impl RelaySession {
    pub fn new(policy: ConnectionPolicy, ctx: Arc<RelayContext>) -> Self {
        Self {
            conn: RelayConnection::new(policy),
            ctx,
            gate: connection_gate(),
            handshake: None,
            deadline: None,
        }
    }

    /// Drive one SRP control message.
    pub fn handle_control(&mut self, msg: ControlMessage) -> ControlOutcome {
        match msg {
            ControlMessage::SrpHello { identity, .. } => self.on_hello(identity),
            ControlMessage::SrpProof { a, m1 } => self.on_proof(&a, &m1),
            ControlMessage::SrpResumeInit { session_id, identity } => {
                self.on_resume_init(session_id, &identity)
            }
            ControlMessage::SrpResume { session_id, identity, proof } => {
                self.on_resume_proof(&session_id, &identity, &proof)
            }
            // Server-to-client shapes arriving inbound are protocol errors.
            _ => ControlOutcome::Close {
                code: ErrorCode::InvalidRequest,
                reason: "unexpected control",
            },
        }
    }

    fn on_hello(&mut self, identity: String) -> ControlOutcome {
        // A second hello mid-handshake restarts it; after authentication it
        // is a protocol error.
        if self.conn.auth_state == AuthState::Authenticated {
            return ControlOutcome::Close {
                code: ErrorCode::InvalidRequest,
                reason: "already authenticated",
            };
        }
        if !self.gate.admit() || !self.ctx.limiter.admit(&identity) {
            tracing::warn!(%identity, "srp hello rate-limited");
            return ControlOutcome::Close { code: ErrorCode::RateLimited, reason: "rate limited" };
        }
        let Some(credential) = self.ctx.auth.srp_credential(&identity) else {
            tracing::warn!(%identity, "srp hello for unknown identity");
            return ControlOutcome::ReplyThenClose {
                reply: ControlMessage::SrpInvalid {},
                code: ErrorCode::Unauthorized,
                reason: "invalid",
            };
        };
        let (Ok(salt), Ok(verifier)) =
            (B64.decode(&credential.salt_b64), B64.decode(&credential.verifier_b64))
        else {
            return ControlOutcome::Close { code: ErrorCode::Internal, reason: "corrupt credential" };
        };

        let handshake = ServerHandshake::begin(&identity, &salt, &verifier);
        let reply = ControlMessage::SrpChallenge {
            salt: credential.salt_b64,
            b: B64.encode(handshake.b_pub()),
        };
        self.handshake = Some((identity, handshake));
        self.conn.auth_state = AuthState::SrpWaitingProof;
        self.deadline = Some(tokio::time::Instant::now() + HANDSHAKE_DEADLINE);
        ControlOutcome::Reply(reply)
    }

    fn on_proof(&mut self, a_b64: &str, m1_b64: &str) -> ControlOutcome {
        let Some((identity, handshake)) = self.handshake.take() else {
            return ControlOutcome::Close {
                code: ErrorCode::Unauthorized,
                reason: "proof before hello",
            };
        };
        let (Ok(a), Ok(m1)) = (B64.decode(a_b64), B64.decode(m1_b64)) else {
            return ControlOutcome::Close { code: ErrorCode::Unauthorized, reason: "invalid" };
        };

        match handshake.verify(&a, &m1) {
            Ok((srp_key, m2)) => {
                self.gate.record_success();
                self.ctx.limiter.record_success(&identity);

                let base = crypto::derive_traffic_key(&srp_key);
                let mut nonce = [0u8; crypto::NONCE_LEN];
                rand::rng().fill_bytes(&mut nonce);
                let transport = crypto::derive_transport_key(&base, &nonce);

                let session_id = crate::auth::random_token();
                self.ctx.resume.insert(StoredSession {
                    session_id: session_id.clone(),
                    identity,
                    traffic_key: transport,
                    created_at_ms: now_ms(),
                    last_used_ms: now_ms(),
                });
                self.conn.establish(base, transport);
                self.deadline = None;
                ControlOutcome::Reply(ControlMessage::SrpVerify {
                    m2: B64.encode(m2),
                    session_id,
                    nonce: B64.encode(nonce),
                })
            }
            Err(_) => {
                self.gate.record_failure();
                self.ctx.limiter.record_failure(&identity);
                tracing::warn!(%identity, "srp proof failed");
                self.conn.auth_state = AuthState::Unauthenticated;
                ControlOutcome::ReplyThenClose {
                    reply: ControlMessage::SrpInvalid {},
                    code: ErrorCode::Unauthorized,
                    reason: "invalid",
                }
            }
        }
    }

    fn on_resume_init(&mut self, session_id: String, identity: &str) -> ControlOutcome {
        if !self.gate.admit() || !self.ctx.limiter.admit(identity) {
            return ControlOutcome::Close { code: ErrorCode::RateLimited, reason: "rate limited" };
        }
        match self.ctx.resume.issue_challenge(&session_id) {
            Some(nonce) => {
                // The challenge is valid for 60s; keep the socket open for
                // the whole window, not just the fresh-handshake deadline.
                self.deadline =
                    Some(tokio::time::Instant::now() + RESUME_CHALLENGE_DEADLINE);
                ControlOutcome::Reply(ControlMessage::SrpResumeChallenge {
                    session_id,
                    nonce: B64.encode(nonce),
                })
            }
            // Unknown session and bad proof are indistinguishable outside.
            None => ControlOutcome::ReplyThenClose {
                reply: ControlMessage::SrpInvalid {},
                code: ErrorCode::Unauthorized,
                reason: "invalid",
            },
        }
    }

    fn on_resume_proof(
        &mut self,
        session_id: &str,
        identity: &str,
        proof_b64: &str,
    ) -> ControlOutcome {
        let invalid = || ControlOutcome::ReplyThenClose {
            reply: ControlMessage::SrpInvalid {},
            code: ErrorCode::Unauthorized,
            reason: "invalid",
        };
        let Some(key) = self.ctx.resume.stored_key(session_id) else {
            return invalid();
        };
        let Ok(envelope) = B64.decode(proof_b64) else {
            return invalid();
        };
        let Ok(plain) = crypto::open(&key, &envelope) else {
            self.gate.record_failure();
            self.ctx.limiter.record_failure(identity);
            return invalid();
        };
        let Ok(payload) = serde_json::from_slice::<ResumeProofPayload>(&plain) else {
            return invalid();
        };
        if !self.ctx.resume.validate_proof(session_id, identity, &payload) {
            self.gate.record_failure();
            self.ctx.limiter.record_failure(identity);
            return invalid();
        }

        self.gate.record_success();
        self.ctx.limiter.record_success(identity);
        // The connection inherits the stored traffic key.
        self.conn.establish(key, key);
        self.deadline = None;
        ControlOutcome::Reply(ControlMessage::SrpResumed { session_id: session_id.to_owned() })
    }
}

/// `GET /relay` — WebSocket upgrade with policy classification.
pub async fn relay_handler(
    State(services): State<Arc<Services>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let policy = classify(PolicyInput {
        via_relay: headers.contains_key(RELAY_FORWARD_HEADER),
        remote_access_enabled: services.config.auth_enabled,
        has_valid_cookie: crate::transport::has_local_trust(&services, &headers),
    });
    tracing::debug!(policy = policy.as_str(), "relay upgrade");
    ws.on_upgrade(move |socket| handle_socket(services, socket, policy))
}

async fn handle_socket(services: Arc<Services>, socket: WebSocket, policy: ConnectionPolicy) {
    let ctx = Arc::new(RelayContext {
        auth: Arc::clone(&services.auth),
        limiter: Arc::clone(&services.limiter),
        resume: Arc::clone(&services.resume),
    });
    let mut session = RelaySession::new(policy, ctx);
    let (mut ws_tx, mut ws_rx) = socket.split();
    // Stream tasks push replies here; the loop stamps seq and encrypts.
    let (out_tx, mut out_rx) = mpsc::channel::<TunnelReply>(64);

    loop {
        let deadline = session.deadline;
        tokio::select! {
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                let _ = close(&mut ws_tx, ErrorCode::Timeout, "handshake timeout").await;
                break;
            }
            Some(reply) = out_rx.recv() => {
                if send_reply(&mut ws_tx, &mut session, reply).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match msg {
                    Message::Text(text) => {
                        if handle_text(&services, &mut session, &mut ws_tx, &out_tx, text.as_str())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Message::Binary(bytes) => {
                        if handle_binary(&services, &mut session, &mut ws_tx, &out_tx, &bytes)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
}

type WsSink = futures_util::stream::SplitSink<WebSocket, Message>;

async fn close(tx: &mut WsSink, code: ErrorCode, reason: &'static str) -> Result<(), axum::Error> {
    tx.send(Message::Close(Some(CloseFrame { code: code.ws_close_code(), reason: reason.into() })))
        .await
}

async fn send_control(tx: &mut WsSink, msg: &ControlMessage) -> Result<(), ()> {
    let Ok(json) = serde_json::to_string(msg) else {
        return Err(());
    };
    tx.send(Message::Text(json.into())).await.map_err(|_| ())
}

/// Stamp, encrypt (when established), and send one outbound reply.
async fn send_reply(
    tx: &mut WsSink,
    session: &mut RelaySession,
    mut reply: TunnelReply,
) -> Result<(), ()> {
    if session.conn.established() {
        reply.set_seq(session.conn.next_seq());
        let Ok(plain) = serde_json::to_vec(&reply) else {
            return Err(());
        };
        let Ok(envelope) = session.conn.seal_outbound(&plain) else {
            return Err(());
        };
        tx.send(Message::Binary(envelope.into())).await.map_err(|_| ())
    } else {
        let Ok(json) = serde_json::to_string(&reply) else {
            return Err(());
        };
        tx.send(Message::Text(json.into())).await.map_err(|_| ())
    }
}

async fn handle_text(
    services: &Arc<Services>,
    session: &mut RelaySession,
    tx: &mut WsSink,
    out_tx: &mpsc::Sender<TunnelReply>,
    text: &str,
) -> Result<(), ()> {
    // SRP control frames are plaintext by design.
    if let Ok(control) = serde_json::from_str::<ControlMessage>(text) {
        return match session.handle_control(control) {
            ControlOutcome::Reply(reply) => send_control(tx, &reply).await,
            ControlOutcome::ReplyThenClose { reply, code, reason } => {
                let _ = send_control(tx, &reply).await;
                let _ = close(tx, code, reason).await;
                Err(())
            }
            ControlOutcome::Close { code, reason } => {
                let _ = close(tx, code, reason).await;
                Err(())
            }
        };
    }

    // Legacy JSON encrypted envelope travels as a text frame.
    if let Ok(envelope) = serde_json::from_str::<crypto::LegacyEnvelope>(text) {
        if envelope.r#type == "encrypted" {
            if !session.conn.established() {
                let _ = close(tx, ErrorCode::Unauthorized, "auth required").await;
                return Err(());
            }
            let plain = match open_legacy_with_fallback(&mut session.conn, &envelope) {
                Ok(plain) => plain,
                Err(()) => {
                    let _ = close(tx, ErrorCode::ReplayDetected, "Replay detected").await;
                    return Err(());
                }
            };
            return handle_plain_frame(services, session, tx, out_tx, &plain).await;
        }
    }

    // A plaintext application frame.
    if session.conn.policy.requires_srp() {
        let _ = close(tx, ErrorCode::Unauthorized, "auth required").await;
        return Err(());
    }
    if session.conn.established() {
        let _ = close(tx, ErrorCode::InvalidRequest, "plaintext after auth").await;
        return Err(());
    }
    handle_plain_frame(services, session, tx, out_tx, text.as_bytes()).await
}

fn open_legacy_with_fallback(
    conn: &mut RelayConnection,
    envelope: &crypto::LegacyEnvelope,
) -> Result<Vec<u8>, ()> {
    // Rebuild the binary envelope shape so the connection's one-shot base
    // key fallback applies uniformly.
    let nonce = B64.decode(&envelope.nonce).map_err(|_| ())?;
    let ciphertext = B64.decode(&envelope.ciphertext).map_err(|_| ())?;
    if nonce.len() != crypto::NONCE_LEN {
        return Err(());
    }
    let mut bytes = Vec::with_capacity(1 + nonce.len() + ciphertext.len());
    bytes.push(crypto::ENVELOPE_VERSION);
    bytes.extend_from_slice(&nonce);
    bytes.extend_from_slice(&ciphertext);
    conn.open_inbound(&bytes).map_err(|_| ())
}

async fn handle_binary(
    services: &Arc<Services>,
    session: &mut RelaySession,
    tx: &mut WsSink,
    out_tx: &mpsc::Sender<TunnelReply>,
    bytes: &[u8],
) -> Result<(), ()> {
    if !session.conn.established() {
        let _ = close(tx, ErrorCode::Unauthorized, "auth required").await;
        return Err(());
    }
    let plain = match session.conn.open_inbound(bytes) {
        Ok(plain) => plain,
        Err(_) => {
            let _ = close(tx, ErrorCode::ReplayDetected, "Replay detected").await;
            return Err(());
        }
    };
    handle_plain_frame(services, session, tx, out_tx, &plain).await
}

async fn handle_plain_frame(
    services: &Arc<Services>,
    session: &mut RelaySession,
    tx: &mut WsSink,
    out_tx: &mpsc::Sender<TunnelReply>,
    plain: &[u8],
) -> Result<(), ()> {
    let Ok(frame) = serde_json::from_slice::<TunnelFrame>(plain) else {
        tracing::debug!("unparseable tunnel frame");
        return Ok(());
    };
    if session.conn.established() && session.conn.check_inbound_seq(frame.seq()).is_err() {
        let _ = close(tx, ErrorCode::ReplayDetected, "Replay detected").await;
        return Err(());
    }

    match frame {
        TunnelFrame::Ping { id, .. } => {
            send_reply(tx, session, TunnelReply::Pong { id, seq: None }).await
        }
        TunnelFrame::Request { id, method, path, headers, body, .. } => {
            let reply = dispatch_request(services, id, &method, &path, headers, body).await;
            send_reply(tx, session, reply).await
        }
        TunnelFrame::StreamRequest { id, path, .. } => {
            start_stream(services, out_tx, id, &path).await;
            Ok(())
        }
    }
}

/// Tunnel one HTTP request into the local router.
async fn dispatch_request(
    services: &Arc<Services>,
    id: String,
    method: &str,
    path: &str,
    headers: Option<std::collections::HashMap<String, String>>,
    body: Option<String>,
) -> TunnelReply {
    let error = |status: u16| TunnelReply::Response {
        id: id.clone(),
        status,
        headers: None,
        body: None,
        seq: None,
    };

    let Some(router) = services.internal_router() else {
        return error(500);
    };
    let Ok(method) = method.parse::<axum::http::Method>() else {
        return error(400);
    };
    let mut builder = axum::http::Request::builder().method(method).uri(path);
    if let Some(headers) = headers {
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
    }
    // Tunneled requests carry relay trust; skip the cookie layer.
    builder = builder
        .header("content-type", "application/json")
        .header(crate::transport::INTERNAL_TOKEN_HEADER, &services.internal_token);
    let request = match builder.body(axum::body::Body::from(body.unwrap_or_default())) {
        Ok(request) => request,
        Err(_) => return error(400),
    };

    let response = match router.oneshot(request).await {
        Ok(response) => response,
        Err(_) => return error(502),
    };
    let status = response.status().as_u16();
    let body = match axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024).await {
        Ok(bytes) => String::from_utf8(bytes.to_vec()).ok(),
        Err(_) => None,
    };
    TunnelReply::Response { id, status, headers: None, body, seq: None }
}

/// Open a logical SSE stream for a tunneled `stream_request`.
///
/// Only the session stream surface exists today; each event is wrapped as
/// `stream_event{id, event, data}` with a final `stream_end{id}`.
async fn start_stream(
    services: &Arc<Services>,
    out_tx: &mpsc::Sender<TunnelReply>,
    id: String,
    path: &str,
) {
    let session_id = path
        .strip_prefix("/api/v1/sessions/")
        .and_then(|rest| rest.strip_suffix("/stream"))
        .map(str::to_owned);
    let Some(session_id) = session_id else {
        let _ = out_tx
            .send(TunnelReply::Response { id, status: 404, headers: None, body: None, seq: None })
            .await;
        return;
    };
    let Some(process) = services.supervisor.get_process_for_session(&session_id).await else {
        let _ = out_tx
            .send(TunnelReply::Response { id, status: 404, headers: None, body: None, seq: None })
            .await;
        return;
    };

    let mut stream = SessionStream::new(&process);
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let Ok(data) = serde_json::to_value(&item.event) else {
                continue;
            };
            let reply = TunnelReply::StreamEvent {
                id: id.clone(),
                event: item.event.name().to_owned(),
                data,
                seq: None,
            };
            if out_tx.send(reply).await.is_err() {
                return;
            }
        }
        let _ = out_tx.send(TunnelReply::StreamEnd { id, seq: None }).await;
    });
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;
