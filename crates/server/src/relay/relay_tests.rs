// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use base64::Engine;

use super::{
    crypto, ControlOutcome, RelayContext, RelaySession, HANDSHAKE_DEADLINE,
    RESUME_CHALLENGE_DEADLINE,
};
use crate::auth::policy::ConnectionPolicy;
use crate::auth::AuthStore;
use crate::error::ErrorCode;
use crate::record::now_ms;
use crate::relay::msg::ControlMessage;
use crate::srp::limit::IdentityLimiter;
use crate::srp::resume::{ResumeProofPayload, ResumeStore};
use crate::srp::ClientHandshake;

const PASSWORD: &str = "correct horse battery";
const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

struct Fixture {
    _dir: tempfile::TempDir,
    ctx: Arc<RelayContext>,
}

fn fixture() -> anyhow::Result<Fixture> {
    let dir = tempfile::tempdir()?;
    let auth = AuthStore::load(dir.path(), "default", true, false)?;
    auth.setup(PASSWORD).map_err(|e| anyhow::anyhow!("{e}"))?;
    let ctx = Arc::new(RelayContext {
        auth: Arc::new(auth),
        limiter: Arc::new(IdentityLimiter::new()),
        resume: Arc::new(ResumeStore::in_memory()),
    });
    Ok(Fixture { _dir: dir, ctx })
}

fn session(fixture: &Fixture) -> RelaySession {
    RelaySession::new(ConnectionPolicy::SrpRequired, Arc::clone(&fixture.ctx))
}

/// Run a full client-side handshake, returning `(session, session_id, key)`.
fn establish(fixture: &Fixture) -> anyhow::Result<(RelaySession, String, [u8; 32])> {
    let mut session = session(fixture);
    let client = ClientHandshake::begin("default");

    let hello = ControlMessage::SrpHello {
        identity: "default".to_owned(),
        browser_profile_id: None,
        origin: None,
    };
    let ControlOutcome::Reply(ControlMessage::SrpChallenge { salt, b }) =
        session.handle_control(hello)
    else {
        anyhow::bail!("expected challenge");
    };
    assert!(session.deadline.is_some());

    let salt_bytes = B64.decode(&salt)?;
    let b_bytes = B64.decode(&b)?;
    let (m1, client_key) = client
        .proof(PASSWORD, &salt_bytes, &b_bytes)
        .map_err(|_| anyhow::anyhow!("client rejected challenge"))?;

    let proof = ControlMessage::SrpProof {
        a: B64.encode(client.a_pub()),
        m1: B64.encode(&m1),
    };
    let ControlOutcome::Reply(ControlMessage::SrpVerify { m2, session_id, nonce }) =
        session.handle_control(proof)
    else {
        anyhow::bail!("expected verify");
    };
    assert!(client.confirm(&m1, &client_key, &B64.decode(&m2)?));
    assert!(session.conn.established());
    assert!(session.deadline.is_none());

    // The client derives the same transport key from its SRP key.
    let base = crypto::derive_traffic_key(&client_key);
    let transport = crypto::derive_transport_key(&base, &B64.decode(&nonce)?);
    Ok((session, session_id, transport))
}

#[test]
fn full_handshake_establishes_shared_transport_key() -> anyhow::Result<()> {
    let fixture = fixture()?;
    let (mut session, _sid, transport) = establish(&fixture)?;

    // A frame sealed client-side opens server-side.
    let sealed = crypto::seal(&transport, b"{\"type\":\"ping\",\"id\":\"1\",\"seq\":0}")
        .map_err(|_| anyhow::anyhow!("seal failed"))?;
    let plain = session.conn.open_inbound(&sealed).map_err(|_| anyhow::anyhow!("open failed"))?;
    assert!(plain.starts_with(b"{\"type\":\"ping\""));
    Ok(())
}

#[test]
fn wrong_password_gets_generic_invalid() -> anyhow::Result<()> {
    let fixture = fixture()?;
    let mut session = session(&fixture);
    let client = ClientHandshake::begin("default");

    let ControlOutcome::Reply(ControlMessage::SrpChallenge { salt, b }) =
        session.handle_control(ControlMessage::SrpHello {
            identity: "default".to_owned(),
            browser_profile_id: None,
            origin: None,
        })
    else {
        anyhow::bail!("expected challenge");
    };

    let (m1, _) = client
        .proof("wrong password", &B64.decode(&salt)?, &B64.decode(&b)?)
        .map_err(|_| anyhow::anyhow!("client rejected challenge"))?;
    let outcome = session.handle_control(ControlMessage::SrpProof {
        a: B64.encode(client.a_pub()),
        m1: B64.encode(&m1),
    });
    match outcome {
        ControlOutcome::ReplyThenClose {
            reply: ControlMessage::SrpInvalid {},
            code,
            ..
        } => assert_eq!(code, ErrorCode::Unauthorized),
        _ => anyhow::bail!("expected generic invalid"),
    }
    assert!(!session.conn.established());
    Ok(())
}

#[test]
fn unknown_identity_gets_generic_invalid() -> anyhow::Result<()> {
    let fixture = fixture()?;
    let mut session = session(&fixture);
    let outcome = session.handle_control(ControlMessage::SrpHello {
        identity: "nobody".to_owned(),
        browser_profile_id: None,
        origin: None,
    });
    match outcome {
        ControlOutcome::ReplyThenClose { reply: ControlMessage::SrpInvalid {}, code, .. } => {
            assert_eq!(code, ErrorCode::Unauthorized);
        }
        _ => anyhow::bail!("expected generic invalid"),
    }
    Ok(())
}

#[test]
fn hello_flood_hits_connection_rate_limit() -> anyhow::Result<()> {
    let fixture = fixture()?;
    let mut session = session(&fixture);
    let mut limited = false;
    for _ in 0..7 {
        let outcome = session.handle_control(ControlMessage::SrpHello {
            identity: "default".to_owned(),
            browser_profile_id: None,
            origin: None,
        });
        if let ControlOutcome::Close { code, .. } = outcome {
            assert_eq!(code, ErrorCode::RateLimited);
            limited = true;
            break;
        }
    }
    assert!(limited);
    Ok(())
}

#[test]
fn resume_round_trip_inherits_stored_key() -> anyhow::Result<()> {
    let fixture = fixture()?;
    let (_first, session_id, transport) = establish(&fixture)?;

    // Reconnect: a fresh connection resumes with a proof of possession.
    let mut second = session(&fixture);
    let ControlOutcome::Reply(ControlMessage::SrpResumeChallenge { nonce, .. }) = second
        .handle_control(ControlMessage::SrpResumeInit {
            session_id: session_id.clone(),
            identity: "default".to_owned(),
        })
    else {
        anyhow::bail!("expected resume challenge");
    };

    let payload = ResumeProofPayload {
        timestamp: now_ms(),
        session_id: session_id.clone(),
        challenge_nonce: nonce,
    };
    let sealed = crypto::seal(&transport, &serde_json::to_vec(&payload)?)
        .map_err(|_| anyhow::anyhow!("seal failed"))?;
    let outcome = second.handle_control(ControlMessage::SrpResume {
        session_id: session_id.clone(),
        identity: "default".to_owned(),
        proof: B64.encode(sealed),
    });
    match outcome {
        ControlOutcome::Reply(ControlMessage::SrpResumed { session_id: sid }) => {
            assert_eq!(sid, session_id);
        }
        _ => anyhow::bail!("expected resumed"),
    }
    assert!(second.conn.established());

    // The resumed connection accepts frames sealed with the stored key.
    let sealed = crypto::seal(&transport, b"{\"type\":\"ping\",\"id\":\"2\",\"seq\":0}")
        .map_err(|_| anyhow::anyhow!("seal failed"))?;
    assert!(second.conn.open_inbound(&sealed).is_ok());
    Ok(())
}

#[test]
fn resume_with_wrong_key_is_generic_invalid() -> anyhow::Result<()> {
    let fixture = fixture()?;
    let (_first, session_id, _transport) = establish(&fixture)?;

    let mut second = session(&fixture);
    let ControlOutcome::Reply(ControlMessage::SrpResumeChallenge { nonce, .. }) = second
        .handle_control(ControlMessage::SrpResumeInit {
            session_id: session_id.clone(),
            identity: "default".to_owned(),
        })
    else {
        anyhow::bail!("expected resume challenge");
    };

    let payload = ResumeProofPayload {
        timestamp: now_ms(),
        session_id: session_id.clone(),
        challenge_nonce: nonce,
    };
    let sealed = crypto::seal(&[9u8; 32], &serde_json::to_vec(&payload)?)
        .map_err(|_| anyhow::anyhow!("seal failed"))?;
    let outcome = second.handle_control(ControlMessage::SrpResume {
        session_id,
        identity: "default".to_owned(),
        proof: B64.encode(sealed),
    });
    assert!(matches!(
        outcome,
        ControlOutcome::ReplyThenClose { reply: ControlMessage::SrpInvalid {}, .. }
    ));
    assert!(!second.conn.established());
    Ok(())
}

#[test]
fn resume_challenge_gets_its_own_longer_deadline() -> anyhow::Result<()> {
    assert!(RESUME_CHALLENGE_DEADLINE > HANDSHAKE_DEADLINE);
    let fixture = fixture()?;
    let (_first, session_id, _transport) = establish(&fixture)?;

    // A fresh hello arms the short fresh-handshake window.
    let mut hello_session = session(&fixture);
    let outcome = hello_session.handle_control(ControlMessage::SrpHello {
        identity: "default".to_owned(),
        browser_profile_id: None,
        origin: None,
    });
    assert!(matches!(outcome, ControlOutcome::Reply(ControlMessage::SrpChallenge { .. })));
    let armed = hello_session.deadline.ok_or_else(|| anyhow::anyhow!("no deadline"))?;
    let remaining = armed - tokio::time::Instant::now();
    assert!(remaining <= HANDSHAKE_DEADLINE);

    // A resume challenge keeps the socket open for its full 60s validity.
    let mut resume_session = session(&fixture);
    let outcome = resume_session.handle_control(ControlMessage::SrpResumeInit {
        session_id,
        identity: "default".to_owned(),
    });
    assert!(matches!(
        outcome,
        ControlOutcome::Reply(ControlMessage::SrpResumeChallenge { .. })
    ));
    let armed = resume_session.deadline.ok_or_else(|| anyhow::anyhow!("no deadline"))?;
    let remaining = armed - tokio::time::Instant::now();
    assert!(remaining > HANDSHAKE_DEADLINE);
    assert!(remaining <= RESUME_CHALLENGE_DEADLINE);
    Ok(())
}

#[test]
fn resume_for_unknown_session_is_generic_invalid() -> anyhow::Result<()> {
    let fixture = fixture()?;
    let mut session = session(&fixture);
    let outcome = session.handle_control(ControlMessage::SrpResumeInit {
        session_id: "ghost".to_owned(),
        identity: "default".to_owned(),
    });
    assert!(matches!(
        outcome,
        ControlOutcome::ReplyThenClose { reply: ControlMessage::SrpInvalid {}, .. }
    ));
    Ok(())
}
