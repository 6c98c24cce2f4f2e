// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resume-session store: proof-of-possession re-establishment of a traffic
//! key on reconnect, without rerunning the SRP exchange.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::auth::restrict_permissions;
use crate::record::now_ms;

/// At most this many stored sessions per identity; oldest-by-last-used is
/// evicted past the cap.
pub const MAX_SESSIONS_PER_IDENTITY: usize = 5;
/// Absolute stored-session lifetime.
pub const SESSION_MAX_LIFETIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Idle stored-session lifetime.
pub const SESSION_IDLE_LIFETIME: Duration = Duration::from_secs(8 * 24 * 60 * 60);
/// Resume challenges are single-use and expire after this long.
pub const CHALLENGE_TTL: Duration = Duration::from_secs(60);
/// Accepted clock skew for the proof timestamp, either direction.
pub const PROOF_SKEW: Duration = Duration::from_secs(60);

/// One stored relay session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub session_id: String,
    pub identity: String,
    #[serde(with = "key_b64")]
    pub traffic_key: [u8; 32],
    pub created_at_ms: u64,
    pub last_used_ms: u64,
}

mod key_b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("bad key length"))
    }
}

/// Decrypted payload a resume proof must bind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeProofPayload {
    pub timestamp: u64,
    pub session_id: String,
    pub challenge_nonce: String,
}

struct Challenge {
    nonce: [u8; 24],
    issued_ms: u64,
}

/// In-memory (optionally persisted) store of resumable sessions.
pub struct ResumeStore {
    sessions: parking_lot::Mutex<HashMap<String, StoredSession>>,
    challenges: parking_lot::Mutex<HashMap<String, Challenge>>,
    persist_path: Option<PathBuf>,
}

impl ResumeStore {
    /// Memory-only store.
    pub fn in_memory() -> Self {
        Self {
            sessions: parking_lot::Mutex::new(HashMap::new()),
            challenges: parking_lot::Mutex::new(HashMap::new()),
            persist_path: None,
        }
    }

    /// Store persisted to an owner-only file, loading any prior state.
    pub fn persistent(path: PathBuf) -> Self {
        let sessions = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<Vec<StoredSession>>(&bytes)
                .map(|list| list.into_iter().map(|s| (s.session_id.clone(), s)).collect())
                .unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Self {
            sessions: parking_lot::Mutex::new(sessions),
            challenges: parking_lot::Mutex::new(HashMap::new()),
            persist_path: Some(path),
        }
    }

    /// Register a new resumable session, evicting per-identity overflow.
    pub fn insert(&self, session: StoredSession) {
        let mut sessions = self.sessions.lock();
        let identity = session.identity.clone();
        sessions.insert(session.session_id.clone(), session);

        let mut owned: Vec<(String, u64)> = sessions
            .values()
            .filter(|s| s.identity == identity)
            .map(|s| (s.session_id.clone(), s.last_used_ms))
            .collect();
        while owned.len() > MAX_SESSIONS_PER_IDENTITY {
            owned.sort_by_key(|(_, last_used)| *last_used);
            let Some((oldest, _)) = owned.first().cloned() else {
                break;
            };
            sessions.remove(&oldest);
            owned.retain(|(id, _)| *id != oldest);
        }
        drop(sessions);
        self.persist();
    }

    /// Issue a single-use 24-byte challenge for a known session.
    ///
    /// Unknown sessions get no challenge; the caller answers with the same
    /// generic `invalid` it uses for bad proofs.
    pub fn issue_challenge(&self, session_id: &str) -> Option<[u8; 24]> {
        if !self.session_alive(session_id) {
            return None;
        }
        let mut nonce = [0u8; 24];
        rand::rng().fill_bytes(&mut nonce);
        self.challenges
            .lock()
            .insert(session_id.to_owned(), Challenge { nonce, issued_ms: now_ms() });
        Some(nonce)
    }

    /// The stored traffic key, when the session is alive.
    pub fn stored_key(&self, session_id: &str) -> Option<[u8; 32]> {
        if !self.session_alive(session_id) {
            return None;
        }
        self.sessions.lock().get(session_id).map(|s| s.traffic_key)
    }

    /// Validate a decrypted resume proof against the outstanding challenge.
    ///
    /// Consumes the challenge either way: one proof attempt per challenge.
    pub fn validate_proof(
        &self,
        session_id: &str,
        identity: &str,
        payload: &ResumeProofPayload,
    ) -> bool {
        let Some(challenge) = self.challenges.lock().remove(session_id) else {
            return false;
        };
        let now = now_ms();
        if now.saturating_sub(challenge.issued_ms) > CHALLENGE_TTL.as_millis() as u64 {
            return false;
        }
        let skew = PROOF_SKEW.as_millis() as u64;
        if payload.timestamp.abs_diff(now) > skew {
            return false;
        }
        if payload.session_id != session_id {
            return false;
        }
        let expected_nonce =
            base64::engine::general_purpose::STANDARD.encode(challenge.nonce);
        if payload.challenge_nonce != expected_nonce {
            return false;
        }
        let matches_identity = self
            .sessions
            .lock()
            .get(session_id)
            .map(|s| s.identity == identity)
            .unwrap_or(false);
        if !matches_identity {
            return false;
        }
        self.touch(session_id);
        true
    }

    /// Refresh `last_used` on successful use.
    pub fn touch(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().get_mut(session_id) {
            session.last_used_ms = now_ms();
        }
        self.persist();
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn session_alive(&self, session_id: &str) -> bool {
        let now = now_ms();
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get(session_id) else {
            return false;
        };
        let max_ms = SESSION_MAX_LIFETIME.as_millis() as u64;
        let idle_ms = SESSION_IDLE_LIFETIME.as_millis() as u64;
        if now.saturating_sub(session.created_at_ms) > max_ms
            || now.saturating_sub(session.last_used_ms) > idle_ms
        {
            sessions.remove(session_id);
            return false;
        }
        true
    }

    fn persist(&self) {
        let Some(ref path) = self.persist_path else {
            return;
        };
        let sessions: Vec<StoredSession> = self.sessions.lock().values().cloned().collect();
        let Ok(json) = serde_json::to_vec_pretty(&sessions) else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if std::fs::write(path, json).is_ok() {
            let _ = restrict_permissions(path);
        }
    }
}

#[cfg(test)]
#[path = "resume_tests.rs"]
mod tests;
