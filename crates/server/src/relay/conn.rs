// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::auth::policy::ConnectionPolicy;
use crate::error::ErrorCode;
use crate::relay::crypto::{self, CryptoError, KEY_LEN};

/// Handshake progress of one relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    SrpWaitingProof,
    Authenticated,
}

/// Per-connection transport state: keys, sequence counters, policy.
///
/// Invariant: SRP transport is established iff `auth_state` is
/// `Authenticated` and `session_key` is set.
pub struct RelayConnection {
    pub auth_state: AuthState,
    session_key: Option<[u8; KEY_LEN]>,
    base_session_key: Option<[u8; KEY_LEN]>,
    last_inbound_seq: Option<u64>,
    next_outbound_seq: u64,
    pub policy: ConnectionPolicy,
    pub requires_encrypted: bool,
    pub using_legacy_traffic_key: bool,
}

impl RelayConnection {
    pub fn new(policy: ConnectionPolicy) -> Self {
        Self {
            auth_state: AuthState::Unauthenticated,
            session_key: None,
            base_session_key: None,
            last_inbound_seq: None,
            next_outbound_seq: 0,
            policy,
            requires_encrypted: false,
            using_legacy_traffic_key: false,
        }
    }

    pub fn established(&self) -> bool {
        self.auth_state == AuthState::Authenticated && self.session_key.is_some()
    }

    /// Install the derived keys after a successful proof or resume.
    pub fn establish(&mut self, base: [u8; KEY_LEN], transport: [u8; KEY_LEN]) {
        self.auth_state = AuthState::Authenticated;
        self.base_session_key = Some(base);
        self.session_key = Some(transport);
        self.requires_encrypted = true;
    }

    /// Enforce the inbound sequence discipline.
    ///
    /// The first sequenced message must carry 0; every later one must be
    /// strictly greater than the last. Unsequenced messages are accepted
    /// only until the first sequenced one arrives.
    pub fn check_inbound_seq(&mut self, seq: Option<u64>) -> Result<(), ErrorCode> {
        match (seq, self.last_inbound_seq) {
            (Some(0), None) => {
                self.last_inbound_seq = Some(0);
                Ok(())
            }
            (Some(_), None) => Err(ErrorCode::ReplayDetected),
            (Some(seq), Some(last)) if seq > last => {
                self.last_inbound_seq = Some(seq);
                Ok(())
            }
            (Some(_), Some(_)) => Err(ErrorCode::ReplayDetected),
            (None, None) => Ok(()),
            (None, Some(_)) => Err(ErrorCode::ReplayDetected),
        }
    }

    /// Allocate the next outbound sequence number.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_outbound_seq;
        self.next_outbound_seq += 1;
        seq
    }

    /// Decrypt an inbound binary envelope with the transport key, falling
    /// back once to the base session key for legacy clients.
    ///
    /// A successful fallback rebinds the connection to the base key and
    /// resets both sequence counters.
    pub fn open_inbound(&mut self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.session_key.ok_or(CryptoError)?;
        match crypto::open(&key, envelope) {
            Ok(plain) => Ok(plain),
            Err(CryptoError) => self.open_with_base_key(envelope),
        }
    }

    fn open_with_base_key(&mut self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.using_legacy_traffic_key {
            return Err(CryptoError);
        }
        let base = self.base_session_key.ok_or(CryptoError)?;
        let plain = crypto::open(&base, envelope)?;
        tracing::warn!("relay client fell back to the legacy traffic key");
        self.session_key = Some(base);
        self.using_legacy_traffic_key = true;
        self.last_inbound_seq = None;
        self.next_outbound_seq = 0;
        Ok(plain)
    }

    /// Seal an outbound payload with the current transport key.
    pub fn seal_outbound(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self.session_key.ok_or(CryptoError)?;
        crypto::seal(&key, plaintext)
    }

    #[cfg(test)]
    pub fn session_key(&self) -> Option<[u8; KEY_LEN]> {
        self.session_key
    }
}

#[cfg(test)]
#[path = "conn_tests.rs"]
mod tests;
