// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Relay wire messages.
//!
//! SRP control messages travel as plaintext JSON text frames and are never
//! encrypted. Tunnel frames are the decrypted payloads of the binary
//! envelope (or, for trusted local connections, plaintext text frames).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Plaintext handshake control frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    SrpHello {
        identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        browser_profile_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<String>,
    },
    SrpChallenge {
        salt: String,
        b: String,
    },
    SrpProof {
        a: String,
        m1: String,
    },
    #[serde(rename_all = "camelCase")]
    SrpVerify {
        m2: String,
        session_id: String,
        nonce: String,
    },
    #[serde(rename_all = "camelCase")]
    SrpResumeInit {
        session_id: String,
        identity: String,
    },
    #[serde(rename_all = "camelCase")]
    SrpResumeChallenge {
        session_id: String,
        nonce: String,
    },
    #[serde(rename_all = "camelCase")]
    SrpResume {
        session_id: String,
        identity: String,
        /// Base64 binary envelope sealing the proof payload with the
        /// stored session's traffic key.
        proof: String,
    },
    #[serde(rename_all = "camelCase")]
    SrpResumed {
        session_id: String,
    },
    SrpInvalid {},
    SrpError {
        message: String,
    },
}

/// Inbound tunneled frames (decrypted, or plaintext when trusted).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelFrame {
    Request {
        id: String,
        method: String,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    StreamRequest {
        id: String,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    Ping {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl TunnelFrame {
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Request { seq, .. } | Self::StreamRequest { seq, .. } | Self::Ping { seq, .. } => {
                *seq
            }
        }
    }
}

/// Outbound tunneled frames. `seq` is stamped at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelReply {
    Response {
        id: String,
        status: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    StreamEvent {
        id: String,
        event: String,
        data: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    StreamEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
    Pong {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl TunnelReply {
    pub fn set_seq(&mut self, value: u64) {
        match self {
            Self::Response { seq, .. }
            | Self::StreamEvent { seq, .. }
            | Self::StreamEnd { seq, .. }
            | Self::Pong { seq, .. } => *seq = Some(value),
        }
    }
}

#[cfg(test)]
#[path = "msg_tests.rs"]
mod tests;
