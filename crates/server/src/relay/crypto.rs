// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! AEAD envelope and key derivation for the relay link.
//!
//! Binary envelope: `version(0x01) || nonce(24) || ciphertext`. The cipher
//! is XChaCha20-Poly1305 with a random nonce per message. Keys come from
//! the SRP session key via HKDF-SHA256.

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const ENVELOPE_VERSION: u8 = 0x01;
pub const NONCE_LEN: usize = 24;
pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
/// Smallest well-formed envelope: version, nonce, tag of an empty message.
pub const MIN_ENVELOPE_LEN: usize = 1 + NONCE_LEN + TAG_LEN;

const TRAFFIC_INFO: &[u8] = b"porter-relay-traffic-v1";
const TRANSPORT_INFO: &[u8] = b"porter-relay-transport-v1";

/// Sealing/opening failure. Carries no detail by design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoError;

/// Legacy JSON encrypted envelope kept for older clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyEnvelope {
    pub r#type: String,
    pub nonce: String,
    pub ciphertext: String,
}

struct OkmLen(usize);

impl ring::hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8]) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    let prk = ring::hkdf::Salt::new(ring::hkdf::HKDF_SHA256, salt).extract(ikm);
    if let Ok(okm) = prk.expand(&[info], OkmLen(KEY_LEN)) {
        let _ = okm.fill(&mut out);
    }
    out
}

/// Raw SRP session key → symmetric traffic key.
pub fn derive_traffic_key(srp_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    hkdf(srp_key, &[], TRAFFIC_INFO)
}

/// Traffic key + server-verify nonce → per-connection transport key.
pub fn derive_transport_key(base: &[u8; KEY_LEN], nonce: &[u8]) -> [u8; KEY_LEN] {
    hkdf(base, nonce, TRANSPORT_INFO)
}

fn cipher(key: &[u8; KEY_LEN]) -> Result<XChaCha20Poly1305, CryptoError> {
    XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError)
}

/// Seal a plaintext into a binary envelope with a fresh random nonce.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    let ciphertext =
        cipher(key)?.encrypt(XNonce::from_slice(&nonce), plaintext).map_err(|_| CryptoError)?;
    let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a binary envelope. Length, version, and tag are all enforced.
pub fn open(key: &[u8; KEY_LEN], envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < MIN_ENVELOPE_LEN || envelope[0] != ENVELOPE_VERSION {
        return Err(CryptoError);
    }
    let nonce = &envelope[1..1 + NONCE_LEN];
    let ciphertext = &envelope[1 + NONCE_LEN..];
    cipher(key)?.decrypt(XNonce::from_slice(nonce), ciphertext).map_err(|_| CryptoError)
}

/// Seal into the legacy `{type:"encrypted", nonce, ciphertext}` JSON form.
pub fn seal_legacy(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<LegacyEnvelope, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    let ciphertext =
        cipher(key)?.encrypt(XNonce::from_slice(&nonce), plaintext).map_err(|_| CryptoError)?;
    let b64 = base64::engine::general_purpose::STANDARD;
    Ok(LegacyEnvelope {
        r#type: "encrypted".to_owned(),
        nonce: b64.encode(nonce),
        ciphertext: b64.encode(ciphertext),
    })
}

/// Open a legacy JSON envelope.
pub fn open_legacy(key: &[u8; KEY_LEN], envelope: &LegacyEnvelope) -> Result<Vec<u8>, CryptoError> {
    if envelope.r#type != "encrypted" {
        return Err(CryptoError);
    }
    let b64 = base64::engine::general_purpose::STANDARD;
    let nonce = b64.decode(&envelope.nonce).map_err(|_| CryptoError)?;
    let ciphertext = b64.decode(&envelope.ciphertext).map_err(|_| CryptoError)?;
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError);
    }
    cipher(key)?.decrypt(XNonce::from_slice(&nonce), ciphertext.as_ref()).map_err(|_| CryptoError)
}

#[cfg(test)]
#[path = "crypto_tests.rs"]
mod tests;
