// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SRP-6a over the 2048-bit MODP group with SHA-256.
//!
//! This module holds the exchange math: verifier generation, the server's
//! challenge/proof steps, and the client side used by tests and embedded
//! clients. Message framing, rate limits, and resume live with the relay.

pub mod limit;
pub mod resume;

use base64::Engine;
use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::auth::SrpCredential;

/// The 2048-bit MODP safe prime (RFC 3526 group 14), generator 2.
const N_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

const G: u32 = 2;
const N_BYTES: usize = 256;
const SALT_LEN: usize = 16;

fn group_n() -> BigUint {
    // The constant is compile-time vetted; a parse failure is unreachable.
    BigUint::parse_bytes(N_HEX.as_bytes(), 16).unwrap_or_default()
}

fn group_g() -> BigUint {
    BigUint::from(G)
}

/// Left-pad big-endian bytes to the group length, per SRP-6a.
fn pad(bytes: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; N_BYTES.saturating_sub(bytes.len())];
    out.extend_from_slice(bytes);
    out
}

fn hash(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

/// k = H(N | PAD(g))
fn multiplier_k(n: &BigUint, g: &BigUint) -> BigUint {
    BigUint::from_bytes_be(&hash(&[&n.to_bytes_be(), &pad(&g.to_bytes_be())]))
}

/// x = H(salt | H(identity ":" password))
fn private_x(identity: &str, password: &str, salt: &[u8]) -> BigUint {
    let inner = hash(&[identity.as_bytes(), b":", password.as_bytes()]);
    BigUint::from_bytes_be(&hash(&[salt, &inner]))
}

/// v = g^x mod N
pub fn compute_verifier(identity: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    let n = group_n();
    let x = private_x(identity, password, salt);
    group_g().modpow(&x, &n).to_bytes_be()
}

/// Fresh salt + verifier for an identity, base64-encoded for storage.
pub fn generate_credential(identity: &str, password: &str) -> SrpCredential {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    let verifier = compute_verifier(identity, password, &salt);
    let b64 = base64::engine::general_purpose::STANDARD;
    SrpCredential {
        identity: identity.to_owned(),
        salt_b64: b64.encode(salt),
        verifier_b64: b64.encode(verifier),
    }
}

/// Server half of one exchange, between `server_challenge` and `client_proof`.
pub struct ServerHandshake {
    identity: String,
    salt: Vec<u8>,
    verifier: BigUint,
    b_priv: BigUint,
    b_pub: BigUint,
}

/// Proof failure: the wire only ever sees a generic rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadProof;

impl ServerHandshake {
    /// Compute B = k·v + g^b for the stored credential.
    pub fn begin(identity: &str, salt: &[u8], verifier: &[u8]) -> Self {
        let n = group_n();
        let g = group_g();
        let v = BigUint::from_bytes_be(verifier);
        let k = multiplier_k(&n, &g);

        let mut b_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut b_bytes);
        let b_priv = BigUint::from_bytes_be(&b_bytes);
        let b_pub = (&k * &v + g.modpow(&b_priv, &n)) % &n;

        Self {
            identity: identity.to_owned(),
            salt: salt.to_vec(),
            verifier: v,
            b_priv,
            b_pub,
        }
    }

    pub fn b_pub(&self) -> Vec<u8> {
        self.b_pub.to_bytes_be()
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Verify the client's M1 and derive the shared key.
    ///
    /// Returns `(session_key, m2)` on success.
    pub fn verify(self, a_pub: &[u8], m1: &[u8]) -> Result<([u8; 32], Vec<u8>), BadProof> {
        let n = group_n();
        let a = BigUint::from_bytes_be(a_pub);
        // Reject A ≡ 0 (mod N): it would force S = 0.
        if (&a % &n) == BigUint::from(0u32) {
            return Err(BadProof);
        }

        let u = BigUint::from_bytes_be(&hash(&[&pad(a_pub), &pad(&self.b_pub.to_bytes_be())]));
        if u == BigUint::from(0u32) {
            return Err(BadProof);
        }

        // S = (A · v^u)^b mod N
        let s = (&a * self.verifier.modpow(&u, &n)).modpow(&self.b_priv, &n);
        let key_bytes = hash(&[&pad(&s.to_bytes_be())]);

        let expected_m1 = proof_m1(
            &self.identity,
            &self.salt,
            a_pub,
            &self.b_pub.to_bytes_be(),
            &key_bytes,
        );
        if ring::constant_time::verify_slices_are_equal(m1, &expected_m1).is_err() {
            return Err(BadProof);
        }

        let m2 = hash(&[a_pub, m1, &key_bytes]);
        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);
        Ok((key, m2))
    }
}

/// M1 = H(H(N) ⊕ H(g) | H(I) | s | A | B | K)
fn proof_m1(identity: &str, salt: &[u8], a_pub: &[u8], b_pub: &[u8], key: &[u8]) -> Vec<u8> {
    let n = group_n();
    let hn = hash(&[&n.to_bytes_be()]);
    let hg = hash(&[&group_g().to_bytes_be()]);
    let hxor: Vec<u8> = hn.iter().zip(hg.iter()).map(|(x, y)| x ^ y).collect();
    let hi = hash(&[identity.as_bytes()]);
    hash(&[&hxor, &hi, salt, a_pub, b_pub, key])
}

/// Client side of the exchange. Embedded clients and tests drive this
/// against [`ServerHandshake`].
pub struct ClientHandshake {
    identity: String,
    a_priv: BigUint,
    a_pub: BigUint,
}

impl ClientHandshake {
    pub fn begin(identity: &str) -> Self {
        let n = group_n();
        let mut a_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut a_bytes);
        let a_priv = BigUint::from_bytes_be(&a_bytes);
        let a_pub = group_g().modpow(&a_priv, &n);
        Self { identity: identity.to_owned(), a_priv, a_pub }
    }

    pub fn a_pub(&self) -> Vec<u8> {
        self.a_pub.to_bytes_be()
    }

    /// Compute `(M1, key)` from the server's salt and B.
    pub fn proof(
        &self,
        password: &str,
        salt: &[u8],
        b_pub_bytes: &[u8],
    ) -> Result<(Vec<u8>, [u8; 32]), BadProof> {
        let n = group_n();
        let g = group_g();
        let b_pub = BigUint::from_bytes_be(b_pub_bytes);
        if (&b_pub % &n) == BigUint::from(0u32) {
            return Err(BadProof);
        }

        let u = BigUint::from_bytes_be(&hash(&[&pad(&self.a_pub.to_bytes_be()), &pad(b_pub_bytes)]));
        let x = private_x(&self.identity, password, salt);
        let k = multiplier_k(&n, &g);

        // S = (B - k·g^x)^(a + u·x) mod N
        let gx = g.modpow(&x, &n);
        let kgx = (&k * &gx) % &n;
        let base = ((&b_pub + &n) - kgx) % &n;
        let exp = &self.a_priv + &u * &x;
        let s = base.modpow(&exp, &n);
        let key_bytes = hash(&[&pad(&s.to_bytes_be())]);

        let m1 = proof_m1(&self.identity, salt, &self.a_pub.to_bytes_be(), b_pub_bytes, &key_bytes);
        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);
        Ok((m1, key))
    }

    /// Check the server's M2 against the derived key.
    pub fn confirm(&self, m1: &[u8], key: &[u8; 32], m2: &[u8]) -> bool {
        let expected = hash(&[&self.a_pub.to_bytes_be(), m1, key]);
        ring::constant_time::verify_slices_are_equal(m2, &expected).is_ok()
    }
}

#[cfg(test)]
#[path = "srp_tests.rs"]
mod tests;
