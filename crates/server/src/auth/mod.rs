// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local password auth and cookie sessions.
//!
//! The password is stored as an argon2id hash in an owner-only auth file,
//! together with the SRP salt/verifier derived for the relay identity.
//! Cookie sessions are opaque random tokens held in memory.

pub mod policy;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::record::now_ms;

/// Maximum absolute cookie-session lifetime.
pub const SESSION_MAX_LIFETIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Idle lifetime: sessions unused this long are dropped.
pub const SESSION_IDLE_LIFETIME: Duration = Duration::from_secs(8 * 24 * 60 * 60);

/// SRP credential stored next to the password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SrpCredential {
    pub identity: String,
    pub salt_b64: String,
    pub verifier_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Account {
    password_hash: String,
    created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    srp: Option<SrpCredential>,
}

#[derive(Debug, Clone)]
struct CookieSession {
    created_at_ms: u64,
    last_used_ms: u64,
}

/// Auth status surfaced by the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthReport {
    pub account_exists: bool,
    pub auth_required: bool,
    pub bypass: bool,
}

/// Password + cookie-session store backed by one owner-only file.
pub struct AuthStore {
    auth_path: PathBuf,
    profile_name: String,
    required: bool,
    bypass: bool,
    account: parking_lot::RwLock<Option<Account>>,
    sessions: parking_lot::Mutex<HashMap<String, CookieSession>>,
}

impl AuthStore {
    pub fn load(
        data_dir: &std::path::Path,
        profile_name: &str,
        auth_enabled: bool,
        auth_disabled: bool,
    ) -> anyhow::Result<Self> {
        let auth_path = data_dir.join("auth.json");
        let account = match std::fs::read(&auth_path) {
            Ok(bytes) => Some(serde_json::from_slice::<Account>(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            auth_path,
            profile_name: profile_name.to_owned(),
            required: auth_enabled,
            bypass: auth_disabled,
            account: parking_lot::RwLock::new(account),
            sessions: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn status(&self) -> AuthReport {
        AuthReport {
            account_exists: self.account.read().is_some(),
            auth_required: self.auth_required(),
            bypass: self.bypass,
        }
    }

    /// Whether direct HTTP requests must carry a valid session cookie.
    pub fn auth_required(&self) -> bool {
        self.required && !self.bypass && self.account.read().is_some()
    }

    /// SRP lookup for the relay handshake.
    pub fn srp_credential(&self, identity: &str) -> Option<SrpCredential> {
        let account = self.account.read();
        account.as_ref().and_then(|a| a.srp.clone()).filter(|c| c.identity == identity)
    }

    /// Create the account. Fails if one already exists.
    pub fn setup(&self, password: &str) -> Result<(), ErrorCode> {
        if password.len() < 8 {
            return Err(ErrorCode::InvalidRequest);
        }
        let mut account = self.account.write();
        if account.is_some() {
            return Err(ErrorCode::InvalidRequest);
        }
        let new_account = self.build_account(password)?;
        *account = Some(new_account.clone());
        drop(account);
        if let Err(e) = self.persist(&new_account) {
            tracing::error!(error = %e, "failed to persist auth file");
            return Err(ErrorCode::Internal);
        }
        Ok(())
    }

    /// Verify the password and mint a session token.
    pub fn login(&self, password: &str) -> Result<String, ErrorCode> {
        let account = self.account.read();
        let Some(ref account) = *account else {
            return Err(ErrorCode::Unauthorized);
        };
        let parsed =
            PasswordHash::new(&account.password_hash).map_err(|_| ErrorCode::Internal)?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| ErrorCode::Unauthorized)?;

        let token = random_token();
        let now = now_ms();
        self.sessions
            .lock()
            .insert(token.clone(), CookieSession { created_at_ms: now, last_used_ms: now });
        Ok(token)
    }

    pub fn logout(&self, token: &str) {
        self.sessions.lock().remove(token);
    }

    /// Change the password, invalidating every session.
    pub fn change_password(&self, old: &str, new: &str) -> Result<(), ErrorCode> {
        self.login(old).map(|token| self.logout(&token))?;
        if new.len() < 8 {
            return Err(ErrorCode::InvalidRequest);
        }
        let new_account = self.build_account(new)?;
        *self.account.write() = Some(new_account.clone());
        self.sessions.lock().clear();
        if let Err(e) = self.persist(&new_account) {
            tracing::error!(error = %e, "failed to persist auth file");
            return Err(ErrorCode::Internal);
        }
        Ok(())
    }

    /// Check a session token, enforcing both lifetimes and touching
    /// `last_used` on success.
    pub fn validate_session(&self, token: &str) -> bool {
        let now = now_ms();
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(token) else {
            return false;
        };
        let max_ms = SESSION_MAX_LIFETIME.as_millis() as u64;
        let idle_ms = SESSION_IDLE_LIFETIME.as_millis() as u64;
        if now.saturating_sub(session.created_at_ms) > max_ms
            || now.saturating_sub(session.last_used_ms) > idle_ms
        {
            sessions.remove(token);
            return false;
        }
        session.last_used_ms = now;
        true
    }

    fn build_account(&self, password: &str) -> Result<Account, ErrorCode> {
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|_| ErrorCode::Internal)?
            .to_string();
        let srp = crate::srp::generate_credential(&self.profile_name, password);
        Ok(Account { password_hash, created_at_ms: now_ms(), srp: Some(srp) })
    }

    fn persist(&self, account: &Account) -> anyhow::Result<()> {
        if let Some(parent) = self.auth_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(account)?;
        std::fs::write(&self.auth_path, json)?;
        restrict_permissions(&self.auth_path)?;
        Ok(())
    }
}

/// Owner-only permissions for secret-bearing files.
pub fn restrict_permissions(path: &std::path::Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

/// 32 random bytes, base64url — the opaque cookie token.
pub fn random_token() -> String {
    use base64::Engine;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
