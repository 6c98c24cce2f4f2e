// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::Serialize;

/// Trust classification for one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPolicy {
    /// Direct connection, remote access disabled: everything is allowed.
    LocalUnrestricted,
    /// Direct connection holding a valid session cookie (or desktop token).
    LocalCookieTrusted,
    /// Relay connections, and direct ones without a cookie while remote
    /// access is enabled: SRP must complete before any application frame.
    SrpRequired,
}

impl ConnectionPolicy {
    pub fn requires_srp(&self) -> bool {
        matches!(self, Self::SrpRequired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalUnrestricted => "local_unrestricted",
            Self::LocalCookieTrusted => "local_cookie_trusted",
            Self::SrpRequired => "srp_required",
        }
    }
}

/// Inputs to the classifier, gathered at upgrade time.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput {
    /// The connection arrived through the off-host relay.
    pub via_relay: bool,
    /// Remote access (and therefore local auth) is enabled.
    pub remote_access_enabled: bool,
    /// A valid session cookie or desktop token accompanied the upgrade.
    pub has_valid_cookie: bool,
}

/// Derive the connection policy.
pub fn classify(input: PolicyInput) -> ConnectionPolicy {
    if input.via_relay {
        return ConnectionPolicy::SrpRequired;
    }
    if !input.remote_access_enabled {
        return ConnectionPolicy::LocalUnrestricted;
    }
    if input.has_valid_cookie {
        return ConnectionPolicy::LocalCookieTrusted;
    }
    ConnectionPolicy::SrpRequired
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
