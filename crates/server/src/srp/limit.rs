// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Handshake rate limits: token buckets plus exponential failure cooldowns.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-connection bucket: 6 attempts, refilled 6/min.
pub const CONN_CAPACITY: f64 = 6.0;
pub const CONN_REFILL_PER_MIN: f64 = 6.0;
/// Per-identity bucket: 30 attempts, refilled 30/min.
pub const IDENTITY_CAPACITY: f64 = 30.0;
pub const IDENTITY_REFILL_PER_MIN: f64 = 30.0;
/// Idle identities are dropped after this long.
pub const IDENTITY_TTL: Duration = Duration::from_secs(30 * 60);
/// Soft cap on tracked identities; oldest-by-last-seen evicted past it.
pub const IDENTITY_SOFT_CAP: usize = 1024;

/// Failure cooldown: base 5s, doubling per failure, capped at 5min.
pub const COOLDOWN_BASE: Duration = Duration::from_secs(5);
pub const COOLDOWN_CAP: Duration = Duration::from_secs(5 * 60);

/// Classic token bucket with fractional refill.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_min: f64) -> Self {
        Self { capacity, tokens: capacity, refill_per_sec: refill_per_min / 60.0, last: Instant::now() }
    }

    pub fn try_take(&mut self) -> bool {
        self.try_take_at(Instant::now())
    }

    fn try_take_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

fn cooldown_for(failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(10);
    COOLDOWN_CAP.min(COOLDOWN_BASE * factor)
}

/// Failure gate shared by the per-connection and per-identity paths.
#[derive(Debug, Clone)]
pub struct FailureGate {
    bucket: TokenBucket,
    failures: u32,
    cooldown_until: Option<Instant>,
}

impl FailureGate {
    pub fn new(capacity: f64, refill_per_min: f64) -> Self {
        Self { bucket: TokenBucket::new(capacity, refill_per_min), failures: 0, cooldown_until: None }
    }

    /// Admit one attempt: refused while cooling down or out of tokens.
    pub fn admit(&mut self) -> bool {
        self.admit_at(Instant::now())
    }

    fn admit_at(&mut self, now: Instant) -> bool {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return false;
            }
            self.cooldown_until = None;
        }
        self.bucket.try_take_at(now)
    }

    /// A failed proof: double the cooldown.
    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&mut self, now: Instant) {
        self.failures += 1;
        self.cooldown_until = Some(now + cooldown_for(self.failures));
    }

    /// A successful proof resets the failure series.
    pub fn record_success(&mut self) {
        self.failures = 0;
        self.cooldown_until = None;
    }
}

/// Per-connection gate with the connection-scoped limits.
pub fn connection_gate() -> FailureGate {
    FailureGate::new(CONN_CAPACITY, CONN_REFILL_PER_MIN)
}

struct IdentityEntry {
    gate: FailureGate,
    last_seen: Instant,
}

/// Mutex-guarded map of per-identity gates with TTL GC and a soft cap.
pub struct IdentityLimiter {
    entries: parking_lot::Mutex<HashMap<String, IdentityEntry>>,
}

impl IdentityLimiter {
    pub fn new() -> Self {
        Self { entries: parking_lot::Mutex::new(HashMap::new()) }
    }

    pub fn admit(&self, identity: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::gc_locked(&mut entries, now);
        let entry = entries.entry(identity.to_owned()).or_insert_with(|| IdentityEntry {
            gate: FailureGate::new(IDENTITY_CAPACITY, IDENTITY_REFILL_PER_MIN),
            last_seen: now,
        });
        entry.last_seen = now;
        entry.gate.admit_at(now)
    }

    pub fn record_failure(&self, identity: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(identity) {
            entry.gate.record_failure_at(Instant::now());
        }
    }

    pub fn record_success(&self, identity: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(identity) {
            entry.gate.record_success();
        }
    }

    pub fn tracked(&self) -> usize {
        self.entries.lock().len()
    }

    fn gc_locked(entries: &mut HashMap<String, IdentityEntry>, now: Instant) {
        entries.retain(|_, e| now.saturating_duration_since(e.last_seen) < IDENTITY_TTL);
        while entries.len() >= IDENTITY_SOFT_CAP {
            let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            entries.remove(&oldest);
        }
    }
}

impl Default for IdentityLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "limit_tests.rs"]
mod tests;
