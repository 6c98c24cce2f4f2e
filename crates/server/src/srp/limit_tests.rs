// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::{Duration, Instant};

use super::{
    connection_gate, cooldown_for, FailureGate, IdentityLimiter, TokenBucket, COOLDOWN_BASE,
    COOLDOWN_CAP, IDENTITY_SOFT_CAP,
};

#[test]
fn bucket_exhausts_and_refills() {
    let start = Instant::now();
    let mut bucket = TokenBucket::new(6.0, 6.0);
    for _ in 0..6 {
        assert!(bucket.try_take_at(start));
    }
    assert!(!bucket.try_take_at(start));

    // One token refills after ten seconds at 6/min.
    assert!(bucket.try_take_at(start + Duration::from_secs(10)));
    assert!(!bucket.try_take_at(start + Duration::from_secs(10)));
}

#[test]
fn bucket_never_exceeds_capacity() {
    let start = Instant::now();
    let mut bucket = TokenBucket::new(6.0, 6.0);
    // A long idle period must not bank more than `capacity` tokens.
    let later = start + Duration::from_secs(3600);
    for _ in 0..6 {
        assert!(bucket.try_take_at(later));
    }
    assert!(!bucket.try_take_at(later));
}

#[test]
fn cooldown_doubles_and_caps() {
    assert_eq!(cooldown_for(1), COOLDOWN_BASE);
    assert_eq!(cooldown_for(2), COOLDOWN_BASE * 2);
    assert_eq!(cooldown_for(3), COOLDOWN_BASE * 4);
    assert_eq!(cooldown_for(7), COOLDOWN_CAP);
    assert_eq!(cooldown_for(30), COOLDOWN_CAP);
}

#[test]
fn gate_blocks_during_cooldown_and_resets_on_success() {
    let start = Instant::now();
    let mut gate = FailureGate::new(6.0, 6.0);
    assert!(gate.admit_at(start));

    gate.record_failure_at(start);
    assert!(!gate.admit_at(start + Duration::from_secs(4)));
    assert!(gate.admit_at(start + Duration::from_secs(6)));

    // Second failure: 10s cooldown.
    gate.record_failure_at(start + Duration::from_secs(6));
    assert!(!gate.admit_at(start + Duration::from_secs(14)));
    assert!(gate.admit_at(start + Duration::from_secs(17)));

    // Success resets the series back to the 5s base.
    gate.record_success();
    gate.record_failure_at(start + Duration::from_secs(17));
    assert!(gate.admit_at(start + Duration::from_secs(23)));
}

#[test]
fn connection_gate_uses_connection_limits() {
    let mut gate = connection_gate();
    for _ in 0..6 {
        assert!(gate.admit());
    }
    assert!(!gate.admit());
}

#[test]
fn identity_limiter_caps_attempts_per_identity() {
    let limiter = IdentityLimiter::new();
    for _ in 0..30 {
        assert!(limiter.admit("alice"));
    }
    assert!(!limiter.admit("alice"));
    // Other identities are unaffected.
    assert!(limiter.admit("bob"));
}

#[test]
fn identity_limiter_failure_cooldown_is_per_identity() {
    let limiter = IdentityLimiter::new();
    assert!(limiter.admit("alice"));
    limiter.record_failure("alice");
    assert!(!limiter.admit("alice"));
    assert!(limiter.admit("bob"));

    limiter.record_success("alice");
    assert!(limiter.admit("alice"));
}

#[test]
fn identity_limiter_evicts_past_soft_cap() {
    let limiter = IdentityLimiter::new();
    for i in 0..(IDENTITY_SOFT_CAP + 10) {
        limiter.admit(&format!("id-{i}"));
    }
    assert!(limiter.tracked() <= IDENTITY_SOFT_CAP);
}
