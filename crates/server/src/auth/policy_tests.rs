// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::{classify, ConnectionPolicy, PolicyInput};

#[test]
fn relay_always_requires_srp() {
    for remote in [false, true] {
        for cookie in [false, true] {
            let policy = classify(PolicyInput {
                via_relay: true,
                remote_access_enabled: remote,
                has_valid_cookie: cookie,
            });
            assert_eq!(policy, ConnectionPolicy::SrpRequired);
        }
    }
}

#[test]
fn direct_without_remote_access_is_unrestricted() {
    let policy = classify(PolicyInput {
        via_relay: false,
        remote_access_enabled: false,
        has_valid_cookie: false,
    });
    assert_eq!(policy, ConnectionPolicy::LocalUnrestricted);
    assert!(!policy.requires_srp());
}

#[test]
fn direct_with_cookie_is_trusted() {
    let policy = classify(PolicyInput {
        via_relay: false,
        remote_access_enabled: true,
        has_valid_cookie: true,
    });
    assert_eq!(policy, ConnectionPolicy::LocalCookieTrusted);
}

#[test]
fn direct_without_cookie_requires_srp() {
    let policy = classify(PolicyInput {
        via_relay: false,
        remote_access_enabled: true,
        has_valid_cookie: false,
    });
    assert!(policy.requires_srp());
    assert_eq!(policy.as_str(), "srp_required");
}
