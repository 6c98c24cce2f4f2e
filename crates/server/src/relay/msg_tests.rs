// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::{ControlMessage, TunnelFrame, TunnelReply};

#[test]
fn control_messages_use_snake_case_tags() -> anyhow::Result<()> {
    let hello = ControlMessage::SrpHello {
        identity: "default".to_owned(),
        browser_profile_id: None,
        origin: None,
    };
    let json = serde_json::to_value(&hello)?;
    assert_eq!(json["type"], "srp_hello");

    let resumed = ControlMessage::SrpResumed { session_id: "s1".to_owned() };
    let json = serde_json::to_value(&resumed)?;
    assert_eq!(json["type"], "srp_resumed");
    assert_eq!(json["sessionId"], "s1");
    Ok(())
}

#[test]
fn all_control_tags_round_trip() -> anyhow::Result<()> {
    for raw in [
        r#"{"type":"srp_hello","identity":"default"}"#,
        r#"{"type":"srp_challenge","salt":"c2FsdA","b":"Yg"}"#,
        r#"{"type":"srp_proof","a":"YQ","m1":"bTE"}"#,
        r#"{"type":"srp_verify","m2":"bTI","sessionId":"s","nonce":"bg"}"#,
        r#"{"type":"srp_resume_init","sessionId":"s","identity":"default"}"#,
        r#"{"type":"srp_resume_challenge","sessionId":"s","nonce":"bg"}"#,
        r#"{"type":"srp_resume","sessionId":"s","identity":"default","proof":"cA"}"#,
        r#"{"type":"srp_resumed","sessionId":"s"}"#,
        r#"{"type":"srp_invalid"}"#,
        r#"{"type":"srp_error","message":"boom"}"#,
    ] {
        let parsed: ControlMessage = serde_json::from_str(raw)?;
        let back = serde_json::to_value(&parsed)?;
        let original: serde_json::Value = serde_json::from_str(raw)?;
        assert_eq!(back["type"], original["type"]);
    }
    Ok(())
}

#[test]
fn tunnel_frame_seq_accessor() -> anyhow::Result<()> {
    let frame: TunnelFrame =
        serde_json::from_str(r#"{"type":"request","id":"1","method":"GET","path":"/api/v1/projects","seq":3}"#)?;
    assert_eq!(frame.seq(), Some(3));

    let frame: TunnelFrame = serde_json::from_str(r#"{"type":"ping","id":"2"}"#)?;
    assert_eq!(frame.seq(), None);
    Ok(())
}

#[test]
fn reply_seq_is_stamped() -> anyhow::Result<()> {
    let mut reply = TunnelReply::Pong { id: "1".to_owned(), seq: None };
    reply.set_seq(9);
    let json = serde_json::to_value(&reply)?;
    assert_eq!(json["seq"], 9);
    assert_eq!(json["type"], "pong");
    Ok(())
}
