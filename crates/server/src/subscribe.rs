// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-subscriber bridge from a process to an ordered event sequence:
//! `connected`, history replay, then the live tail with heartbeats.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

use crate::process::{Process, ProcessEvent, ProcessState, ProcessSubscription};
use crate::record::{now_ms, PendingRequest, PermissionMode, SessionRecord};

/// Default keepalive period for intermediaries that idle-close streams.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Wire events delivered to one subscriber, in order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SubscriberEvent {
    #[serde(rename_all = "camelCase")]
    Connected {
        process_id: String,
        session_id: String,
        state: String,
        permission_mode: PermissionMode,
        mode_version: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        pending_request: Option<PendingRequest>,
    },
    Message {
        record: SessionRecord,
        /// True for records replayed from history at subscribe time.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        replay: bool,
    },
    Status {
        state: ProcessState,
    },
    #[serde(rename_all = "camelCase")]
    ModeChange {
        mode: PermissionMode,
        mode_version: u64,
    },
    StreamEvent {
        #[serde(skip_serializing_if = "Option::is_none")]
        uuid: Option<String>,
        data: serde_json::Value,
    },
    Error {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    SessionIdChanged {
        old: String,
        new: String,
    },
    Complete {
        state: String,
    },
    Heartbeat {
        ts: u64,
    },
}

impl SubscriberEvent {
    /// SSE `event:` name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Message { .. } => "message",
            Self::Status { .. } => "status",
            Self::ModeChange { .. } => "mode-change",
            Self::StreamEvent { .. } => "stream-event",
            Self::Error { .. } => "error",
            Self::SessionIdChanged { .. } => "session-id-changed",
            Self::Complete { .. } => "complete",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// One numbered event of the stream.
#[derive(Debug, Clone)]
pub struct NumberedEvent {
    pub id: u64,
    pub event: SubscriberEvent,
}

/// Ordered event sequence for one subscriber of one process.
///
/// The process listener is registered before the `connected` event is
/// produced, so nothing can fall between the snapshot and the tail.
pub struct SessionStream {
    subscription: ProcessSubscription,
    replay: VecDeque<SessionRecord>,
    connected: Option<SubscriberEvent>,
    heartbeat: tokio::time::Interval,
    next_id: u64,
    done: bool,
}

impl SessionStream {
    pub fn new(process: &Process) -> Self {
        Self::with_heartbeat(process, HEARTBEAT_PERIOD)
    }

    pub fn with_heartbeat(process: &Process, period: Duration) -> Self {
        let subscription = process.subscribe();
        let snapshot = &subscription.snapshot;
        let connected = SubscriberEvent::Connected {
            process_id: snapshot.process_id.clone(),
            session_id: snapshot.session_id.clone(),
            state: snapshot.state.as_str().to_owned(),
            permission_mode: snapshot.mode,
            mode_version: snapshot.mode_version,
            pending_request: snapshot.pending_request.clone(),
        };
        let replay = snapshot
            .history
            .iter()
            .filter(|r| !r.is_stream_chunk() && !r.is_bookkeeping())
            .cloned()
            .collect();
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Swallow the immediate first tick; heartbeats are periodic only.
        heartbeat.reset();
        Self { subscription, replay, connected: Some(connected), heartbeat, next_id: 0, done: false }
    }

    fn numbered(&mut self, event: SubscriberEvent) -> NumberedEvent {
        let id = self.next_id;
        self.next_id += 1;
        NumberedEvent { id, event }
    }

    /// Next event in order; `None` once the stream has completed.
    pub async fn next(&mut self) -> Option<NumberedEvent> {
        if self.done {
            return None;
        }
        if let Some(connected) = self.connected.take() {
            return Some(self.numbered(connected));
        }
        if let Some(record) = self.replay.pop_front() {
            return Some(self.numbered(SubscriberEvent::Message { record, replay: true }));
        }
        tokio::select! {
            _ = self.heartbeat.tick() => {
                Some(self.numbered(SubscriberEvent::Heartbeat { ts: now_ms() }))
            }
            event = self.subscription.rx.recv() => {
                let Some(event) = event else {
                    self.done = true;
                    return None;
                };
                let mapped = match event {
                    ProcessEvent::StateChange { state } => SubscriberEvent::Status { state },
                    ProcessEvent::ModeChange { mode, mode_version } => {
                        SubscriberEvent::ModeChange { mode, mode_version }
                    }
                    ProcessEvent::Message { record } => {
                        SubscriberEvent::Message { record, replay: false }
                    }
                    ProcessEvent::StreamEvent { event, uuid } => {
                        SubscriberEvent::StreamEvent { uuid, data: event }
                    }
                    ProcessEvent::Error { message } => SubscriberEvent::Error { message },
                    ProcessEvent::SessionIdChanged { old, new } => {
                        SubscriberEvent::SessionIdChanged { old, new }
                    }
                    ProcessEvent::Complete { state } => {
                        self.done = true;
                        SubscriberEvent::Complete { state: state.as_str().to_owned() }
                    }
                };
                Some(self.numbered(mapped))
            }
        }
    }
}

#[cfg(test)]
#[path = "subscribe_tests.rs"]
mod tests;
