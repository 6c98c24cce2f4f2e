// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SSE endpoint: `GET /api/v1/sessions/{sid}/stream`.
//!
//! Running sessions stream through the subscription layer. Sessions with no
//! owning process fall back to tailing the on-disk log, so externally
//! written records still reach watchers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::Stream;
use tokio::sync::mpsc;

use crate::error::{error_message, ErrorCode};
use crate::record::now_ms;
use crate::state::Services;
use crate::store::{LogStore, LogTail};
use crate::subscribe::{SessionStream, SubscriberEvent, HEARTBEAT_PERIOD};

/// `GET /api/v1/sessions/{sid}/stream`
pub async fn stream_session(
    State(s): State<Arc<Services>>,
    Path(sid): Path<String>,
) -> Response {
    if let Some(process) = s.supervisor.get_process_for_session(&sid).await {
        let stream = live_stream(SessionStream::new(&process));
        return Sse::new(stream).into_response();
    }

    // No owning process: tail the log file if one exists on disk.
    match find_log(&s, &sid).await {
        Some(path) => Sse::new(tail_stream(s, path)).into_response(),
        None => ErrorCode::NotFound
            .to_http_response(error_message(ErrorCode::NotFound))
            .into_response(),
    }
}

async fn find_log(s: &Services, sid: &str) -> Option<std::path::PathBuf> {
    for project in s.projects.snapshot().await.iter() {
        if let Some(path) = LogStore::find_session_file(&project.all_session_dirs(), sid) {
            return Some(path);
        }
    }
    None
}

fn sse_event(id: u64, event: &SubscriberEvent) -> Option<Event> {
    Event::default().id(id.to_string()).event(event.name()).json_data(event).ok()
}

/// Subscription-layer stream for a running process.
fn live_stream(session: SessionStream) -> impl Stream<Item = Result<Event, Infallible>> {
    futures_util::stream::unfold(session, |mut session| async move {
        loop {
            let item = session.next().await?;
            if let Some(event) = sse_event(item.id, &item.event) {
                return Some((Ok(event), session));
            }
        }
    })
}

/// Tail-based stream for sessions without a live process: replay the
/// committed log, then follow appends, with heartbeats in between.
fn tail_stream(
    s: Arc<Services>,
    path: std::path::PathBuf,
) -> impl Stream<Item = Result<Event, Infallible>> {
    struct TailState {
        batch_rx: mpsc::Receiver<Vec<crate::record::SessionRecord>>,
        pending: std::collections::VecDeque<SubscriberEvent>,
        heartbeat: tokio::time::Interval,
        next_id: u64,
        _guard: tokio_util::sync::DropGuard,
    }

    let (batch_tx, batch_rx) = mpsc::channel(16);
    let shutdown = tokio_util::sync::CancellationToken::new();
    let tail = LogTail::new(path).with_poll_interval(Duration::from_secs(2));
    tokio::spawn(tail.run(s.bus.subscribe(), batch_tx, shutdown.clone()));

    let mut heartbeat = tokio::time::interval(HEARTBEAT_PERIOD);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.reset();

    let state = TailState {
        batch_rx,
        pending: std::collections::VecDeque::new(),
        heartbeat,
        next_id: 0,
        _guard: shutdown.drop_guard(),
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                let id = state.next_id;
                state.next_id += 1;
                if let Some(event) = sse_event(id, &event) {
                    return Some((Ok(event), state));
                }
                continue;
            }
            tokio::select! {
                _ = state.heartbeat.tick() => {
                    state.pending.push_back(SubscriberEvent::Heartbeat { ts: now_ms() });
                }
                batch = state.batch_rx.recv() => {
                    let batch = batch?;
                    for record in batch {
                        if record.is_bookkeeping() || record.is_stream_chunk() {
                            continue;
                        }
                        state.pending.push_back(SubscriberEvent::Message { record, replay: false });
                    }
                }
            }
        }
    })
}
