// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::record::now_ms;

/// Attachment reference carried alongside a queued message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_name: String,
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// One pending user input awaiting injection into the subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub queued_at: u64,
}

impl QueuedMessage {
    pub fn new(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            attachments,
            queued_at: now_ms(),
        }
    }
}

/// Bounded FIFO of pending inputs for one process.
///
/// A push past the cap fails fast; nothing is evicted.
#[derive(Debug)]
pub struct MessageQueue {
    items: VecDeque<QueuedMessage>,
    cap: usize,
}

impl MessageQueue {
    pub fn new(cap: usize) -> Self {
        Self { items: VecDeque::new(), cap }
    }

    /// Enqueue a message, returning its 0-based queue position.
    pub fn push(&mut self, msg: QueuedMessage) -> Result<usize, QueueFull> {
        if self.items.len() >= self.cap {
            return Err(QueueFull { cap: self.cap });
        }
        self.items.push_back(msg);
        Ok(self.items.len() - 1)
    }

    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.items.pop_front()
    }

    /// The next `n` messages without removing them.
    pub fn peek(&self, n: usize) -> Vec<&QueuedMessage> {
        self.items.iter().take(n).collect()
    }

    /// Drop everything, returning the abandoned messages.
    pub fn clear(&mut self) -> Vec<QueuedMessage> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

/// Typed fast-fail for a push past the configured cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull {
    pub cap: usize,
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
