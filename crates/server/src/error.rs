// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes shared across the HTTP and relay transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidRequest,
    NotFound,
    Unauthorized,
    RateLimited,
    ReplayDetected,
    QueueFull,
    ProcessTerminated,
    Timeout,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::NotFound => 404,
            Self::Unauthorized => 401,
            Self::RateLimited => 429,
            Self::ReplayDetected => 409,
            Self::QueueFull => 503,
            Self::ProcessTerminated => 409,
            Self::Timeout => 408,
            Self::Internal => 500,
        }
    }

    /// WebSocket close code used when the error terminates a relay connection.
    ///
    /// 4001 auth-required, 4004 replay/decrypt, 4005 plaintext-after-auth,
    /// 4008 rate-limited or handshake timeout.
    pub fn ws_close_code(&self) -> u16 {
        match self {
            Self::Unauthorized => 4001,
            Self::ReplayDetected => 4004,
            Self::RateLimited | Self::Timeout => 4008,
            Self::InvalidRequest => 4005,
            _ => 1011,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::RateLimited => "RATE_LIMITED",
            Self::ReplayDetected => "REPLAY_DETECTED",
            Self::QueueFull => "QUEUE_FULL",
            Self::ProcessTerminated => "PROCESS_TERMINATED",
            Self::Timeout => "TIMEOUT",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error response envelope shared across HTTP and the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body containing a machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorCode {
    /// Convert this error code into a transport [`ErrorBody`].
    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    /// Convert this error code into an axum JSON error response.
    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

/// Default human-readable message for an error code.
pub fn error_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::InvalidRequest => "malformed request",
        ErrorCode::NotFound => "not found",
        ErrorCode::Unauthorized => "not authenticated",
        ErrorCode::RateLimited => "rate limit exceeded",
        ErrorCode::ReplayDetected => "replay detected",
        ErrorCode::QueueFull => "queue is full",
        ErrorCode::ProcessTerminated => "process has terminated",
        ErrorCode::Timeout => "operation timed out",
        ErrorCode::Internal => "internal error",
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
