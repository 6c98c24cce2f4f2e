// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP boundary: the router, host-allowlist and cookie-auth middleware.
//! Handlers are thin; each maps onto one supervisor/store/index operation.

pub mod http;
pub mod sse;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ErrorCode;
use crate::state::Services;

/// Session cookie name.
pub const COOKIE_NAME: &str = "porter_session";
/// Desktop-shell trust header, compared against `--desktop-auth-token`.
pub const DESKTOP_TOKEN_HEADER: &str = "x-porter-desktop-token";
/// In-process dispatch marker carrying the per-boot internal token.
pub const INTERNAL_TOKEN_HEADER: &str = "x-porter-internal";

/// Build the full router with all HTTP and WebSocket routes.
pub fn build_router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/api/v1/health", get(http::health))
        .route("/api/v1/projects", get(http::list_projects))
        .route("/api/v1/projects/{id}/sessions", get(http::list_sessions))
        .route("/api/v1/projects/{id}/sessions/{sid}", get(http::get_session))
        .route("/api/v1/sessions/recent", get(http::recent_sessions))
        .route("/api/v1/sessions/create", post(http::create_session))
        .route("/api/v1/sessions/{sid}/send", post(http::send_message))
        .route("/api/v1/sessions/{sid}/resume", post(http::resume_session))
        .route("/api/v1/sessions/{sid}/mode", post(http::set_mode))
        .route("/api/v1/sessions/{sid}/respond", post(http::respond))
        .route("/api/v1/sessions/{sid}/stream", get(sse::stream_session))
        .route("/api/v1/sessions/{sid}", axum::routing::delete(http::abort_session))
        .route(
            "/api/v1/sessions/queue/{queue_id}",
            get(http::queue_status).delete(http::cancel_queued),
        )
        .route("/api/v1/auth/status", get(http::auth_status))
        .route("/api/v1/auth/setup", post(http::auth_setup))
        .route("/api/v1/auth/login", post(http::auth_login))
        .route("/api/v1/auth/logout", post(http::auth_logout))
        .route("/api/v1/auth/password", post(http::auth_change_password))
        .route("/api/v1/providers", get(http::list_providers))
        .route("/api/v1/settings", get(http::settings))
        .route("/api/v1/debug/processes", get(http::debug_processes))
        .route("/relay", get(crate::relay::relay_handler))
        .layer(middleware::from_fn_with_state(Arc::clone(&services), cookie_auth_layer))
        .layer(middleware::from_fn_with_state(Arc::clone(&services), host_allowlist_layer))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(services)
}

/// Extract the session cookie value from request headers.
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get("cookie")?.to_str().ok()?;
    for pair in cookies.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix(COOKIE_NAME) {
            if let Some(token) = value.strip_prefix('=') {
                return Some(token.to_owned());
            }
        }
    }
    None
}

/// True when the request carries cookie-equivalent trust.
pub fn has_local_trust(services: &Services, headers: &HeaderMap) -> bool {
    if let Some(token) = session_cookie(headers) {
        if services.auth.validate_session(&token) {
            return true;
        }
    }
    if let (Some(expected), Some(got)) = (
        services.config.desktop_auth_token.as_deref(),
        headers.get(DESKTOP_TOKEN_HEADER).and_then(|v| v.to_str().ok()),
    ) {
        return constant_time_eq(expected, got);
    }
    false
}

/// Constant-time string comparison to prevent timing side-channel attacks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    ring::constant_time::verify_slices_are_equal(a.as_bytes(), b.as_bytes()).is_ok()
}

/// Host-header allowlist, enabled by `--allowed-hosts`.
async fn host_allowlist_layer(
    State(services): State<Arc<Services>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(allowed) = services.config.allowed_host_list() else {
        return next.run(req).await;
    };
    if allowed.iter().any(|h| h == "*") {
        return next.run(req).await;
    }
    let host = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();
    if allowed.contains(&host) {
        return next.run(req).await;
    }
    (StatusCode::FORBIDDEN, "host not allowed").into_response()
}

/// Cookie auth for direct HTTP requests when local auth is enabled.
///
/// Health, the auth endpoints themselves, and the relay upgrade (which runs
/// its own policy) are exempt.
async fn cookie_auth_layer(
    State(services): State<Arc<Services>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    let exempt =
        path == "/api/v1/health" || path.starts_with("/api/v1/auth/") || path == "/relay";
    if exempt || !services.auth.auth_required() {
        return next.run(req).await;
    }

    // Tunneled requests were already admitted by the relay's own policy.
    if let Some(token) = req.headers().get(INTERNAL_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        if constant_time_eq(token, &services.internal_token) {
            return next.run(req).await;
        }
    }

    if has_local_trust(&services, req.headers()) {
        return next.run(req).await;
    }
    ErrorCode::Unauthorized.to_http_response("session cookie required").into_response()
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
