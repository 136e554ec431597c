//! Authentication middleware for the two auth classes spec §6.1 defines:
//! `loopback` (connection must originate from 127.0.0.1/::1) and
//! `authenticated` (bearer token, constant-time compared).

use crate::http::state::AppState;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use subtle::ConstantTimeEq;
use tracing::warn;

/// Enforces bearer-token authentication (§6.1 "authenticated" routes).
/// Reads the digest cached in `AppState::api_token_hash` — `None` means no
/// token was configured, so the server runs unauthenticated (dev mode).
pub async fn require_api_token(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let expected_hash = match &state.api_token_hash {
        Some(h) => h,
        None => return next.run(req).await,
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    let provided_hash = Sha256::digest(provided.as_bytes());

    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        warn!("rejected request with invalid or missing bearer token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"kind": "Unauthorized", "message": "missing or invalid bearer token"}})),
        )
            .into_response();
    }

    next.run(req).await
}

/// Enforces the `loopback` auth class (§6.1 `/scheduler_tick`,
/// `/scheduler_metrics`): only requests whose peer address is a loopback
/// address are allowed through.
pub async fn require_loopback(ConnectInfo(addr): ConnectInfo<SocketAddr>, req: Request<Body>, next: Next) -> Response {
    if !addr.ip().is_loopback() {
        warn!(peer = %addr, "rejected non-loopback request to a loopback-only route");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": {"kind": "NotLoopback", "message": "request did not originate from a loopback address"}})),
        )
            .into_response();
    }
    next.run(req).await
}
