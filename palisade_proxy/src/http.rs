//! HTTP surface: routing, destination dispatch, and request context.

use crate::relay;
use crate::state::SharedState;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use palisade_core::DestinationKind;
use serde::Deserialize;
use serde_json::json;
use std::{net::SocketAddr, time::Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// MCP Session-Id header name (per MCP spec 2025-03-26).
pub(crate) const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Per-request context threaded into bridge and relay operations so every
/// audit record carries the same correlation fields.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    /// Bearer-token prefix for log correlation, or `anonymous`.
    pub user: String,
    pub source_ip: String,
    pub start: Instant,
}

impl RequestCtx {
    pub fn new(headers: &HeaderMap, addr: SocketAddr) -> Self {
        Self {
            user: user_from_headers(headers),
            source_ip: addr.ip().to_string(),
            start: Instant::now(),
        }
    }

    pub fn latency_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

/// First 8 chars of a Bearer token, or `anonymous`. The proxy never gates on
/// auth; the prefix exists purely for log correlation.
pub(crate) fn user_from_headers(headers: &HeaderMap) -> String {
    let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) else {
        return "anonymous".to_string();
    };
    let Some(token) = strip_prefix_ignore_case(auth, "bearer ") else {
        return "anonymous".to_string();
    };
    let token = token.trim();
    if token.is_empty() {
        "anonymous".to_string()
    } else {
        token.chars().take(8).collect()
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    if value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&value[prefix.len()..])
    } else {
        None
    }
}

/// JSON error body in the shape every endpoint uses: `{"error": "..."}`.
pub(crate) fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    let message: String = message.into();
    (status, Json(json!({"error": message}))).into_response()
}

pub(crate) fn session_header<'a>(headers: &'a HeaderMap) -> Option<&'a str> {
    headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
}

/// Build the proxy router. The caller serves it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so handlers can see
/// the peer address.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admin/reload-patterns", post(reload_patterns))
        .route("/{destination}/sse", get(sse_endpoint))
        .route("/{destination}/message", post(message_endpoint))
        .route(
            "/{destination}/mcp",
            post(mcp_post).get(mcp_get).delete(mcp_delete),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Reload regex patterns from the patterns directory. Localhost only.
async fn reload_patterns(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !addr.ip().is_loopback() {
        return json_error(
            StatusCode::FORBIDDEN,
            "Admin endpoints are restricted to localhost",
        );
    }
    let loaded = state.detector.pattern_store().reload();
    Json(json!({"loaded": loaded})).into_response()
}

async fn sse_endpoint(
    Path(destination): Path<String>,
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(dest) = state.destinations.get(&destination) else {
        return json_error(
            StatusCode::NOT_FOUND,
            format!("Unknown destination: {destination}"),
        );
    };
    let ctx = RequestCtx::new(&headers, addr);

    match dest.kind {
        DestinationKind::Stdio if dest.legacy_sse => {
            let env = state.subprocess_env(&dest);
            state.sse_sessions.handle_sse(&dest, env, ctx).await
        }
        DestinationKind::Stdio => json_error(
            StatusCode::GONE,
            format!("Legacy SSE transport is gone for '{destination}'; use /{destination}/mcp"),
        ),
        _ => relay::handle_sse(&state, &dest, &headers, ctx).await,
    }
}

#[derive(Deserialize)]
struct MessageQuery {
    session_id: Option<String>,
}

async fn message_endpoint(
    Path(destination): Path<String>,
    Query(query): Query<MessageQuery>,
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(dest) = state.destinations.get(&destination) else {
        return json_error(
            StatusCode::NOT_FOUND,
            format!("Unknown destination: {destination}"),
        );
    };
    let Some(session_id) = query.session_id.filter(|s| !s.is_empty()) else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "Missing session_id query parameter",
        );
    };
    let ctx = RequestCtx::new(&headers, addr);

    match dest.kind {
        DestinationKind::Stdio if dest.legacy_sse => {
            state
                .sse_sessions
                .handle_message(&dest, &session_id, &body, &ctx)
                .await
        }
        DestinationKind::Stdio => json_error(
            StatusCode::GONE,
            format!("Legacy SSE transport is gone for '{destination}'; use /{destination}/mcp"),
        ),
        _ => relay::handle_message(&state, &dest, &session_id, &headers, body, &ctx).await,
    }
}

async fn mcp_post(
    Path(destination): Path<String>,
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(dest) = state.destinations.get(&destination) else {
        return json_error(
            StatusCode::NOT_FOUND,
            format!("Unknown destination: {destination}"),
        );
    };
    let ctx = RequestCtx::new(&headers, addr);

    match dest.kind {
        DestinationKind::Stdio => {
            let env = state.subprocess_env(&dest);
            state
                .bridges
                .post(&dest, env, session_header(&headers), &body, &ctx)
                .await
        }
        DestinationKind::StreamableHttp => {
            relay::handle_streamable_post(&state, &dest, &headers, body, &ctx).await
        }
        DestinationKind::Sse => json_error(
            StatusCode::BAD_REQUEST,
            format!("Destination '{destination}' does not use the streamable HTTP transport"),
        ),
    }
}

async fn mcp_get(
    Path(destination): Path<String>,
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(dest) = state.destinations.get(&destination) else {
        return json_error(
            StatusCode::NOT_FOUND,
            format!("Unknown destination: {destination}"),
        );
    };
    let ctx = RequestCtx::new(&headers, addr);

    match dest.kind {
        DestinationKind::Stdio => {
            state
                .bridges
                .get(&dest, session_header(&headers), ctx)
                .await
        }
        DestinationKind::StreamableHttp => {
            relay::handle_streamable_get(&state, &dest, &headers, ctx).await
        }
        DestinationKind::Sse => json_error(
            StatusCode::BAD_REQUEST,
            format!("Destination '{destination}' does not use the streamable HTTP transport"),
        ),
    }
}

async fn mcp_delete(
    Path(destination): Path<String>,
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(dest) = state.destinations.get(&destination) else {
        return json_error(
            StatusCode::NOT_FOUND,
            format!("Unknown destination: {destination}"),
        );
    };
    let ctx = RequestCtx::new(&headers, addr);

    match dest.kind {
        DestinationKind::Stdio => {
            state
                .bridges
                .delete(&dest, session_header(&headers), &ctx)
                .await
        }
        DestinationKind::StreamableHttp => {
            relay::handle_streamable_delete(&state, &dest, &headers, &ctx).await
        }
        DestinationKind::Sse => json_error(
            StatusCode::BAD_REQUEST,
            format!("Destination '{destination}' does not use the streamable HTTP transport"),
        ),
    }
}
