//! HTTP-upstream relays.
//!
//! `sse`-kind destinations use the legacy endpoint pair: the proxy opens the
//! upstream SSE stream, rewrites the first `event: endpoint` frame so the
//! client POSTs messages back through the proxy, and forwards everything else
//! untouched. `streamable_http`-kind destinations are a thin relay onto a
//! single upstream endpoint keyed by the `Mcp-Session-Id` header.
//!
//! All upstream POST/DELETE calls go through a retry wrapper: up to three
//! attempts on connect/timeout errors or 5xx responses with
//! `[0.5s, 1.0s, 2.0s]` backoff; 4xx responses are returned without retry.

use crate::bridge::RETRY_DELAYS;
use crate::error::RelayError;
use crate::http::{RequestCtx, json_error};
use crate::state::SharedState;
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use futures::StreamExt;
use palisade_core::audit::DetectionFields;
use palisade_core::detector::DetectionAction;
use palisade_core::{AuditLogger, DestinationConfig, RequestRecord};
use regex::Regex;
use serde_json::{Value, json};
use std::{
    convert::Infallible,
    sync::{Arc, LazyLock},
    time::Instant,
};
use tracing::warn;

static SESSION_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?&]sessionId=([^&\s]+)").expect("static regex"));

/// Headers never forwarded from client to upstream.
const CLIENT_HEADER_SKIP: [&str; 3] = ["host", "content-length", "transfer-encoding"];

/// Hop-by-hop headers stripped from upstream responses.
const HOP_HEADERS: [&str; 3] = ["transfer-encoding", "connection", "keep-alive"];

/// session_id → full upstream message URL, established by parsing the first
/// `event: endpoint` frame of each relayed SSE stream.
pub struct RelaySessionMap {
    sessions: DashMap<String, String>,
}

impl RelaySessionMap {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn register(&self, session_id: impl Into<String>, upstream_url: impl Into<String>) {
        self.sessions.insert(session_id.into(), upstream_url.into());
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn url_for(&self, session_id: &str) -> Option<String> {
        self.sessions.get(session_id).map(|url| url.clone())
    }
}

impl Default for RelaySessionMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward-able copy of the client headers.
fn upstream_headers(client_headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in client_headers {
        if CLIENT_HEADER_SKIP.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

/// Copy upstream response headers onto a proxy response, minus hop-by-hop.
fn copy_response_headers(upstream: &reqwest::header::HeaderMap, response: &mut Response) {
    for (name, value) in upstream {
        if HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
}

fn proxy_status(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Send with bounded retries. Connect/timeout failures and 5xx responses are
/// retried; everything else is returned to the caller untouched.
pub(crate) async fn connect_with_retries(
    client: &reqwest::Client,
    method: reqwest::Method,
    url: &str,
    headers: reqwest::header::HeaderMap,
    body: Option<Bytes>,
) -> Result<reqwest::Response, RelayError> {
    let mut last_err: Option<RelayError> = None;
    for attempt in 0..RETRY_DELAYS.len() {
        let mut request = client
            .request(method.clone(), url)
            .headers(headers.clone())
            .timeout(std::time::Duration::from_secs(30));
        if let Some(body) = &body {
            request = request.body(body.clone());
        }
        match request.send().await {
            Ok(response) if response.status().as_u16() < 500 => return Ok(response),
            Ok(response) => {
                last_err = Some(RelayError::UpstreamStatus(response.status().as_u16()));
            }
            Err(err) if err.is_connect() || err.is_timeout() => {
                last_err = Some(RelayError::Transport(err));
            }
            Err(err) => return Err(RelayError::Transport(err)),
        }
        if attempt < RETRY_DELAYS.len() - 1 {
            tokio::time::sleep(RETRY_DELAYS[attempt]).await;
        }
    }
    Err(last_err.expect("at least one attempt was made"))
}

/// Construct the full upstream message URL from endpoint-event data, which
/// may be a relative path like `/messages?sessionId=abc` or a full URL.
fn build_upstream_message_url(upstream_base: &str, endpoint_data: &str) -> String {
    if endpoint_data.starts_with("http") {
        return endpoint_data.to_string();
    }
    match url::Url::parse(upstream_base).and_then(|base| base.join(endpoint_data)) {
        Ok(joined) => joined.to_string(),
        Err(_) => format!("{upstream_base}{endpoint_data}"),
    }
}

/// Replace the upstream message endpoint with our proxy URL.
fn rewrite_endpoint_event(destination: &str, session_id: &str) -> String {
    format!("/{destination}/message?session_id={session_id}")
}

/// Unregisters the relay session and writes the audit line when the SSE
/// stream ends, whether cleanly, on upstream failure, or on disconnect.
struct RelayStreamGuard {
    sessions: Arc<RelaySessionMap>,
    session_id: Option<String>,
    audit: Arc<AuditLogger>,
    user: String,
    source_ip: String,
    destination: String,
    start: Instant,
    status: u16,
    error: Option<String>,
}

impl Drop for RelayStreamGuard {
    fn drop(&mut self) {
        if let Some(session_id) = &self.session_id {
            self.sessions.remove(session_id);
        }
        let mut record = RequestRecord::new(
            self.user.clone(),
            self.source_ip.clone(),
            self.destination.clone(),
            self.status,
            self.start.elapsed().as_secs_f64() * 1000.0,
        );
        record.error = self.error.clone();
        self.audit.log(record);
    }
}

/// Handle `GET /{destination}/sse` for an SSE-kind destination.
pub(crate) async fn handle_sse(
    state: &SharedState,
    dest: &DestinationConfig,
    client_headers: &HeaderMap,
    ctx: RequestCtx,
) -> Response {
    let upstream_base = dest.url.clone().unwrap_or_default();
    let url = format!("{upstream_base}/sse");

    let upstream = match state
        .http
        .get(&url)
        .headers(upstream_headers(client_headers))
        .send()
        .await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(destination = %dest.name, error = %err, "upstream SSE connect failed");
            log_simple(state, dest, &ctx, 502, Some(err.to_string()));
            return json_error(StatusCode::BAD_GATEWAY, "upstream unavailable");
        }
    };

    let status = upstream.status();
    if status.as_u16() >= 400 {
        let body = upstream.bytes().await.unwrap_or_default();
        log_simple(
            state,
            dest,
            &ctx,
            status.as_u16(),
            Some(format!("Upstream returned {}", status.as_u16())),
        );
        return Response::builder()
            .status(proxy_status(status))
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    }

    let destination = dest.name.clone();
    let base = upstream_base.clone();
    let mut byte_stream = Box::pin(upstream.bytes_stream());
    let guard = RelayStreamGuard {
        sessions: state.relay_sessions.clone(),
        session_id: None,
        audit: state.audit.clone(),
        user: ctx.user.clone(),
        source_ip: ctx.source_ip.clone(),
        destination: destination.clone(),
        start: ctx.start,
        status: 200,
        error: None,
    };

    let stream = async_stream::stream! {
        let mut guard = guard;
        let mut buf: Vec<u8> = Vec::new();
        let mut event_type: Option<String> = None;

        loop {
            let chunk = match byte_stream.next().await {
                None => break,
                Some(Err(err)) => {
                    guard.status = 502;
                    guard.error = Some(err.to_string());
                    yield Ok::<Bytes, Infallible>(Bytes::from(format!(
                        "event: error\ndata: {}\n\n",
                        json!({"error": "upstream unavailable"})
                    )));
                    break;
                }
                Some(Ok(chunk)) => chunk,
            };
            buf.extend_from_slice(&chunk);

            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end_matches(['\r', '\n']);

                if let Some(value) = line.strip_prefix("event:") {
                    event_type = Some(value.trim().to_string());
                    yield Ok(Bytes::from(format!("{line}\n")));
                } else if let Some(value) = line.strip_prefix("data:") {
                    let data_value = value.trim();
                    if event_type.as_deref() == Some("endpoint") {
                        if let Some(captures) = SESSION_ID_RE.captures(data_value) {
                            let session_id = captures[1].to_string();
                            guard.sessions.register(
                                session_id.clone(),
                                build_upstream_message_url(&base, data_value),
                            );
                            let rewritten = rewrite_endpoint_event(&destination, &session_id);
                            guard.session_id = Some(session_id);
                            yield Ok(Bytes::from(format!("data: {rewritten}\n")));
                        } else {
                            yield Ok(Bytes::from(format!("{line}\n")));
                        }
                        event_type = None;
                    } else {
                        yield Ok(Bytes::from(format!("{line}\n")));
                    }
                } else if line.is_empty() {
                    // Blank line terminates the SSE event.
                    event_type = None;
                    yield Ok(Bytes::from("\n"));
                } else {
                    yield Ok(Bytes::from(format!("{line}\n")));
                }
            }
        }
    };

    sse_passthrough_response(stream)
}

/// Handle `POST /{destination}/message` for an SSE-kind destination.
/// Undecodable bodies are forwarded unchanged; only the method and id are
/// parsed best-effort for the audit record.
pub(crate) async fn handle_message(
    state: &SharedState,
    dest: &DestinationConfig,
    session_id: &str,
    client_headers: &HeaderMap,
    body: Bytes,
    ctx: &RequestCtx,
) -> Response {
    let Some(upstream_url) = state.relay_sessions.url_for(session_id) else {
        log_simple(state, dest, ctx, 404, None);
        return json_error(
            StatusCode::NOT_FOUND,
            format!("Session not found: {session_id}"),
        );
    };

    relay_body(
        state,
        dest,
        reqwest::Method::POST,
        &upstream_url,
        client_headers,
        Some(body),
        ctx,
    )
    .await
}

/// Handle `POST /{destination}/mcp` for a streamable-HTTP-kind destination.
/// Unlike the legacy message endpoint, a body that fails to decode as JSON is
/// rejected with 400 rather than forwarded.
pub(crate) async fn handle_streamable_post(
    state: &SharedState,
    dest: &DestinationConfig,
    client_headers: &HeaderMap,
    body: Bytes,
    ctx: &RequestCtx,
) -> Response {
    if serde_json::from_slice::<Value>(&body).is_err() {
        log_simple(state, dest, ctx, 400, None);
        return json_error(StatusCode::BAD_REQUEST, "Invalid JSON body");
    }
    let upstream_url = dest.url.clone().unwrap_or_default();
    relay_body(
        state,
        dest,
        reqwest::Method::POST,
        &upstream_url,
        client_headers,
        Some(body),
        ctx,
    )
    .await
}

/// Handle `GET /{destination}/mcp` for a streamable-HTTP-kind destination:
/// the upstream SSE bytes are relayed verbatim.
pub(crate) async fn handle_streamable_get(
    state: &SharedState,
    dest: &DestinationConfig,
    client_headers: &HeaderMap,
    ctx: RequestCtx,
) -> Response {
    let upstream_url = dest.url.clone().unwrap_or_default();
    let upstream = match state
        .http
        .get(&upstream_url)
        .headers(upstream_headers(client_headers))
        .send()
        .await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            log_simple(state, dest, &ctx, 502, Some(err.to_string()));
            return json_error(StatusCode::BAD_GATEWAY, "upstream unavailable");
        }
    };

    let status = upstream.status();
    if status.as_u16() >= 400 {
        let body = upstream.bytes().await.unwrap_or_default();
        log_simple(
            state,
            dest,
            &ctx,
            status.as_u16(),
            Some(format!("Upstream returned {}", status.as_u16())),
        );
        return Response::builder()
            .status(proxy_status(status))
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    }

    let guard = RelayStreamGuard {
        sessions: state.relay_sessions.clone(),
        session_id: None,
        audit: state.audit.clone(),
        user: ctx.user.clone(),
        source_ip: ctx.source_ip.clone(),
        destination: dest.name.clone(),
        start: ctx.start,
        status: 200,
        error: None,
    };
    let mut byte_stream = Box::pin(upstream.bytes_stream());
    let stream = async_stream::stream! {
        let mut guard = guard;
        loop {
            match byte_stream.next().await {
                None => break,
                Some(Ok(chunk)) => yield Ok::<Bytes, Infallible>(chunk),
                Some(Err(err)) => {
                    guard.status = 502;
                    guard.error = Some(err.to_string());
                    break;
                }
            }
        }
    };

    sse_passthrough_response(stream)
}

/// Handle `DELETE /{destination}/mcp` for a streamable-HTTP-kind destination.
pub(crate) async fn handle_streamable_delete(
    state: &SharedState,
    dest: &DestinationConfig,
    client_headers: &HeaderMap,
    ctx: &RequestCtx,
) -> Response {
    let upstream_url = dest.url.clone().unwrap_or_default();
    relay_body(
        state,
        dest,
        reqwest::Method::DELETE,
        &upstream_url,
        client_headers,
        None,
        ctx,
    )
    .await
}

/// Shared forwarding path for bodied relays: scan request, forward with
/// retries, scan response, relay status/headers/body.
async fn relay_body(
    state: &SharedState,
    dest: &DestinationConfig,
    method: reqwest::Method,
    upstream_url: &str,
    client_headers: &HeaderMap,
    body: Option<Bytes>,
    ctx: &RequestCtx,
) -> Response {
    let raw_body = body
        .as_ref()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default();
    let parsed = serde_json::from_str::<Value>(&raw_body).ok();
    let mcp_method = parsed
        .as_ref()
        .and_then(|v| v.get("method"))
        .and_then(Value::as_str)
        .map(String::from);
    let rpc_id = parsed.as_ref().and_then(|v| v.get("id")).cloned();

    let mut request_detection = None;
    let forward_body = match body {
        None => None,
        Some(body) => {
            let scan = state.detector.scan(&raw_body, &dest.detection, false).await;
            request_detection = scan.audit_fields();
            if scan.action == DetectionAction::Block {
                log_request(state, dest, ctx, 403, |r| {
                    r.mcp_method = mcp_method.clone();
                    r.rpc_id = rpc_id.clone();
                    r.request_body = Some(raw_body.clone());
                    r.detection = request_detection.clone();
                });
                return json_error(StatusCode::FORBIDDEN, "Blocked by security policy");
            }
            if scan.action == DetectionAction::Redact {
                Some(Bytes::from(scan.body))
            } else {
                Some(body)
            }
        }
    };

    let upstream = match connect_with_retries(
        &state.http,
        method,
        upstream_url,
        upstream_headers(client_headers),
        forward_body,
    )
    .await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            log_request(state, dest, ctx, 502, |r| {
                r.mcp_method = mcp_method.clone();
                r.rpc_id = rpc_id.clone();
                r.request_body = (!raw_body.is_empty()).then(|| raw_body.clone());
                r.error = Some(err.to_string());
            });
            return (
                StatusCode::BAD_GATEWAY,
                axum::Json(json!({"error": "Upstream unreachable", "detail": err.to_string()})),
            )
                .into_response();
        }
    };

    let status = upstream.status();
    let upstream_headers_out = upstream.headers().clone();
    let response_bytes = upstream.bytes().await.unwrap_or_default();
    let response_text = String::from_utf8_lossy(&response_bytes).into_owned();

    let response_scan = state.detector.scan(&response_text, &dest.detection, true).await;
    let detection = DetectionFields::stricter(request_detection, response_scan.audit_fields());
    if response_scan.action == DetectionAction::Block {
        log_request(state, dest, ctx, 403, |r| {
            r.mcp_method = mcp_method.clone();
            r.rpc_id = rpc_id.clone();
            r.request_body = (!raw_body.is_empty()).then(|| raw_body.clone());
            r.response_body = Some(response_text.clone());
            r.detection = detection.clone();
        });
        return json_error(StatusCode::FORBIDDEN, "Blocked by security policy");
    }
    let delivered = if response_scan.action == DetectionAction::Redact {
        Bytes::from(response_scan.body)
    } else {
        response_bytes
    };

    log_request(state, dest, ctx, status.as_u16(), |r| {
        r.mcp_method = mcp_method.clone();
        r.rpc_id = rpc_id.clone();
        r.request_body = (!raw_body.is_empty()).then(|| raw_body.clone());
        r.response_body = (!delivered.is_empty())
            .then(|| String::from_utf8_lossy(&delivered).into_owned());
        r.detection = detection.clone();
    });

    let mut response = Response::builder()
        .status(proxy_status(status))
        .body(Body::from(delivered))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    copy_response_headers(&upstream_headers_out, &mut response);
    response
}

fn sse_passthrough_response(
    stream: impl futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn log_simple(
    state: &SharedState,
    dest: &DestinationConfig,
    ctx: &RequestCtx,
    status: u16,
    error: Option<String>,
) {
    log_request(state, dest, ctx, status, |r| r.error = error);
}

fn log_request(
    state: &SharedState,
    dest: &DestinationConfig,
    ctx: &RequestCtx,
    status: u16,
    fill: impl FnOnce(&mut RequestRecord),
) {
    let mut record = RequestRecord::new(
        ctx.user.clone(),
        ctx.source_ip.clone(),
        dest.name.clone(),
        status,
        ctx.latency_ms(),
    );
    fill(&mut record);
    state.audit.log(record);
}
