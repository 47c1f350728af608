//! stdio ↔ SSE bridge, legacy per-connection flavor.
//!
//! Each GET `/sse` spawns its own subprocess. The stream opens with one
//! synthetic `endpoint` frame telling the client where to POST, then relays
//! stdout lines as `data:` frames verbatim. A matching POST handler enqueues
//! onto the connection's bounded stdin queue. Per-connection restart policy
//! matches the shared bridge: three restarts with backoff, then one
//! `event: error` frame and close.
//!
//! Canonical stdio destinations expose only `/mcp`; this flavor is reached
//! only when a destination opts in with `legacy_sse: true`.

use crate::bridge::{RETRY_DELAYS, is_uuid4, spawn_child, spawn_stderr_logger};
use crate::http::{RequestCtx, json_error};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response, Sse, sse::Event, sse::KeepAlive},
};
use dashmap::DashMap;
use palisade_core::detector::DetectionAction;
use palisade_core::{AuditLogger, DestinationConfig, Detector, RequestRecord};
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex as StdMutex},
    time::Instant,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
};
use tracing::warn;
use uuid::Uuid;

/// Capacity of the per-connection stdin queue.
const STDIN_QUEUE_SIZE: usize = 256;

/// Message for the stdin writer. `Close` shuts the writer down cleanly.
pub(crate) enum StdinMessage {
    Data(Vec<u8>),
    Close,
}

/// One legacy SSE connection: its subprocess and stdin queue.
pub struct SseSession {
    pub session_id: String,
    stdin_tx: mpsc::Sender<StdinMessage>,
    pid: StdMutex<Option<u32>>,
}

/// Registry of live legacy SSE connections, keyed by session id.
pub struct SseSessionRegistry {
    sessions: Arc<DashMap<String, Arc<SseSession>>>,
    audit: Arc<AuditLogger>,
    detector: Arc<Detector>,
}

impl SseSessionRegistry {
    pub fn new(audit: Arc<AuditLogger>, detector: Arc<Detector>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            audit,
            detector,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Handle `GET /{destination}/sse`: spawn a dedicated subprocess and
    /// stream its stdout, starting with the synthetic endpoint frame.
    pub async fn handle_sse(
        &self,
        dest: &DestinationConfig,
        subprocess_env: HashMap<String, String>,
        ctx: RequestCtx,
    ) -> Response {
        let command = dest.command.clone().unwrap_or_default();
        let session_id = Uuid::new_v4().to_string();

        let spawned = match spawn_child(&command, &subprocess_env, true) {
            Ok(spawned) => spawned,
            Err(err) => {
                warn!(destination = %dest.name, error = %err, "subprocess start failed");
                let mut record = RequestRecord::new(
                    "stdio",
                    ctx.source_ip.clone(),
                    dest.name.clone(),
                    503,
                    ctx.latency_ms(),
                );
                record.error = Some(err.to_string());
                self.audit.log(record);
                return json_error(StatusCode::SERVICE_UNAVAILABLE, "Failed to start subprocess");
            }
        };

        let (stdin_tx, mut rx) = mpsc::channel(STDIN_QUEUE_SIZE);
        let session = Arc::new(SseSession {
            session_id: session_id.clone(),
            stdin_tx,
            pid: StdMutex::new(spawned.pid),
        });
        self.sessions.insert(session_id.clone(), session.clone());
        spawn_stderr_logger(spawned.stderr, dest.name.clone());

        let destination = dest.name.clone();
        let guard = SseConnGuard {
            sessions: self.sessions.clone(),
            session_id: session_id.clone(),
            destination: destination.clone(),
            audit: self.audit.clone(),
            source_ip: ctx.source_ip.clone(),
            start: ctx.start,
            status: 200,
        };

        enum Step {
            Stdin(Option<StdinMessage>),
            Stdout(std::io::Result<Option<String>>),
        }

        let stream = async_stream::stream! {
            let mut guard = guard;
            let mut child = spawned.child;
            let mut stdin = spawned.stdin;
            let mut lines = BufReader::new(spawned.stdout).lines();

            // First frame: tell the client where to POST messages.
            yield Ok::<Event, Infallible>(
                Event::default()
                    .event("endpoint")
                    .data(format!("/{destination}/message?session_id={session_id}")),
            );

            let mut attempt = 0usize;
            'outer: loop {
                loop {
                    let step = tokio::select! {
                        msg = rx.recv() => Step::Stdin(msg),
                        line = lines.next_line() => Step::Stdout(line),
                    };
                    match step {
                        Step::Stdin(Some(StdinMessage::Data(bytes))) => {
                            if stdin.write_all(&bytes).await.is_err()
                                || stdin.flush().await.is_err()
                            {
                                break;
                            }
                        }
                        Step::Stdin(Some(StdinMessage::Close)) | Step::Stdin(None) => {
                            break 'outer;
                        }
                        Step::Stdout(Ok(Some(line))) => {
                            if !line.is_empty() {
                                yield Ok(Event::default().data(line));
                            }
                        }
                        Step::Stdout(_) => break,
                    }
                }

                let _ = child.wait().await;
                if attempt >= RETRY_DELAYS.len() {
                    guard.status = 503;
                    yield Ok(Event::default()
                        .event("error")
                        .data(json!({"error": "subprocess unavailable"}).to_string()));
                    break 'outer;
                }
                tokio::time::sleep(RETRY_DELAYS[attempt]).await;
                attempt += 1;

                match spawn_child(&command, &subprocess_env, true) {
                    Ok(respawned) => {
                        child = respawned.child;
                        stdin = respawned.stdin;
                        lines = BufReader::new(respawned.stdout).lines();
                        *session.pid.lock().unwrap_or_else(|e| e.into_inner()) = respawned.pid;
                        spawn_stderr_logger(respawned.stderr, guard.destination.clone());
                    }
                    Err(err) => {
                        warn!(
                            destination = %guard.destination,
                            error = %err,
                            "subprocess restart failed"
                        );
                        guard.status = 503;
                        yield Ok(Event::default()
                            .event("error")
                            .data(json!({"error": "subprocess unavailable"}).to_string()));
                        break 'outer;
                    }
                }
            }
        };

        Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response()
    }

    /// Handle `POST /{destination}/message`: enqueue onto the session's
    /// stdin queue, appending the trailing newline when missing.
    pub async fn handle_message(
        &self,
        dest: &DestinationConfig,
        session_id: &str,
        body: &[u8],
        ctx: &RequestCtx,
    ) -> Response {
        if !is_uuid4(session_id) {
            self.log(dest, ctx, 400, |_| {});
            return json_error(StatusCode::BAD_REQUEST, "Invalid session_id format");
        }
        let Some(session) = self.sessions.get(session_id).map(|s| s.clone()) else {
            self.log(dest, ctx, 404, |_| {});
            return json_error(
                StatusCode::NOT_FOUND,
                format!("Session not found: {session_id}"),
            );
        };

        let raw_body = String::from_utf8_lossy(body).into_owned();
        let parsed = serde_json::from_str::<Value>(&raw_body).ok();
        let mcp_method = parsed
            .as_ref()
            .and_then(|v| v.get("method"))
            .and_then(Value::as_str)
            .map(String::from);
        let rpc_id = parsed.as_ref().and_then(|v| v.get("id")).cloned();

        let scan = self.detector.scan(&raw_body, &dest.detection, false).await;
        let detection = scan.audit_fields();
        if scan.action == DetectionAction::Block {
            self.log(dest, ctx, 403, |r| {
                r.mcp_method = mcp_method.clone();
                r.rpc_id = rpc_id.clone();
                r.request_body = Some(raw_body.clone());
                r.detection = detection.clone();
            });
            return json_error(StatusCode::FORBIDDEN, "Blocked by security policy");
        }

        let mut bytes = if scan.action == DetectionAction::Redact {
            scan.body.into_bytes()
        } else {
            body.to_vec()
        };
        if !bytes.ends_with(b"\n") {
            bytes.push(b'\n');
        }
        let _ = session.stdin_tx.send(StdinMessage::Data(bytes)).await;

        self.log(dest, ctx, 202, |r| {
            r.mcp_method = mcp_method.clone();
            r.rpc_id = rpc_id.clone();
            r.request_body = Some(raw_body.clone());
            r.detection = detection.clone();
        });
        StatusCode::ACCEPTED.into_response()
    }

    /// Shut every legacy connection down: the `Close` variant stops each
    /// stdin writer, SIGTERM nudges the subprocess, and kill-on-drop reaps
    /// whatever survives the stream teardown.
    pub async fn shutdown_all(&self) {
        for entry in self.sessions.iter() {
            let session = entry.value();
            let _ = session.stdin_tx.try_send(StdinMessage::Close);
            #[cfg(unix)]
            {
                let pid = *session.pid.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(pid) = pid {
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                }
            }
        }
        self.sessions.clear();
    }

    fn log(
        &self,
        dest: &DestinationConfig,
        ctx: &RequestCtx,
        status: u16,
        fill: impl FnOnce(&mut RequestRecord),
    ) {
        let mut record = RequestRecord::new(
            "stdio",
            ctx.source_ip.clone(),
            dest.name.clone(),
            status,
            ctx.latency_ms(),
        );
        fill(&mut record);
        self.audit.log(record);
    }
}

/// Unregisters the connection and writes its audit line on stream teardown.
/// The subprocess itself is reaped by kill-on-drop when the stream drops it.
struct SseConnGuard {
    sessions: Arc<DashMap<String, Arc<SseSession>>>,
    session_id: String,
    destination: String,
    audit: Arc<AuditLogger>,
    source_ip: String,
    start: Instant,
    status: u16,
}

impl Drop for SseConnGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.session_id);
        self.audit.log(RequestRecord::new(
            "stdio",
            self.source_ip.clone(),
            self.destination.clone(),
            self.status,
            self.start.elapsed().as_secs_f64() * 1000.0,
        ));
    }
}

