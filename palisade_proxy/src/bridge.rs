//! stdio ↔ Streamable HTTP bridge.
//!
//! Each stdio destination gets a single long-lived subprocess shared across
//! all logical sessions. A per-destination [`StdioBridge`] holds:
//!
//! *   the stdin feed channel (one writer task, so concurrent POSTs can never
//!     interleave bytes on the pipe)
//! *   a pending map of internal id → waiting POST caller
//! *   the set of active `Mcp-Session-Id` values
//! *   one bounded notification queue per active GET stream
//!
//! The supervisor task dispatches subprocess stdout:
//!
//! *   lines whose id matches a pending entry resolve that POST's waiter with
//!     the caller's original id restored
//! *   all other lines are notifications, broadcast to every queue
//!
//! Restart policy: up to three restarts with delays `[0.5s, 1.0s, 2.0s]`. On
//! exhaustion every pending caller fails, every notification stream receives
//! the close sentinel, and the bridge is dropped from the table so the next
//! POST starts fresh.

use crate::error::BridgeError;
use crate::http::{RequestCtx, json_error};
use axum::{
    body::Body,
    http::{StatusCode, header},
    response::{IntoResponse, Response, Sse, sse::Event, sse::KeepAlive},
};
use dashmap::DashMap;
use palisade_core::audit::DetectionFields;
use palisade_core::detector::DetectionAction;
use palisade_core::{AuditLogger, DestinationConfig, Detector, RequestRecord};
use regex::Regex;
use serde_json::{Value, json};
use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    process::Stdio,
    sync::{
        Arc, LazyLock,
        Mutex as StdMutex,
        atomic::{AtomicU16, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Backoff schedule between subprocess restarts.
pub const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
];

/// Grace period between SIGTERM and SIGKILL at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Capacity of each GET stream's notification queue.
const MAX_QUEUE_SIZE: usize = 256;

/// Capacity of the stdin feed channel.
const STDIN_CHANNEL_CAPACITY: usize = 100;

static UUID4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("static regex")
});

/// Validate the `Mcp-Session-Id` wire format before any lookup.
pub(crate) fn is_uuid4(value: &str) -> bool {
    UUID4_RE.is_match(value)
}

struct PendingCall {
    original_id: Value,
    tx: oneshot::Sender<Value>,
}

struct StreamHandle {
    tx: mpsc::Sender<String>,
    /// Close sentinel: cancelled when the subprocess is gone or the session
    /// is deleted. Always deliverable, regardless of queue depth.
    closed: CancellationToken,
}

/// All state for one stdio destination's subprocess and sessions.
pub struct StdioBridge {
    destination: String,
    command: String,
    subprocess_env: HashMap<String, String>,
    /// Wrapped in a mutex so a fresh channel can be installed on respawn.
    stdin_tx: Mutex<mpsc::Sender<String>>,
    pending: DashMap<u64, PendingCall>,
    counter: AtomicU64,
    sessions: StdMutex<HashSet<String>>,
    streams: DashMap<Uuid, StreamHandle>,
    session_streams: DashMap<String, HashSet<Uuid>>,
    /// Spawn serializer: holds the supervisor handle; a live supervisor owns
    /// the retry cycle and must not be raced by another spawn.
    supervisor: Mutex<Option<JoinHandle<()>>>,
    child_pid: StdMutex<Option<u32>>,
    audit: Arc<AuditLogger>,
    shutdown: CancellationToken,
}

impl StdioBridge {
    fn new(
        dest: &DestinationConfig,
        subprocess_env: HashMap<String, String>,
        audit: Arc<AuditLogger>,
        shutdown: CancellationToken,
    ) -> Self {
        // Placeholder channel; ensure_subprocess installs the live one.
        let (stdin_tx, _) = mpsc::channel(1);
        Self {
            destination: dest.name.clone(),
            command: dest.command.clone().unwrap_or_default(),
            subprocess_env,
            stdin_tx: Mutex::new(stdin_tx),
            pending: DashMap::new(),
            counter: AtomicU64::new(0),
            sessions: StdMutex::new(HashSet::new()),
            streams: DashMap::new(),
            session_streams: DashMap::new(),
            supervisor: Mutex::new(None),
            child_pid: StdMutex::new(None),
            audit,
            shutdown,
        }
    }

    async fn send_line(&self, line: String) -> Result<(), BridgeError> {
        let tx = self.stdin_tx.lock().await.clone();
        tx.send(line)
            .await
            .map_err(|_| BridgeError::Communication("subprocess stdin unavailable".into()))
    }

    fn session_exists(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(session_id)
    }

    fn remove_session(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id)
    }

    /// Fail every in-flight caller. Dropping the oneshot senders wakes each
    /// waiting POST with a receive error, which maps to 503.
    fn fail_pending(&self) {
        self.pending.clear();
    }

    fn dispatch_stdout_line(&self, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => {
                let preview: String = line.chars().take(256).collect();
                warn!(
                    destination = %self.destination,
                    line = %preview,
                    "subprocess stdout: malformed JSON"
                );
                return;
            }
        };

        if let Some(internal_id) = value.get("id").and_then(Value::as_u64) {
            if let Some((_, call)) = self.pending.remove(&internal_id) {
                let mut message = value;
                message["id"] = call.original_id.clone();

                let mut record = RequestRecord::new("stdio", "localhost", &self.destination, 200, 0.0);
                record.rpc_id = Some(call.original_id);
                record.response_body = Some(line.to_string());
                self.audit.log(record);

                let _ = call.tx.send(message);
                return;
            }
        }

        // Notification (or a reply whose caller already timed out):
        // broadcast to every active GET stream, dropping when a queue is full
        // rather than ever blocking the dispatcher.
        let mut record = RequestRecord::new("stdio", "localhost", &self.destination, 200, 0.0);
        record.response_body = Some(line.to_string());
        self.audit.log(record);

        for entry in self.streams.iter() {
            let _ = entry.value().tx.try_send(line.to_string());
        }
    }

    #[cfg(unix)]
    fn signal(&self, signal: i32) {
        let pid = *self.child_pid.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pid) = pid {
            unsafe {
                libc::kill(pid as i32, signal);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: i32) {}

    fn terminate(&self) {
        #[cfg(unix)]
        self.signal(libc::SIGTERM);
    }

    fn kill(&self) {
        #[cfg(unix)]
        self.signal(libc::SIGKILL);
    }
}

/// Per-destination bridge registry plus the knobs shared by every bridge.
pub struct BridgeTable {
    bridges: Arc<DashMap<String, Arc<StdioBridge>>>,
    audit: Arc<AuditLogger>,
    detector: Arc<Detector>,
    max_sessions: usize,
    response_timeout: Duration,
    shutdown: CancellationToken,
}

impl BridgeTable {
    pub fn new(
        audit: Arc<AuditLogger>,
        detector: Arc<Detector>,
        max_sessions: usize,
        response_timeout: Duration,
    ) -> Self {
        Self {
            bridges: Arc::new(DashMap::new()),
            audit,
            detector,
            max_sessions,
            response_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether a live bridge exists for the destination.
    pub fn contains(&self, destination: &str) -> bool {
        self.bridges.contains_key(destination)
    }

    /// Active session count for a destination (0 when no bridge exists).
    pub fn session_count(&self, destination: &str) -> usize {
        self.bridges
            .get(destination)
            .map(|b| b.sessions.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }

    fn get_or_create(
        &self,
        dest: &DestinationConfig,
        subprocess_env: HashMap<String, String>,
    ) -> Arc<StdioBridge> {
        self.bridges
            .entry(dest.name.clone())
            .or_insert_with(|| {
                Arc::new(StdioBridge::new(
                    dest,
                    subprocess_env,
                    self.audit.clone(),
                    self.shutdown.clone(),
                ))
            })
            .clone()
    }

    /// Ensure the bridge's subprocess is running. If the supervisor task is
    /// alive (including sleeping between retries) this returns without
    /// interfering with the retry cycle.
    async fn ensure_subprocess(&self, bridge: &Arc<StdioBridge>) -> Result<(), BridgeError> {
        let mut slot = bridge.supervisor.lock().await;
        if let Some(task) = slot.as_ref() {
            if !task.is_finished() {
                return Ok(());
            }
        }

        let spawned = spawn_child(&bridge.command, &bridge.subprocess_env, false)?;
        info!(
            destination = %bridge.destination,
            pid = spawned.pid,
            "subprocess started"
        );
        *bridge.child_pid.lock().unwrap_or_else(|e| e.into_inner()) = spawned.pid;

        let (tx, rx) = mpsc::channel(STDIN_CHANNEL_CAPACITY);
        *bridge.stdin_tx.lock().await = tx;

        spawn_stderr_logger(spawned.stderr, bridge.destination.clone());
        *slot = Some(tokio::spawn(supervise(
            bridge.clone(),
            self.bridges.clone(),
            spawned.child,
            spawned.stdin,
            spawned.stdout,
            rx,
        )));
        Ok(())
    }

    /// Handle `POST /{destination}/mcp` for a stdio destination.
    pub async fn post(
        &self,
        dest: &DestinationConfig,
        subprocess_env: HashMap<String, String>,
        session_header: Option<&str>,
        body: &[u8],
        ctx: &RequestCtx,
    ) -> Response {
        let bridge = self.get_or_create(dest, subprocess_env);

        if let Err(err) = self.ensure_subprocess(&bridge).await {
            warn!(destination = %dest.name, error = %err, "subprocess start failed");
            self.log(dest, ctx, 503, |r| r.error = Some(err.to_string()));
            return json_error(StatusCode::SERVICE_UNAVAILABLE, "Failed to start subprocess");
        }

        let raw_body = String::from_utf8_lossy(body).into_owned();
        let mcp_method = serde_json::from_str::<Value>(&raw_body)
            .ok()
            .and_then(|v| v.get("method").and_then(Value::as_str).map(String::from));

        let request_scan = self.detector.scan(&raw_body, &dest.detection, false).await;
        let request_detection = request_scan.audit_fields();
        if request_scan.action == DetectionAction::Block {
            self.log(dest, ctx, 403, |r| {
                r.mcp_method = mcp_method.clone();
                r.request_body = Some(raw_body.clone());
                r.detection = request_detection.clone();
            });
            return json_error(StatusCode::FORBIDDEN, "Blocked by security policy");
        }
        let effective_body = request_scan.body;

        let mut payload: Value = match serde_json::from_str(&effective_body) {
            Ok(Value::Array(_)) => {
                self.log(dest, ctx, 400, |r| r.request_body = Some(raw_body.clone()));
                return json_error(StatusCode::BAD_REQUEST, "Batch JSON-RPC is not supported");
            }
            Ok(value @ Value::Object(_)) => value,
            _ => {
                self.log(dest, ctx, 400, |r| r.request_body = Some(raw_body.clone()));
                return json_error(StatusCode::BAD_REQUEST, "Invalid JSON body");
            }
        };

        let original_id = payload.get("id").cloned();

        // Session bookkeeping. The cap check and insert happen under one lock
        // so concurrent first-POSTs cannot overshoot the limit.
        let (session_id, new_session) = match session_header {
            None => {
                if original_id.is_none() {
                    // A notification cannot initiate a session: the client has
                    // no way to receive the session id we would mint.
                    self.log(dest, ctx, 400, |r| {
                        r.mcp_method = mcp_method.clone();
                        r.request_body = Some(raw_body.clone());
                    });
                    return json_error(
                        StatusCode::BAD_REQUEST,
                        "Cannot initiate a session with a notification (missing 'id')",
                    );
                }
                let mut sessions = bridge.sessions.lock().unwrap_or_else(|e| e.into_inner());
                if sessions.len() >= self.max_sessions {
                    drop(sessions);
                    self.log(dest, ctx, 503, |r| r.mcp_method = mcp_method.clone());
                    return json_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        format!(
                            "Too many active sessions for '{}' (max {})",
                            dest.name, self.max_sessions
                        ),
                    );
                }
                let session_id = Uuid::new_v4().to_string();
                sessions.insert(session_id.clone());
                (session_id, true)
            }
            Some(header) if !is_uuid4(header) => {
                self.log(dest, ctx, 400, |r| r.mcp_method = mcp_method.clone());
                return json_error(StatusCode::BAD_REQUEST, "Invalid Mcp-Session-Id format");
            }
            Some(header) if !bridge.session_exists(header) => {
                self.log(dest, ctx, 404, |r| r.mcp_method = mcp_method.clone());
                return json_error(
                    StatusCode::NOT_FOUND,
                    format!("Session not found: {header}"),
                );
            }
            Some(header) => (header.to_string(), false),
        };

        // Client notification: fire-and-forget, 202 without waiting.
        let Some(original_id) = original_id else {
            let _ = bridge.send_line(payload.to_string()).await;
            self.log(dest, ctx, 202, |r| {
                r.mcp_method = mcp_method.clone();
                r.request_body = Some(raw_body.clone());
                r.detection = request_detection.clone();
            });
            return StatusCode::ACCEPTED.into_response();
        };

        // Assign a monotonic internal id so two clients may both submit id=1
        // without colliding; they only ever see their own id echoed back.
        let internal_id = bridge.counter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        bridge.pending.insert(
            internal_id,
            PendingCall {
                original_id: original_id.clone(),
                tx,
            },
        );
        payload["id"] = json!(internal_id);

        if let Err(err) = bridge.send_line(payload.to_string()).await {
            bridge.pending.remove(&internal_id);
            if new_session {
                bridge.remove_session(&session_id);
            }
            self.log(dest, ctx, 503, |r| {
                r.mcp_method = mcp_method.clone();
                r.request_body = Some(raw_body.clone());
                r.error = Some(err.to_string());
            });
            return json_error(StatusCode::SERVICE_UNAVAILABLE, "Subprocess stdin unavailable");
        }

        let reply = match tokio::time::timeout(self.response_timeout, rx).await {
            Err(_) => {
                bridge.pending.remove(&internal_id);
                if new_session {
                    bridge.remove_session(&session_id);
                }
                self.log(dest, ctx, 504, |r| {
                    r.mcp_method = mcp_method.clone();
                    r.rpc_id = Some(original_id.clone());
                    r.request_body = Some(raw_body.clone());
                });
                return json_error(StatusCode::GATEWAY_TIMEOUT, "Subprocess response timeout");
            }
            Ok(Err(_)) => {
                if new_session {
                    bridge.remove_session(&session_id);
                }
                self.log(dest, ctx, 503, |r| {
                    r.mcp_method = mcp_method.clone();
                    r.rpc_id = Some(original_id.clone());
                    r.request_body = Some(raw_body.clone());
                    r.error = Some("subprocess exited".into());
                });
                return json_error(StatusCode::SERVICE_UNAVAILABLE, "Subprocess unavailable");
            }
            Ok(Ok(reply)) => reply,
        };

        let reply_body = reply.to_string();
        let response_scan = self.detector.scan(&reply_body, &dest.detection, true).await;
        let detection =
            DetectionFields::stricter(request_detection, response_scan.audit_fields());
        if response_scan.action == DetectionAction::Block {
            self.log(dest, ctx, 403, |r| {
                r.mcp_method = mcp_method.clone();
                r.rpc_id = Some(original_id.clone());
                r.request_body = Some(raw_body.clone());
                r.response_body = Some(reply_body.clone());
                r.detection = detection.clone();
            });
            return json_error(StatusCode::FORBIDDEN, "Blocked by security policy");
        }
        let delivered = response_scan.body;

        self.log(dest, ctx, 200, |r| {
            r.mcp_method = mcp_method.clone();
            r.rpc_id = Some(original_id.clone());
            r.request_body = Some(raw_body.clone());
            r.response_body = Some(delivered.clone());
            r.detection = detection.clone();
        });

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(delivered))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        if new_session {
            if let Ok(value) = session_id.parse() {
                response.headers_mut().insert("mcp-session-id", value);
            }
        }
        response
    }

    /// Handle `GET /{destination}/mcp`: an SSE stream draining one fresh
    /// notification queue. Multiple concurrent streams per session broadcast.
    pub async fn get(
        &self,
        dest: &DestinationConfig,
        session_header: Option<&str>,
        ctx: RequestCtx,
    ) -> Response {
        let Some(session_id) = session_header else {
            self.log(dest, &ctx, 400, |_| {});
            return json_error(StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header");
        };
        if !is_uuid4(session_id) {
            self.log(dest, &ctx, 400, |_| {});
            return json_error(StatusCode::BAD_REQUEST, "Invalid Mcp-Session-Id format");
        }
        let bridge = self.bridges.get(&dest.name).map(|b| b.clone());
        let Some(bridge) = bridge.filter(|b| b.session_exists(session_id)) else {
            self.log(dest, &ctx, 404, |_| {});
            return json_error(
                StatusCode::NOT_FOUND,
                format!("Session not found: {session_id}"),
            );
        };

        let stream_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(MAX_QUEUE_SIZE);
        let closed = CancellationToken::new();
        bridge.streams.insert(
            stream_id,
            StreamHandle {
                tx,
                closed: closed.clone(),
            },
        );
        bridge
            .session_streams
            .entry(session_id.to_string())
            .or_default()
            .insert(stream_id);

        let status = Arc::new(AtomicU16::new(200));
        let guard = StreamGuard {
            bridge: bridge.clone(),
            stream_id,
            session_id: session_id.to_string(),
            destination: dest.name.clone(),
            audit: self.audit.clone(),
            source_ip: ctx.source_ip.clone(),
            start: ctx.start,
            status: status.clone(),
        };

        enum Next {
            Sentinel,
            Notification(String),
            Done,
        }

        let stream = async_stream::stream! {
            let _guard = guard;
            loop {
                let next = tokio::select! {
                    _ = closed.cancelled() => Next::Sentinel,
                    item = rx.recv() => match item {
                        Some(line) => Next::Notification(line),
                        None => Next::Done,
                    },
                };
                match next {
                    Next::Sentinel => {
                        // Subprocess gone (or session deleted): tell the
                        // client once, then end the stream.
                        status.store(503, Ordering::Relaxed);
                        yield Ok::<Event, Infallible>(
                            Event::default()
                                .event("error")
                                .data(json!({"error": "subprocess unavailable"}).to_string()),
                        );
                        break;
                    }
                    Next::Notification(line) => yield Ok(Event::default().data(line)),
                    Next::Done => break,
                }
            }
        };

        Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response()
    }

    /// Handle `DELETE /{destination}/mcp`: remove the session and close its
    /// notification streams. The subprocess survives for other sessions.
    pub async fn delete(
        &self,
        dest: &DestinationConfig,
        session_header: Option<&str>,
        ctx: &RequestCtx,
    ) -> Response {
        let Some(session_id) = session_header else {
            self.log(dest, ctx, 400, |_| {});
            return json_error(StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header");
        };
        if !is_uuid4(session_id) {
            self.log(dest, ctx, 400, |_| {});
            return json_error(StatusCode::BAD_REQUEST, "Invalid Mcp-Session-Id format");
        }
        let bridge = self.bridges.get(&dest.name).map(|b| b.clone());
        let removed = bridge
            .as_ref()
            .map(|b| b.remove_session(session_id))
            .unwrap_or(false);
        if !removed {
            self.log(dest, ctx, 404, |_| {});
            return json_error(
                StatusCode::NOT_FOUND,
                format!("Session not found: {session_id}"),
            );
        }
        let bridge = bridge.expect("session removal implies bridge");

        if let Some((_, stream_ids)) = bridge.session_streams.remove(session_id) {
            for stream_id in stream_ids {
                if let Some(handle) = bridge.streams.get(&stream_id) {
                    handle.closed.cancel();
                }
            }
        }

        self.log(dest, ctx, 204, |_| {});
        StatusCode::NO_CONTENT.into_response()
    }

    /// Gracefully terminate every bridge subprocess: SIGTERM, wait up to the
    /// grace period, then SIGKILL survivors. Called at proxy shutdown.
    pub async fn shutdown_all(&self) {
        self.shutdown.cancel();

        let bridges: Vec<Arc<StdioBridge>> =
            self.bridges.iter().map(|entry| entry.value().clone()).collect();
        if bridges.is_empty() {
            return;
        }
        info!(count = bridges.len(), "shutdown: terminating stdio bridges");

        for bridge in &bridges {
            bridge.terminate();
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for bridge in &bridges {
            let task = bridge.supervisor.lock().await.take();
            let Some(task) = task else { continue };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, task).await.is_err() {
                bridge.kill();
            }
        }
        self.bridges.clear();
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

/// Unregisters a GET stream and writes its audit line, whether the stream
/// ended by sentinel, queue close, or client disconnect.
struct StreamGuard {
    bridge: Arc<StdioBridge>,
    stream_id: Uuid,
    session_id: String,
    destination: String,
    audit: Arc<AuditLogger>,
    source_ip: String,
    start: Instant,
    status: Arc<AtomicU16>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.bridge.streams.remove(&self.stream_id);
        if let Some(mut streams) = self.bridge.session_streams.get_mut(&self.session_id) {
            streams.remove(&self.stream_id);
        }
        self.audit.log(RequestRecord::new(
            "stdio",
            self.source_ip.clone(),
            self.destination.clone(),
            self.status.load(Ordering::Relaxed),
            self.start.elapsed().as_secs_f64() * 1000.0,
        ));
    }
}

pub(crate) struct SpawnedChild {
    pub(crate) child: Child,
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: ChildStdout,
    pub(crate) stderr: ChildStderr,
    pub(crate) pid: Option<u32>,
}

/// Spawn the destination command with a scrubbed environment and pipes for
/// stdin/stdout/stderr. The command was validated at startup; splitting here
/// re-checks so a broken command can never reach `exec`.
pub(crate) fn spawn_child(
    command: &str,
    env: &HashMap<String, String>,
    kill_on_drop: bool,
) -> Result<SpawnedChild, BridgeError> {
    let argv = shlex_split(command)?;
    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(kill_on_drop)
        .spawn()
        .map_err(|err| BridgeError::Subprocess(format!("failed to spawn subprocess: {err}")))?;

    let pid = child.id();
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| BridgeError::Subprocess("subprocess stdin missing".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::Subprocess("subprocess stdout missing".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| BridgeError::Subprocess("subprocess stderr missing".into()))?;

    Ok(SpawnedChild {
        child,
        stdin,
        stdout,
        stderr,
        pid,
    })
}

pub(crate) fn shlex_split(command: &str) -> Result<Vec<String>, BridgeError> {
    match shlex::split(command) {
        Some(argv) if !argv.is_empty() => Ok(argv),
        _ => Err(BridgeError::Subprocess(format!(
            "command cannot be parsed: {command}"
        ))),
    }
}

/// Read subprocess stderr line-by-line and log at WARN. Never forwarded.
pub(crate) fn spawn_stderr_logger(stderr: ChildStderr, destination: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            warn!(destination = %destination, stderr_line = %line, "subprocess stderr");
        }
    });
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Long-lived per-destination supervisor: feeds stdin from the channel,
/// dispatches stdout, and drives the restart cycle.
async fn supervise(
    bridge: Arc<StdioBridge>,
    bridges: Arc<DashMap<String, Arc<StdioBridge>>>,
    mut child: Child,
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    mut rx: mpsc::Receiver<String>,
) {
    let mut lines = BufReader::new(stdout).lines();

    for attempt in 0..=RETRY_DELAYS.len() {
        loop {
            tokio::select! {
                Some(line) = rx.recv() => {
                    if let Err(err) = write_line(&mut stdin, &line).await {
                        error!(
                            destination = %bridge.destination,
                            error = %err,
                            "failed to write to subprocess stdin"
                        );
                        break;
                    }
                }
                result = lines.next_line() => {
                    match result {
                        Ok(Some(line)) if line.is_empty() => {}
                        Ok(Some(line)) => bridge.dispatch_stdout_line(&line),
                        Ok(None) => break,
                        Err(err) => {
                            warn!(
                                destination = %bridge.destination,
                                error = %err,
                                "subprocess stdout reader error"
                            );
                            break;
                        }
                    }
                }
            }
        }

        let exit_code = child.wait().await.ok().and_then(|s| s.code());
        warn!(
            destination = %bridge.destination,
            exit_code,
            attempt = attempt + 1,
            "subprocess exited"
        );

        // Fail all pending waiters so their POST handlers can return 503.
        bridge.fail_pending();

        if attempt >= RETRY_DELAYS.len() {
            break;
        }
        if bridge.shutdown.is_cancelled() {
            return;
        }

        let delay = RETRY_DELAYS[attempt];
        info!(
            destination = %bridge.destination,
            retry_in = ?delay,
            restart_attempt = attempt + 1,
            "subprocess restarting"
        );
        tokio::time::sleep(delay).await;

        match spawn_child(&bridge.command, &bridge.subprocess_env, false) {
            Ok(spawned) => {
                child = spawned.child;
                stdin = spawned.stdin;
                lines = BufReader::new(spawned.stdout).lines();
                *bridge.child_pid.lock().unwrap_or_else(|e| e.into_inner()) = spawned.pid;
                spawn_stderr_logger(spawned.stderr, bridge.destination.clone());
                info!(
                    destination = %bridge.destination,
                    pid = spawned.pid,
                    restart_attempt = attempt + 1,
                    "subprocess restarted"
                );
            }
            Err(err) => {
                warn!(
                    destination = %bridge.destination,
                    restart_attempt = attempt + 1,
                    error = %err,
                    "subprocess restart failed"
                );
                break;
            }
        }
    }

    // All retries exhausted: close every GET stream with the sentinel, clear
    // session state, and drop the bridge so the next POST starts fresh.
    warn!(
        destination = %bridge.destination,
        "subprocess exhausted all retries, closing bridge"
    );
    for entry in bridge.streams.iter() {
        entry.value().closed.cancel();
    }
    bridge
        .sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
    bridge.session_streams.clear();
    // Remove only this bridge: a replacement may already exist in the table.
    bridges.remove_if(&bridge.destination, |_, value| Arc::ptr_eq(value, &bridge));
}
