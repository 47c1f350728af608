//! Shared helpers for proxy integration tests: an in-process server on an
//! ephemeral port, an inspectable audit sink, and executable script fixtures
//! standing in for stdio MCP servers.

#![allow(dead_code)]

use palisade_core::detector::{Detector, DetectorOptions, PatternStore};
use palisade_core::{
    AuditLogger, AuditOptions, DestinationConfig, DestinationTable, SecretsStore,
};
use palisade_proxy::{AppState, SharedState, router};
use serde_json::Value;
use std::{
    io::Write,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::task::JoinHandle;

/// In-memory audit sink shared between the logger and the assertions.
#[derive(Clone, Default)]
pub struct SharedAuditBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedAuditBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedAuditBuf {
    pub fn lines(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).expect("audit line must be valid JSON"))
            .collect()
    }
}

pub struct TestServer {
    pub base_url: String,
    pub state: SharedState,
    pub audit: SharedAuditBuf,
    handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct TestServerOptions {
    pub destinations: Vec<DestinationConfig>,
    pub patterns_dir: Option<PathBuf>,
    pub secrets: SecretsStore,
    pub max_stdio_connections: usize,
    pub stdio_response_timeout: Duration,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            patterns_dir: None,
            secrets: SecretsStore::default(),
            max_stdio_connections: 10,
            stdio_response_timeout: Duration::from_secs(10),
        }
    }
}

/// Serve the full proxy router on 127.0.0.1:0 and return its address.
pub async fn spawn_server(options: TestServerOptions) -> TestServer {
    let audit_buf = SharedAuditBuf::default();
    let audit = Arc::new(AuditLogger::to_writer(
        Box::new(audit_buf.clone()),
        AuditOptions::default(),
    ));

    let patterns = Arc::new(PatternStore::new(
        options
            .patterns_dir
            .unwrap_or_else(|| PathBuf::from("/nonexistent/patterns.d")),
    ));
    patterns.reload();
    let detector = Arc::new(Detector::new(patterns, DetectorOptions::default()));

    let state = AppState::new(
        DestinationTable::from_destinations(options.destinations),
        options.secrets,
        detector,
        audit,
        options.max_stdio_connections,
        options.stdio_response_timeout,
    );

    let app = router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestServer {
        base_url: format!("http://{addr}"),
        state,
        audit: audit_buf,
        handle,
    }
}

pub async fn spawn_server_with(destinations: Vec<DestinationConfig>) -> TestServer {
    spawn_server(TestServerOptions {
        destinations,
        ..TestServerOptions::default()
    })
    .await
}

/// Write an executable `#!/bin/sh` fixture into `dir`.
pub fn write_script(dir: &Path, name: &str, contents: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");
    path
}

/// Subprocess that echoes each stdin line back verbatim. `/bin/cat` is the
/// simplest possible conforming MCP echo server.
pub fn echo_destination(name: &str) -> DestinationConfig {
    DestinationConfig::stdio(name, "/bin/cat")
}

/// Script that emits a `notifications/test` notification before echoing every
/// request after the first.
pub fn notification_script(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "notif_mcp.sh",
        "#!/bin/sh\n\
         count=0\n\
         while IFS= read -r line; do\n\
         \tcount=$((count+1))\n\
         \tif [ \"$count\" -gt 1 ]; then\n\
         \t\tprintf '%s\\n' '{\"jsonrpc\":\"2.0\",\"method\":\"notifications/test\",\"params\":{}}'\n\
         \tfi\n\
         \tprintf '%s\\n' \"$line\"\n\
         done\n",
    )
}

/// Script that answers exactly one request, then exits.
pub fn one_shot_script(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "oneshot_mcp.sh",
        "#!/bin/sh\nIFS= read -r line || exit 0\nprintf '%s\\n' \"$line\"\nexit 0\n",
    )
}

/// Script that consumes stdin forever without ever responding.
pub fn silent_script(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "silent_mcp.sh",
        "#!/bin/sh\nwhile IFS= read -r line; do :; done\n",
    )
}

pub fn is_uuid4(value: &str) -> bool {
    let re = regex::Regex::new(
        r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$",
    )
    .unwrap();
    re.is_match(value)
}

/// Audit lines written by HTTP handlers (the stdout dispatcher logs with
/// source_ip "localhost"; filter those out when counting request lines).
pub fn handler_audit_lines(audit: &SharedAuditBuf) -> Vec<Value> {
    audit
        .lines()
        .into_iter()
        .filter(|l| l["source_ip"] != "localhost")
        .collect()
}
