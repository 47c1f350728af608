//! JSON structured audit logging.
//!
//! One line per terminated request. The record carries a fixed schema rather
//! than reflecting over arbitrary attachments; optional fields are simply
//! omitted. Writes are serialized under a single process-wide lock so
//! concurrent requests never interleave lines.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use std::{
    collections::HashSet,
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::Mutex,
};
use tracing::warn;

/// Captured bodies and detection detail are truncated at this many characters.
pub const AUDIT_MAX_CHARS: usize = 32_768;

/// Default field names omitted from captured JSON bodies and headers.
pub const DEFAULT_EXCLUDED_FIELDS: &[&str] = &[
    "authorization",
    "x-api-key",
    "api_key",
    "token",
    "secret",
    "password",
];

/// Capture configuration for the audit sink.
#[derive(Debug, Clone)]
pub struct AuditOptions {
    /// Capture request/response bodies (`AUDIT_LOG_BODIES`).
    pub capture_bodies: bool,
    /// Capture request headers (`AUDIT_LOG_HEADERS`).
    pub capture_headers: bool,
    /// Field names (case-insensitive) omitted from captured JSON objects.
    pub excluded_fields: Vec<String>,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            capture_bodies: true,
            capture_headers: false,
            excluded_fields: DEFAULT_EXCLUDED_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Detection fields attached to an audit record when an engine fired.
#[derive(Debug, Clone)]
pub struct DetectionFields {
    pub action: &'static str,
    pub engine: &'static str,
    pub detail: Option<String>,
}

impl DetectionFields {
    fn severity(&self) -> u8 {
        match self.action {
            "block" => 3,
            "redact" => 2,
            "monitor" => 1,
            _ => 0,
        }
    }

    /// Pick the stricter of two optional detection outcomes. Ties go to `b`
    /// so a response-side hit supersedes an equal request-side one.
    pub fn stricter(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if b.severity() >= a.severity() { b } else { a }),
            (a, None) => a,
            (None, b) => b,
        }
    }
}

/// One proxied request, ready to be written as a JSON line.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub user: String,
    pub source_ip: String,
    pub destination: String,
    pub mcp_method: Option<String>,
    pub status_code: u16,
    pub latency_ms: f64,
    pub error: Option<String>,
    pub rpc_id: Option<Value>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub request_headers: Option<Vec<(String, String)>>,
    pub detection: Option<DetectionFields>,
}

impl RequestRecord {
    pub fn new(
        user: impl Into<String>,
        source_ip: impl Into<String>,
        destination: impl Into<String>,
        status_code: u16,
        latency_ms: f64,
    ) -> Self {
        Self {
            user: user.into(),
            source_ip: source_ip.into(),
            destination: destination.into(),
            mcp_method: None,
            status_code,
            latency_ms,
            error: None,
            rpc_id: None,
            request_body: None,
            response_body: None,
            request_headers: None,
            detection: None,
        }
    }
}

/// The audit sink. Construct once at startup and share via `Arc`.
pub struct AuditLogger {
    sink: Mutex<Box<dyn Write + Send>>,
    capture_bodies: bool,
    capture_headers: bool,
    excluded_fields: HashSet<String>,
}

impl AuditLogger {
    /// Open (or create) the audit log file in append mode, creating parent
    /// directories as needed.
    pub fn to_file(path: &Path, options: AuditOptions) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::to_writer(Box::new(file), options))
    }

    /// Wrap an arbitrary writer. Used by tests and by stderr-only setups.
    pub fn to_writer(writer: Box<dyn Write + Send>, options: AuditOptions) -> Self {
        Self {
            sink: Mutex::new(writer),
            capture_bodies: options.capture_bodies,
            capture_headers: options.capture_headers,
            excluded_fields: options
                .excluded_fields
                .iter()
                .map(|f| f.to_lowercase())
                .collect(),
        }
    }

    /// Write one structured JSON line for a proxied request.
    pub fn log(&self, record: RequestRecord) {
        let mut fields = Map::new();
        fields.insert(
            "timestamp".into(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        fields.insert("level".into(), json!("INFO"));
        fields.insert("message".into(), json!("request"));
        fields.insert("user".into(), json!(record.user));
        fields.insert("source_ip".into(), json!(record.source_ip));
        fields.insert("destination".into(), json!(record.destination));
        fields.insert("mcp_method".into(), json!(record.mcp_method));
        fields.insert("status_code".into(), json!(record.status_code));
        fields.insert(
            "latency_ms".into(),
            json!((record.latency_ms * 100.0).round() / 100.0),
        );

        if let Some(error) = record.error {
            fields.insert("error".into(), json!(error));
        }
        if let Some(rpc_id) = record.rpc_id {
            fields.insert("rpc_id".into(), rpc_id);
        }
        if let Some(detection) = record.detection {
            fields.insert("detection_action".into(), json!(detection.action));
            fields.insert("detection_engine".into(), json!(detection.engine));
            if let Some(detail) = detection.detail {
                let (detail, _) = truncate_chars(detail, AUDIT_MAX_CHARS);
                fields.insert("detection_detail".into(), json!(detail));
            }
        }

        if self.capture_bodies {
            let mut truncated = false;
            for (name, body) in [
                ("request_body", record.request_body),
                ("response_body", record.response_body),
            ] {
                let Some(body) = body else { continue };
                let body = self.redact_fields(body);
                let (body, was_truncated) = truncate_chars(body, AUDIT_MAX_CHARS);
                truncated |= was_truncated;
                fields.insert(name.into(), json!(body));
            }
            if truncated {
                fields.insert("truncated".into(), json!(true));
            }
        }

        if self.capture_headers {
            if let Some(headers) = record.request_headers {
                let captured: Map<String, Value> = headers
                    .into_iter()
                    .filter(|(name, _)| !self.excluded_fields.contains(&name.to_lowercase()))
                    .map(|(name, value)| (name, json!(value)))
                    .collect();
                fields.insert("request_headers".into(), Value::Object(captured));
            }
        }

        let line = Value::Object(fields).to_string();
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(err) = writeln!(sink, "{line}").and_then(|_| sink.flush()) {
            warn!(error = %err, "failed to write audit log line");
        }
    }

    /// Omit excluded field names from a body that parses as a JSON object.
    /// Non-object bodies are captured as-is.
    fn redact_fields(&self, body: String) -> String {
        if self.excluded_fields.is_empty() {
            return body;
        }
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&body) else {
            return body;
        };
        let filtered: Map<String, Value> = map
            .into_iter()
            .filter(|(key, _)| !self.excluded_fields.contains(&key.to_lowercase()))
            .collect();
        Value::Object(filtered).to_string()
    }
}

/// Truncate to at most `limit` characters, reporting whether anything was cut.
fn truncate_chars(s: String, limit: usize) -> (String, bool) {
    match s.char_indices().nth(limit) {
        Some((byte_idx, _)) => (s[..byte_idx].to_string(), true),
        None => (s, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Shared in-memory sink so tests can read back what was written.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn logger_with(options: AuditOptions) -> (AuditLogger, SharedBuf) {
        let buf = SharedBuf::default();
        let logger = AuditLogger::to_writer(Box::new(buf.clone()), options);
        (logger, buf)
    }

    fn read_lines(buf: &SharedBuf) -> Vec<Value> {
        let bytes = buf.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn base_record(status: u16) -> RequestRecord {
        RequestRecord::new("abcd1234", "10.0.0.1", "github", status, 42.5)
    }

    #[test]
    fn all_required_fields_present() {
        let (logger, buf) = logger_with(AuditOptions::default());
        let mut record = base_record(200);
        record.mcp_method = Some("tools/list".into());
        logger.log(record);

        let lines = read_lines(&buf);
        assert_eq!(lines.len(), 1);
        let entry = &lines[0];
        assert!(entry.get("timestamp").is_some());
        assert_eq!(entry["level"], "INFO");
        assert_eq!(entry["message"], "request");
        assert_eq!(entry["user"], "abcd1234");
        assert_eq!(entry["source_ip"], "10.0.0.1");
        assert_eq!(entry["destination"], "github");
        assert_eq!(entry["mcp_method"], "tools/list");
        assert_eq!(entry["status_code"], 200);
        assert_eq!(entry["latency_ms"], 42.5);
    }

    #[test]
    fn latency_rounded_to_two_decimals() {
        let (logger, buf) = logger_with(AuditOptions::default());
        let mut record = base_record(200);
        record.latency_ms = 1.23456;
        logger.log(record);
        assert_eq!(read_lines(&buf)[0]["latency_ms"], 1.23);
    }

    #[test]
    fn optional_fields_absent_when_unset() {
        let (logger, buf) = logger_with(AuditOptions::default());
        logger.log(base_record(200));
        let entry = &read_lines(&buf)[0];
        for field in ["error", "rpc_id", "request_body", "response_body", "detection_action"] {
            assert!(entry.get(field).is_none(), "unexpected field {field}");
        }
    }

    #[test]
    fn error_and_rpc_id_captured() {
        let (logger, buf) = logger_with(AuditOptions::default());
        let mut record = base_record(502);
        record.error = Some("Connection refused".into());
        record.rpc_id = Some(json!(42));
        logger.log(record);
        let entry = &read_lines(&buf)[0];
        assert_eq!(entry["error"], "Connection refused");
        assert_eq!(entry["rpc_id"], 42);
    }

    #[test]
    fn detection_fields_captured() {
        let (logger, buf) = logger_with(AuditOptions::default());
        let mut record = base_record(200);
        record.detection = Some(DetectionFields {
            action: "block",
            engine: "regex",
            detail: Some("injection".into()),
        });
        logger.log(record);
        let entry = &read_lines(&buf)[0];
        assert_eq!(entry["detection_action"], "block");
        assert_eq!(entry["detection_engine"], "regex");
        assert_eq!(entry["detection_detail"], "injection");
    }

    #[test]
    fn large_body_truncated_to_exactly_32768() {
        let (logger, buf) = logger_with(AuditOptions::default());
        let mut record = base_record(200);
        record.request_body = Some("x".repeat(40_000));
        logger.log(record);
        let entry = &read_lines(&buf)[0];
        assert_eq!(entry["truncated"], true);
        assert_eq!(entry["request_body"].as_str().unwrap().chars().count(), 32_768);
    }

    #[test]
    fn body_at_exact_limit_not_truncated() {
        let (logger, buf) = logger_with(AuditOptions::default());
        let mut record = base_record(200);
        record.response_body = Some("z".repeat(32_768));
        logger.log(record);
        let entry = &read_lines(&buf)[0];
        assert!(entry.get("truncated").is_none());
        assert_eq!(entry["response_body"].as_str().unwrap().chars().count(), 32_768);
    }

    #[test]
    fn bodies_omitted_when_capture_disabled() {
        let (logger, buf) = logger_with(AuditOptions {
            capture_bodies: false,
            ..AuditOptions::default()
        });
        let mut record = base_record(200);
        record.request_body = Some("some body".into());
        record.response_body = Some("other body".into());
        record.rpc_id = Some(json!(1));
        logger.log(record);
        let entry = &read_lines(&buf)[0];
        assert!(entry.get("request_body").is_none());
        assert!(entry.get("response_body").is_none());
        // rpc_id is captured regardless of the toggle.
        assert_eq!(entry["rpc_id"], 1);
    }

    #[test]
    fn sensitive_fields_omitted_from_json_bodies() {
        let (logger, buf) = logger_with(AuditOptions::default());
        let mut record = base_record(200);
        record.request_body = Some(
            json!({"method": "tools/list", "Authorization": "Bearer x", "api_key": "k"})
                .to_string(),
        );
        logger.log(record);
        let body = read_lines(&buf)[0]["request_body"].as_str().unwrap().to_string();
        let parsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["method"], "tools/list");
        assert!(parsed.get("Authorization").is_none());
        assert!(parsed.get("api_key").is_none());
    }

    #[test]
    fn non_json_body_captured_verbatim() {
        let (logger, buf) = logger_with(AuditOptions::default());
        let mut record = base_record(202);
        record.request_body = Some("not valid json at all".into());
        logger.log(record);
        assert_eq!(read_lines(&buf)[0]["request_body"], "not valid json at all");
    }

    #[test]
    fn headers_captured_with_exclusions_when_enabled() {
        let (logger, buf) = logger_with(AuditOptions {
            capture_headers: true,
            ..AuditOptions::default()
        });
        let mut record = base_record(200);
        record.request_headers = Some(vec![
            ("content-type".into(), "application/json".into()),
            ("authorization".into(), "Bearer secret".into()),
        ]);
        logger.log(record);
        let entry = &read_lines(&buf)[0];
        assert_eq!(entry["request_headers"]["content-type"], "application/json");
        assert!(entry["request_headers"].get("authorization").is_none());
    }

    #[test]
    fn headers_absent_by_default() {
        let (logger, buf) = logger_with(AuditOptions::default());
        let mut record = base_record(200);
        record.request_headers = Some(vec![("content-type".into(), "application/json".into())]);
        logger.log(record);
        assert!(read_lines(&buf)[0].get("request_headers").is_none());
    }

    #[test]
    fn concurrent_writes_produce_valid_lines() {
        let (logger, buf) = logger_with(AuditOptions::default());
        let logger = Arc::new(logger);

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let logger = logger.clone();
                std::thread::spawn(move || {
                    logger.log(RequestRecord::new(
                        format!("user{i:04}"),
                        format!("10.0.0.{}", i % 256),
                        "dest",
                        200,
                        i as f64,
                    ));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let lines = read_lines(&buf);
        assert_eq!(lines.len(), 50);
        for entry in lines {
            for field in ["timestamp", "user", "source_ip", "destination", "status_code", "latency_ms"] {
                assert!(entry.get(field).is_some(), "missing field {field}");
            }
        }
    }
}
