//! Tests for the HTTP-upstream relays: SSE endpoint rewriting, message
//! forwarding with retries, the streamable thin relay, and the admin surface.

mod common;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::Request;
use common::*;
use futures::StreamExt;
use palisade_core::DestinationConfig;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

/// A raw SSE upstream that sends an endpoint event and then holds the
/// connection open, the way a real MCP SSE server does.
async fn raw_sse_upstream(endpoint_data: String) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let endpoint_data = endpoint_data.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\nevent: endpoint\ndata: {endpoint_data}\n\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.flush().await;
                // Hold the stream open like a live SSE upstream.
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });
    addr
}

/// Read the relayed SSE stream until the endpoint frame arrives.
async fn read_until(
    stream: &mut (impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin),
    needle: &str,
) -> String {
    let mut collected = String::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = stream.next().await {
            collected.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if collected.contains(needle) {
                break;
            }
        }
    })
    .await
    .expect("frame within 5s");
    collected
}

#[tokio::test]
async fn health_returns_ok() {
    let server = spawn_server_with(vec![]).await;
    let resp = client()
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn sse_unknown_destination_returns_404() {
    let server = spawn_server_with(vec![]).await;
    let resp = client()
        .get(format!("{}/nonexistent/sse", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("nonexistent"));
}

#[tokio::test]
async fn endpoint_event_rewritten_and_message_forwarded() {
    let upstream_messages = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(query_param("sessionId", "abc123"))
        .and(header("authorization", "Bearer mytoken123"))
        .and(body_string_contains("tools/list"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("keep-alive", "timeout=5")
                .set_body_json(json!({"accepted": true})),
        )
        .expect(1)
        .mount(&upstream_messages)
        .await;

    // The endpoint event announces a full URL at the message upstream.
    let endpoint_data = format!("{}/messages?sessionId=abc123", upstream_messages.uri());
    let sse_addr = raw_sse_upstream(endpoint_data).await;

    let server = spawn_server_with(vec![DestinationConfig::sse(
        "updest",
        format!("http://{sse_addr}"),
    )])
    .await;

    let resp = client()
        .get(format!("{}/updest/sse", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(
        resp.headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("text/event-stream")
    );
    let mut stream = Box::pin(resp.bytes_stream());
    let collected = read_until(&mut stream, "session_id=").await;

    // Round-trip law: the rewritten frame parses back to our message path.
    assert!(collected.contains("event: endpoint"), "stream: {collected}");
    assert!(
        collected.contains("data: /updest/message?session_id=abc123"),
        "stream: {collected}"
    );

    // POST through the announced proxy endpoint while the stream is open.
    let resp = client()
        .post(format!(
            "{}/updest/message?session_id=abc123",
            server.base_url
        ))
        .header("authorization", "Bearer mytoken123")
        .json(&json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    // Hop-by-hop headers from the upstream response are stripped.
    assert!(resp.headers().get("keep-alive").is_none());

    let lines = handler_audit_lines(&server.audit);
    let entry = lines
        .iter()
        .find(|l| l["mcp_method"] == "tools/list")
        .expect("message POST audit line");
    assert_eq!(entry["rpc_id"], 7);
    assert_eq!(entry["status_code"], 202);
    assert!(entry["request_body"].as_str().unwrap().contains("tools/list"));
}

#[tokio::test]
async fn message_without_session_param_returns_400() {
    let server =
        spawn_server_with(vec![DestinationConfig::sse("updest", "http://127.0.0.1:1")]).await;
    let resp = client()
        .post(format!("{}/updest/message", server.base_url))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn message_unknown_session_returns_404() {
    let server =
        spawn_server_with(vec![DestinationConfig::sse("updest", "http://127.0.0.1:1")]).await;
    let resp = client()
        .post(format!(
            "{}/updest/message?session_id=does-not-exist",
            server.base_url
        ))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn message_with_non_json_body_forwarded_unchanged() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/msg"))
        .and(body_string_contains("not valid json at all"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&upstream)
        .await;

    let server =
        spawn_server_with(vec![DestinationConfig::sse("updest", "http://127.0.0.1:1")]).await;
    server
        .state
        .relay_sessions
        .register("sess-raw", format!("{}/msg?sessionId=raw", upstream.uri()));

    let resp = client()
        .post(format!(
            "{}/updest/message?session_id=sess-raw",
            server.base_url
        ))
        .header("content-type", "application/octet-stream")
        .body("not valid json at all")
        .send()
        .await
        .unwrap();
    // Legacy /message forwards undecodable bytes unchanged.
    assert_eq!(resp.status(), 202);

    let lines = handler_audit_lines(&server.audit);
    let entry = lines.last().unwrap();
    assert_eq!(entry["request_body"], "not valid json at all");
    assert_eq!(entry["mcp_method"], Value::Null);
}

#[tokio::test]
async fn streamable_post_forwarded_with_headers() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header("authorization", "Bearer testtoken1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("mcp-session-id", "11111111-1111-4111-8111-111111111111")
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}})),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let server = spawn_server_with(vec![DestinationConfig::streamable_http(
        "mcpdest",
        format!("{}/mcp", upstream.uri()),
    )])
    .await;

    let resp = client()
        .post(format!("{}/mcpdest/mcp", server.base_url))
        .header("authorization", "Bearer testtoken1")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    // Session header from the upstream passes back through.
    assert_eq!(
        resp.headers().get("mcp-session-id").unwrap(),
        "11111111-1111-4111-8111-111111111111"
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["tools"], json!([]));

    let lines = handler_audit_lines(&server.audit);
    let entry = lines.last().unwrap();
    assert_eq!(entry["mcp_method"], "tools/list");
    assert_eq!(entry["rpc_id"], 1);
    assert!(entry["response_body"].as_str().unwrap().contains("tools"));
    // The bearer token itself never lands in the audit log.
    assert!(!entry.to_string().contains("testtoken1"));
}

#[tokio::test]
async fn streamable_post_rejects_invalid_json() {
    let server = spawn_server_with(vec![DestinationConfig::streamable_http(
        "mcpdest",
        "http://127.0.0.1:1/mcp",
    )])
    .await;
    let resp = client()
        .post(format!("{}/mcpdest/mcp", server.base_url))
        .header("content-type", "application/json")
        .body("this is not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn streamable_4xx_not_retried() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "unauthorized"})))
        .expect(1)
        .mount(&upstream)
        .await;

    let server = spawn_server_with(vec![DestinationConfig::streamable_http(
        "mcpdest",
        format!("{}/mcp", upstream.uri()),
    )])
    .await;

    let resp = client()
        .post(format!("{}/mcpdest/mcp", server.base_url))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn streamable_5xx_retried_then_502() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&upstream)
        .await;

    let server = spawn_server_with(vec![DestinationConfig::streamable_http(
        "mcpdest",
        format!("{}/mcp", upstream.uri()),
    )])
    .await;

    let resp = client()
        .post(format!("{}/mcpdest/mcp", server.base_url))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Upstream unreachable");
}

#[tokio::test]
async fn streamable_connect_error_returns_502() {
    // Nothing listens on the reserved port; connects are refused fast.
    let server = spawn_server_with(vec![DestinationConfig::streamable_http(
        "mcpdest",
        "http://127.0.0.1:1/mcp",
    )])
    .await;

    let resp = client()
        .post(format!("{}/mcpdest/mcp", server.base_url))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);

    let lines = handler_audit_lines(&server.audit);
    let entry = lines.last().unwrap();
    assert_eq!(entry["status_code"], 502);
    assert!(entry.get("error").is_some());
}

#[tokio::test]
async fn streamable_get_relays_sse_bytes() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(
                    "event: endpoint\ndata: /mcp\n\n".as_bytes().to_vec(),
                    "text/event-stream",
                ),
        )
        .mount(&upstream)
        .await;

    let server = spawn_server_with(vec![DestinationConfig::streamable_http(
        "mcpdest",
        format!("{}/mcp", upstream.uri()),
    )])
    .await;

    let resp = client()
        .get(format!("{}/mcpdest/mcp", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(
        resp.headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("text/event-stream")
    );
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], b"event: endpoint\ndata: /mcp\n\n");
}

#[tokio::test]
async fn streamable_get_upstream_4xx_passthrough() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "unauthorized"})))
        .mount(&upstream)
        .await;

    let server = spawn_server_with(vec![DestinationConfig::streamable_http(
        "mcpdest",
        format!("{}/mcp", upstream.uri()),
    )])
    .await;

    let resp = client()
        .get(format!("{}/mcpdest/mcp", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn streamable_delete_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/mcp"))
        .and(header("mcp-session-id", "22222222-2222-4222-8222-222222222222"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&upstream)
        .await;

    let server = spawn_server_with(vec![DestinationConfig::streamable_http(
        "mcpdest",
        format!("{}/mcp", upstream.uri()),
    )])
    .await;

    let resp = client()
        .delete(format!("{}/mcpdest/mcp", server.base_url))
        .header("mcp-session-id", "22222222-2222-4222-8222-222222222222")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}

#[tokio::test]
async fn sse_destination_rejects_mcp_endpoint() {
    let server =
        spawn_server_with(vec![DestinationConfig::sse("ssedest", "http://127.0.0.1:1")]).await;
    for request in [
        client().post(format!("{}/ssedest/mcp", server.base_url)).json(&json!({"id": 1})),
        client().get(format!("{}/ssedest/mcp", server.base_url)),
        client().delete(format!("{}/ssedest/mcp", server.base_url)),
    ] {
        let resp = request.send().await.unwrap();
        assert_eq!(resp.status(), 400);
    }
}

// --- admin surface ---

async fn admin_router(patterns_dir: &std::path::Path, peer: SocketAddr) -> axum::Router {
    use palisade_core::detector::{Detector, DetectorOptions, PatternStore};
    use palisade_core::{AuditLogger, AuditOptions, DestinationTable, SecretsStore};
    use std::sync::Arc;

    let patterns = Arc::new(PatternStore::new(patterns_dir));
    let detector = Arc::new(Detector::new(patterns, DetectorOptions::default()));
    let audit = Arc::new(AuditLogger::to_writer(
        Box::new(SharedAuditBuf::default()),
        AuditOptions::default(),
    ));
    let state = palisade_proxy::AppState::new(
        DestinationTable::from_destinations(vec![]),
        SecretsStore::default(),
        detector,
        audit,
        10,
        Duration::from_secs(5),
    );
    palisade_proxy::router(state).layer(MockConnectInfo(peer))
}

#[tokio::test]
async fn admin_reload_from_localhost_returns_count() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("rules.txt"), "injection\n").unwrap();

    let app = admin_router(dir.path(), SocketAddr::from(([127, 0, 0, 1], 54321))).await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/reload-patterns")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({"loaded": 1}));
}

#[tokio::test]
async fn admin_reload_blocked_from_remote() {
    let dir = TempDir::new().unwrap();
    let app = admin_router(dir.path(), SocketAddr::from(([192, 168, 1, 100], 54321))).await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/reload-patterns")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}
