//! # Palisade Proxy
//!
//! A security-aware reverse proxy that fronts upstream Model Context Protocol
//! (MCP) servers for client AI agents, normalizing three transport flavors
//! behind one HTTP surface:
//!
//! *   **SSE upstreams**: GET event stream + POST message endpoint pair,
//!     relayed with endpoint-event rewriting and bounded retries.
//! *   **Streamable HTTP upstreams**: single POST/GET/DELETE endpoint keyed
//!     by the `Mcp-Session-Id` header, relayed thinly.
//! *   **stdio subprocesses**: newline-delimited JSON-RPC children multiplexed
//!     behind the streamable HTTP surface by a per-destination bridge.
//!
//! Every proxied message passes through bidirectional prompt-injection
//! detection, and every request emits one structured JSON audit record.

/// Per-destination stdio subprocess bridge (streamable HTTP flavor).
pub mod bridge;
/// Error types for bridge and relay operations.
pub mod error;
/// HTTP surface: routing, handlers, and shared request context.
pub mod http;
/// HTTP-upstream relays for SSE and streamable destinations.
pub mod relay;
/// Legacy per-connection stdio bridge (SSE flavor).
pub mod sse_bridge;
/// Process-wide shared state.
pub mod state;

pub use bridge::BridgeTable;
pub use error::{BridgeError, Result};
pub use http::{RequestCtx, router};
pub use relay::RelaySessionMap;
pub use sse_bridge::SseSessionRegistry;
pub use state::{AppState, SharedState};
