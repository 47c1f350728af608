//! # Palisade Core
//!
//! Shared building blocks for the palisade MCP reverse proxy:
//!
//! *   **Destination config**: YAML-backed table of upstream destinations
//!     (`sse`, `streamable_http`, `stdio`) with per-destination detection
//!     modes, validated fully at load time.
//! *   **Secrets**: optional per-destination environment overlays that reach
//!     subprocesses without ever passing through the parent environment.
//! *   **Command handling**: shell-style word splitting without a shell,
//!     metacharacter rejection, fail-fast PATH resolution, and scrubbed
//!     subprocess environments built from an allowlist.
//! *   **Detection**: hot-reloadable regex pattern store plus an opaque
//!     classifier capability, arbitrated by strictest-mode-wins.
//! *   **Audit**: one structured JSON line per proxied request with body
//!     capture, truncation, and field redaction.

/// JSON-line audit logging for proxied requests.
pub mod audit;
/// Subprocess command parsing and environment scrubbing.
pub mod command;
/// Destination configuration loading and validation.
pub mod config;
/// Prompt-injection detection engines and arbitration.
pub mod detector;
/// Error types shared across the core.
pub mod error;
/// Per-destination secret overlays.
pub mod secrets;

pub use audit::{AuditLogger, AuditOptions, RequestRecord};
pub use config::{
    DestinationConfig, DestinationKind, DestinationTable, DetectionConfig, DetectionMode,
};
pub use detector::{Classification, Classifier, DetectionAction, DetectionResult, Detector,
    PatternStore};
pub use error::{CoreError, Result};
pub use secrets::SecretsStore;
