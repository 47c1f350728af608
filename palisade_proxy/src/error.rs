//! Error types for the proxy

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("subprocess error: {0}")]
    Subprocess(String),

    #[error("communication error: {0}")]
    Communication(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Upstream relay failures, distinct from bridge failures so handlers can map
/// them onto 502 responses with the upstream detail preserved.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("upstream returned {0}")]
    UpstreamStatus(u16),

    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
}
