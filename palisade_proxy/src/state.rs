//! Process-wide shared state.
//!
//! Startup constructs one [`AppState`] and hands it to the router; shutdown
//! drains it. There are no module-level mutable registries: the bridge table,
//! the legacy stdio session registry, and the relay session map all live here.

use crate::bridge::BridgeTable;
use crate::relay::RelaySessionMap;
use crate::sse_bridge::SseSessionRegistry;
use palisade_core::{AuditLogger, DestinationTable, Detector, SecretsStore};
use std::{collections::HashMap, sync::Arc, time::Duration};

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub destinations: DestinationTable,
    pub secrets: SecretsStore,
    pub detector: Arc<Detector>,
    pub audit: Arc<AuditLogger>,
    pub bridges: Arc<BridgeTable>,
    pub sse_sessions: Arc<SseSessionRegistry>,
    pub relay_sessions: Arc<RelaySessionMap>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(
        destinations: DestinationTable,
        secrets: SecretsStore,
        detector: Arc<Detector>,
        audit: Arc<AuditLogger>,
        max_stdio_connections: usize,
        stdio_response_timeout: Duration,
    ) -> SharedState {
        let bridges = Arc::new(BridgeTable::new(
            audit.clone(),
            detector.clone(),
            max_stdio_connections,
            stdio_response_timeout,
        ));
        let sse_sessions = Arc::new(SseSessionRegistry::new(
            audit.clone(),
            detector.clone(),
        ));
        Arc::new(Self {
            destinations,
            secrets,
            detector,
            audit,
            bridges,
            sse_sessions,
            relay_sessions: Arc::new(RelaySessionMap::new()),
            http: reqwest::Client::new(),
        })
    }

    /// Scrubbed environment for a destination's subprocess: allowlisted parent
    /// keys, the destination's configured env, then the secrets overlay.
    pub fn subprocess_env(
        &self,
        dest: &palisade_core::DestinationConfig,
    ) -> HashMap<String, String> {
        let mut extra = dest.env.clone();
        extra.extend(self.secrets.destination_env(&dest.name));
        palisade_core::command::subprocess_env(&extra)
    }
}
