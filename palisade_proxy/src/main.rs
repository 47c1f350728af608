use anyhow::Context;
use clap::Parser;
use palisade_core::detector::{Detector, DetectorOptions, PatternStore};
use palisade_core::{AuditLogger, AuditOptions, DestinationTable, SecretsStore, command};
use palisade_proxy::{AppState, router};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Security-aware reverse proxy for MCP servers.
///
/// Fronts SSE, Streamable HTTP, and stdio-subprocess destinations behind one
/// HTTP surface, with bidirectional prompt-injection detection and a JSON
/// audit log of every proxied request.
#[derive(Parser, Debug)]
#[command(name = "palisade_proxy")]
#[command(version, about)]
struct Args {
    /// Address to bind the HTTP listener.
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind_addr: SocketAddr,

    /// Destinations config file (YAML).
    #[arg(long, env = "DESTINATIONS_CONFIG", default_value = "config/destinations.yml")]
    destinations_config: PathBuf,

    /// Optional per-destination secrets file (YAML).
    #[arg(long, env = "SECRETS_CONFIG", default_value = "config/secrets.yml")]
    secrets_config: PathBuf,

    /// Directory of line-oriented regex pattern files.
    #[arg(long, env = "PATTERNS_DIR", default_value = "/etc/palisade/patterns.d")]
    patterns_dir: PathBuf,

    /// Audit log file, one JSON line per request.
    #[arg(long, env = "LOG_FILE", default_value = "/var/log/palisade/proxy.log")]
    log_file: PathBuf,

    /// Per-destination cap on concurrent stdio sessions.
    #[arg(long, env = "MAX_STDIO_CONNECTIONS", default_value_t = 10)]
    max_stdio_connections: usize,

    /// Seconds to wait for a subprocess response before returning 504.
    #[arg(long, env = "STDIO_RESPONSE_TIMEOUT_SECS", default_value_t = 30)]
    stdio_response_timeout_secs: u64,

    /// Global AI detection threshold (per-destination overrides win).
    #[arg(long, env = "AI_INJECTION_THRESHOLD", default_value_t = 0.85)]
    ai_injection_threshold: f64,

    /// Maximum concurrent AI classifier invocations.
    #[arg(long, env = "AI_MAX_WORKERS", default_value_t = 1)]
    ai_max_workers: usize,

    /// Capture request/response bodies in the audit log.
    #[arg(long, env = "AUDIT_LOG_BODIES", default_value_t = true, action = clap::ArgAction::Set)]
    audit_log_bodies: bool,

    /// Capture request headers in the audit log.
    #[arg(long, env = "AUDIT_LOG_HEADERS", default_value_t = false, action = clap::ArgAction::Set)]
    audit_log_headers: bool,

    /// Comma-separated field names omitted from captured bodies and headers.
    #[arg(long, env = "EXCLUDED_LOG_FIELDS", value_delimiter = ',')]
    excluded_log_fields: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Startup order matters: destinations and secrets before command
    // validation (secrets may supply the env the command needs), the audit
    // sink before the first proxied request, patterns before the detector.
    let destinations = DestinationTable::load(&args.destinations_config)
        .with_context(|| format!("loading {}", args.destinations_config.display()))?;
    let secrets = SecretsStore::load(&args.secrets_config)
        .with_context(|| format!("loading {}", args.secrets_config.display()))?;

    let mut audit_options = AuditOptions {
        capture_bodies: args.audit_log_bodies,
        capture_headers: args.audit_log_headers,
        ..AuditOptions::default()
    };
    if let Some(fields) = args.excluded_log_fields {
        audit_options.excluded_fields = fields;
    }
    let audit = Arc::new(
        AuditLogger::to_file(&args.log_file, audit_options)
            .with_context(|| format!("opening {}", args.log_file.display()))?,
    );

    let patterns = Arc::new(PatternStore::new(&args.patterns_dir));
    patterns.reload();
    let detector = Arc::new(Detector::new(
        patterns.clone(),
        DetectorOptions {
            classifier: None,
            default_threshold: args.ai_injection_threshold,
            max_workers: args.ai_max_workers,
        },
    ));

    // Fail fast: every stdio destination's executable must resolve on PATH.
    command::validate_stdio_commands(&destinations)?;

    let state = AppState::new(
        destinations,
        secrets,
        detector,
        audit,
        args.max_stdio_connections,
        Duration::from_secs(args.stdio_response_timeout_secs),
    );

    spawn_sighup_reload(patterns);

    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(args.bind_addr)
        .await
        .with_context(|| format!("binding {}", args.bind_addr))?;
    info!("palisade proxy listening on http://{}", args.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Shutdown: terminate all managed stdio subprocesses.
    state.bridges.shutdown_all().await;
    state.sse_sessions.shutdown_all().await;
    Ok(())
}

/// Reload regex patterns on SIGHUP without a restart. Registered through the
/// runtime's signal stream, never a synchronous handler: the reload takes the
/// pattern lock and must not run on an arbitrary stack.
#[cfg(unix)]
fn spawn_sighup_reload(patterns: Arc<PatternStore>) {
    tokio::spawn(async move {
        let Ok(mut hangup) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            return;
        };
        while hangup.recv().await.is_some() {
            let loaded = patterns.reload();
            info!(loaded, "patterns reloaded on SIGHUP");
        }
    });
}

#[cfg(not(unix))]
fn spawn_sighup_reload(_patterns: Arc<PatternStore>) {}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
