//! Session Supervisor Binary
//!
//! Starts the session-gated market data stream supervisor.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin session-supervisor
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `SUPERVISOR_ACCOUNT_ID`: Account whose session gates the connection
//! - `STREAM_API_KEY`: Stream API key
//! - `STREAM_TOKEN_FILE`: File holding the current access token
//!
//! ## Optional
//! - `STREAM_URL`: Stream endpoint (default: <wss://ws.kite.trade>)
//! - `SUPERVISOR_SCHEDULE_FILE`: JSON schedule document (default: built-in hours)
//! - `SUPERVISOR_INSTRUMENTS`: Comma-separated instrument tokens
//! - `SUPERVISOR_SUBSCRIPTION_MODE`: ltp | quote | full (default: full)
//! - `SUPERVISOR_POLL_INTERVAL_SECS`: Supervisor poll interval (default: 30)
//! - `SUPERVISOR_TIMEZONE`: Exchange timezone (default: Asia/Kolkata)
//! - `SUPERVISOR_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use session_supervisor::infrastructure::telemetry;
use session_supervisor::{
    ConnectionManager, FileAuthenticator, HealthServer, HealthServerState, InMemoryScheduleStore,
    ScheduleKind, ScheduleResolver, SessionSupervisor, SubscriptionRegistry, SupervisorConfig,
    SystemClock, TickBroadcast, WebSocketTransport, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Session Supervisor");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = SupervisorConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Schedule
    let store = match &config.schedule_file {
        Some(path) => InMemoryScheduleStore::from_json_file(path)
            .await
            .with_context(|| format!("loading schedule from {}", path.display()))?,
        None => InMemoryScheduleStore::with_defaults(),
    };
    let resolver = Arc::new(ScheduleResolver::new(Arc::new(store), ScheduleKind::Market));

    // Credentials
    let authenticator = Arc::new(FileAuthenticator::new(&config.token_file));

    // Subscriptions replayed on every connect
    let registry = Arc::new(SubscriptionRegistry::new());
    registry.add(config.instruments.iter().copied(), config.subscription_mode);

    // Connection
    let (event_tx, event_rx) = mpsc::channel(config.channels.event_capacity);
    let transport = Arc::new(WebSocketTransport::new(config.stream.clone()));
    let manager = Arc::new(ConnectionManager::new(
        config.account.clone(),
        transport,
        authenticator.clone(),
        registry,
        event_tx,
    ));

    // Downstream tick fan-out
    let ticks = Arc::new(TickBroadcast::new(config.channels.tick_capacity));
    manager.register_tick_consumer(ticks.clone());

    // Supervisor
    let supervisor = Arc::new(SessionSupervisor::new(
        resolver,
        Arc::clone(&manager),
        authenticator,
        Arc::new(SystemClock),
        config.supervisor,
        shutdown_token.child_token(),
    ));

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&supervisor),
        Arc::clone(&ticks),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    // Spawn event pump
    let pump = tokio::spawn(Arc::clone(&manager).process_events(event_rx, shutdown_token.clone()));

    // Spawn supervisor loop
    let supervisor_task = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.run().await })
    };

    // Spawn health server
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!(account = %config.account, "Session supervisor ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, supervisor_task)
        .await
        .is_err()
    {
        tracing::warn!("Supervisor did not stop within the shutdown timeout");
    }
    pump.abort();

    tracing::info!("Session supervisor stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &SupervisorConfig) {
    tracing::info!(
        account = %config.account,
        instruments = config.instruments.len(),
        mode = config.subscription_mode.as_str(),
        poll_interval_secs = config.supervisor.poll_interval.as_secs(),
        timezone = %config.supervisor.timezone,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        stream_url = %config.stream.url,
        token_file = %config.token_file.display(),
        schedule_file = ?config.schedule_file,
        "Stream endpoints"
    );
}

/// Load .env file from any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
