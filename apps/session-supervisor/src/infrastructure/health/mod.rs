//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, session and connection status, and
//! Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (connection matches the schedule)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, NaiveTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{ConnectionStats, SessionSupervisor};
use crate::domain::connection::ConnectionState;
use crate::domain::schedule::{SessionWindow, WindowSource};
use crate::infrastructure::broadcast::{BroadcastStats, SharedTickBroadcast};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Supervisor version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Supervised account.
    pub account: String,
    /// Connection state.
    pub state: ConnectionState,
    /// Whether the schedule says the session is active.
    pub should_be_open: bool,
    /// Last resolved session window.
    pub window: Option<WindowInfo>,
    /// Instruments in the subscription registry.
    pub subscriptions: usize,
    /// Connection counters.
    pub connection: ConnectionStats,
    /// Tick broadcast counters.
    pub broadcast: BroadcastStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Connection state matches the schedule.
    Healthy,
    /// Converging: connecting, re-authenticating or closing.
    Degraded,
    /// Session is active but nothing is connected.
    Unhealthy,
}

/// Serializable view of a session window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowInfo {
    /// Whether the date is a trading day.
    pub is_open: bool,
    /// Session start.
    pub start: Option<NaiveTime>,
    /// Session end.
    pub end: Option<NaiveTime>,
    /// Fallback level that matched.
    pub source: WindowSource,
    /// Whether an account-specific entry matched.
    pub account_specific: bool,
}

impl From<SessionWindow> for WindowInfo {
    fn from(window: SessionWindow) -> Self {
        Self {
            is_open: window.is_open,
            start: window.start,
            end: window.end,
            source: window.source,
            account_specific: window.account_specific,
        }
    }
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    supervisor: Arc<SessionSupervisor>,
    ticks: SharedTickBroadcast,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        supervisor: Arc<SessionSupervisor>,
        ticks: SharedTickBroadcast,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            supervisor,
            ticks,
        }
    }

    /// Build the current health report.
    #[must_use]
    pub fn report(&self) -> HealthResponse {
        let manager = self.supervisor.manager();
        let state = manager.current_state();
        let should_be_open = self.supervisor.should_be_open();

        HealthResponse {
            status: determine_health_status(should_be_open, state),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            account: self.supervisor.account().to_string(),
            state,
            should_be_open,
            window: self.supervisor.current_window().map(WindowInfo::from),
            subscriptions: manager.registry().len(),
            connection: manager.stats(),
            broadcast: self.ticks.stats(),
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = state.report();
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = state.report();

    if is_ready(response.should_be_open, response.state) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

/// Ready when the connection state matches what the schedule asks for.
const fn is_ready(should_be_open: bool, state: ConnectionState) -> bool {
    matches!(
        (should_be_open, state),
        (true, ConnectionState::Open) | (false, ConnectionState::Closed)
    )
}

const fn determine_health_status(should_be_open: bool, state: ConnectionState) -> HealthStatus {
    if is_ready(should_be_open, state) {
        return HealthStatus::Healthy;
    }
    match (should_be_open, state) {
        (true, ConnectionState::Closed) => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
