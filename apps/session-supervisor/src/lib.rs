#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Session Supervisor - Market-Session-Gated Stream Connection
//!
//! Keeps exactly one market data stream connection per account open while
//! that account's trading session is active, closes it outside the session,
//! reconnects after failures and re-authenticates when the access token is
//! rejected.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and rules
//!   - `schedule`: Schedule entries and window resolution
//!   - `subscription`: Instrument registry replayed on connect
//!   - `connection`: Connection states, credentials, handles
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Schedule store, authenticator, transport, tick consumer
//!   - `services`: Schedule resolver, connection manager, supervisor
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `stream`: WebSocket transport and wire codec
//!   - `auth`: File-backed access token provider
//!   - `schedule`: In-memory / JSON schedule store
//!   - `broadcast`: Tick fan-out to downstream receivers
//!   - `health`: Health check HTTP endpoint
//!
//! # Control Flow
//!
//! ```text
//!  ┌─────────────┐ poll ┌──────────────────┐ open/close ┌───────────────────┐
//!  │  Schedule   │◄─────│ SessionSupervisor│───────────►│ ConnectionManager │
//!  │  Resolver   │      └──────────────────┘            └─────────┬─────────┘
//!  └─────────────┘                                      connect   │  ▲ events
//!                                                                 ▼  │
//!                                                       ┌───────────────────┐
//!                                     ticks ◄───────────│ WebSocketTransport│
//!                                                       └───────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Schedule, subscription and connection types.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{
    ConnectionState, Credential, DisconnectReason, HandleId, StateChange, TransportHandle,
};
pub use domain::schedule::{
    AccountId, ScheduleEntry, ScheduleError, ScheduleKind, ScheduleScope, SessionWindow,
    WindowSource, resolve_window, validate_entries,
};
pub use domain::subscription::{
    InstrumentId, SubscriptionChanges, SubscriptionMode, SubscriptionRegistry, SubscriptionSet,
};

// Ports
pub use application::ports::{
    Authenticator, AuthenticatorError, Clock, ScheduleStore, ScheduleStoreError, StreamTransport,
    SystemClock, Tick, TickConsumer, TransportError, TransportEvent, TransportEventSender,
};

// Services
pub use application::services::{
    ConnError, ConnectionManager, ConnectionStats, ScheduleResolver, SessionSupervisor,
    SupervisorAction, SupervisorSettings,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, SupervisorConfig};

// Adapters
pub use infrastructure::auth::FileAuthenticator;
pub use infrastructure::broadcast::{BroadcastStats, SharedTickBroadcast, TickBroadcast};
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::schedule::{InMemoryScheduleStore, ScheduleLoadError};
pub use infrastructure::stream::WebSocketTransport;

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
