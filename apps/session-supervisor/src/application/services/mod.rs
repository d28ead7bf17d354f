//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `ScheduleResolver`: resolves and caches session windows
//! - `ConnectionManager`: owns the single stream connection
//! - `SessionSupervisor`: polls the schedule and drives the connection

/// Stream connection lifecycle.
pub mod connection_manager;

/// Session window resolution with per-date caching.
pub mod schedule_resolver;

/// Schedule-driven control loop.
pub mod session_supervisor;

pub use connection_manager::{ConnError, ConnectionManager, ConnectionStats};
pub use schedule_resolver::ScheduleResolver;
pub use session_supervisor::{
    DEFAULT_POLL_INTERVAL, DEFAULT_TIMEZONE, SessionSupervisor, SupervisorAction,
    SupervisorSettings,
};
