//! Domain Layer - Core schedule, subscription and connection types.
//!
//! This layer contains the pure types and rules of the supervisor with no
//! I/O. Everything here is synchronous and deterministic.

/// Connection state machine, credentials and transport handles.
pub mod connection;

/// Trading schedule entries and session window resolution.
pub mod schedule;

/// Instrument subscription registry.
pub mod subscription;
