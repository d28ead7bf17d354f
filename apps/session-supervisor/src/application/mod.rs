//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (schedule store, authenticator, transport).
pub mod ports;

/// Application services for schedule resolution and connection supervision.
pub mod services;
