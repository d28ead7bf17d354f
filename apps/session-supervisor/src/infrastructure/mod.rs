//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// File-backed access token provider.
pub mod auth;

/// Broadcast channel for tick distribution.
pub mod broadcast;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Schedule store adapters.
pub mod schedule;

/// WebSocket market data transport.
pub mod stream;

/// OpenTelemetry tracing integration.
pub mod telemetry;
