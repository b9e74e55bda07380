//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports, the relay hub that
//! ties them together, and the HTTP surface in front of it.

/// Environment configuration.
pub mod config;

/// Kraken WebSocket transport and rate-limited REST gateway.
pub mod kraken;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Reconnecting relay client.
pub mod mirror;

/// Preference store implementations.
pub mod preferences;

/// Client fan-out hub and sessions.
pub mod relay;

/// HTTP server: WebSocket, query proxy, health and metrics.
pub mod server;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Shared upstream link: lifecycle, reconnect and heartbeat.
pub mod upstream;
