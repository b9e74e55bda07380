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
        clippy::items_after_statements
    )
)]

//! Feed Relay - Market Data Multiplexer
//!
//! Keeps one connection to an exchange's public market-data WebSocket and
//! fans it out to any number of downstream WebSocket clients. Clients
//! subscribe and unsubscribe independently; the relay reference-counts
//! their subscriptions so each distinct stream is requested upstream
//! exactly once, and replays them all after an upstream reconnect.
//! Point-in-time REST queries go through a rate-limited proxy.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure relay logic
//!   - `connection`: Link state machine and backoff policy
//!   - `subscription`: Subscription identity and reference-counted registry
//!   - `frame`: Upstream, client and relay frame classification
//!
//! - **Application**: Port definitions
//!   - `ports`: Upstream transport, connector and preference store
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `kraken`: WebSocket transport and rate-limited REST gateway
//!   - `upstream`: Shared link manager, link task and heartbeat
//!   - `relay`: Fan-out hub, sessions and admission control
//!   - `server`: axum WebSocket, query proxy, health and metrics
//!   - `mirror`: Reconnecting client for consumers of the relay
//!   - `preferences`: In-memory and JSON-file preference stores
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                          ┌───────────┐     ┌─────────────┐
//! Exchange WS ◄──────────► │ Upstream  │◄───►│  Relay Hub  │──► Client 1
//!   (one link)             │  Manager  │     │  (fan-out)  │──► Client 2
//!                          └───────────┘     └─────────────┘──► Client N
//! Exchange REST ◄── Rate-limited gateway ◄── /api/public/{method}
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core relay types with no I/O.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{BackoffPolicy, LinkState, LinkStateMachine, RetryDecision};
pub use domain::frame::{ClientIntent, FrameKind, RelayFrame, StatusFrame};
pub use domain::subscription::{
    Channel, SessionId, Subscription, SubscriptionChanges, SubscriptionRegistry, SubscriptionStats,
};

// Ports
pub use application::ports::{
    PreferenceError, PreferenceStore, TransportError, TransportFrame, UpstreamConnector,
    UpstreamTransport,
};

// Infrastructure config
pub use infrastructure::config::{
    BackpressurePolicy, ConfigError, RelayConfig, RestSettings, ServerSettings, UpstreamSettings,
};

// Relay hub
pub use infrastructure::relay::{
    ClientConnection, RelayError, RelayHandle, RelayHub, RelaySettings, RelaySnapshot,
};

// Upstream
pub use infrastructure::upstream::{UpstreamConfig, UpstreamError};

// Kraken adapters
pub use infrastructure::kraken::{
    GatewayConfig, GatewayError, KrakenConnector, PublicQuery, RestGateway,
};

// HTTP server
pub use infrastructure::server::{HttpServer, HttpServerError, ServerState};

// Mirror client
pub use infrastructure::mirror::{MirrorClient, MirrorConfig, MirrorError, MirrorEvent, MirrorHandle};

// Preferences
pub use infrastructure::preferences::{JsonFilePreferenceStore, MemoryPreferenceStore};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
