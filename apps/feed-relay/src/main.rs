//! Feed Relay Binary
//!
//! Starts the market data relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin feed-relay
//! ```
//!
//! # Environment Variables
//!
//! - `RELAY_PORT`: HTTP/WebSocket port (default: 8080)
//! - `RELAY_MAX_CLIENTS`: Concurrent client limit (default: 20)
//! - `RELAY_CLIENT_QUEUE_CAPACITY`: Per-client outbound queue (default: 256)
//! - `RELAY_BACKPRESSURE`: drop | disconnect (default: drop)
//! - `RELAY_UPSTREAM_WS_URL`: Upstream feed (default: <wss://ws.kraken.com>)
//! - `RELAY_UPSTREAM_REST_URL`: Upstream REST base (default: <https://api.kraken.com/0/public>)
//! - `RELAY_HEARTBEAT_INTERVAL_SECS` / `RELAY_HEARTBEAT_TIMEOUT_SECS`: 30 / 60
//! - `RELAY_RECONNECT_BASE_MS` / `RELAY_RECONNECT_MAX_SECS` / `RELAY_RECONNECT_MAX_ATTEMPTS`: 1000 / 10 / 5
//! - `RELAY_REST_QUOTA_PER_MINUTE` / `RELAY_REST_MAX_RETRIES` / `RELAY_REST_TIMEOUT_SECS`: 15 / 3 / 10
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use feed_relay::infrastructure::telemetry;
use feed_relay::{
    GatewayConfig, HttpServer, KrakenConnector, RelayConfig, RelayHub, RelaySettings, RestGateway,
    ServerState, UpstreamConfig, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Already installed is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting feed relay");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Metrics recorder not installed");
    }

    let config = RelayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let connector = Arc::new(KrakenConnector::new(config.upstream.ws_url.clone()));
    let (relay, hub_task) = RelayHub::spawn(
        RelaySettings::from(&config.server),
        UpstreamConfig::from(&config.upstream),
        connector,
        shutdown_token.clone(),
    );

    let gateway = Arc::new(RestGateway::new(GatewayConfig::from(&config.rest))?);

    let state = Arc::new(ServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        relay,
        gateway,
    ));
    let server = HttpServer::new(config.server.port, state, shutdown_token.clone());
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "Relay server error");
        }
    });

    tracing::info!("Feed relay ready");

    await_shutdown(shutdown_token).await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = hub_task.await;
        let _ = server_task.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out"
        );
    }

    tracing::info!("Feed relay stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        port = config.server.port,
        max_clients = config.server.max_clients,
        queue_capacity = config.server.client_queue_capacity,
        backpressure = config.server.backpressure.as_str(),
        "Configuration loaded"
    );
    tracing::debug!(
        ws_url = %config.upstream.ws_url,
        rest_url = %config.rest.base_url,
        max_reconnect_attempts = config.upstream.max_reconnect_attempts,
        rest_quota = config.rest.quota_per_minute,
        "Upstream endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

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

/// Wait for shutdown signal (SIGTERM or SIGINT), then cancel `shutdown_token`.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
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
}
