//! Relay HTTP Server
//!
//! One axum server carries every downstream surface of the relay.
//!
//! # Endpoints
//!
//! - `GET /ws` - WebSocket upgrade into the fan-out hub
//! - `GET /api/public/{method}` - Rate-limited point-in-time query proxy
//! - `GET /health` - JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (hub answering)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::connection::LinkState;
use crate::domain::frame::error_frame;
use crate::infrastructure::kraken::{GatewayError, PublicQuery, RestGateway};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::relay::{ClientConnection, RelayHandle, RelaySnapshot};

/// Public REST methods the proxy forwards.
pub const ALLOWED_METHODS: [&str; 5] = ["OHLC", "Ticker", "Trades", "Spread", "Depth"];

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Connected clients.
    pub clients: usize,
    /// Configured client limit.
    pub max_clients: usize,
    /// Distinct subscriptions held upstream.
    pub subscriptions: usize,
    /// Upstream link status.
    pub upstream: UpstreamStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Upstream link open.
    Healthy,
    /// Clients attached but upstream not open.
    Degraded,
    /// No clients, so no upstream link is wanted.
    Idle,
    /// Hub not answering.
    Unhealthy,
}

/// Upstream link status.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    /// Link state.
    pub state: LinkState,
    /// Whether the link is open.
    pub connected: bool,
    /// Reconnect attempts since the last open.
    pub reconnect_attempts: u32,
    /// Whether the reconnect budget ran out.
    pub abandoned: bool,
    /// When the current link opened.
    pub opened_at: Option<DateTime<Utc>>,
}

fn determine_health_status(snapshot: &RelaySnapshot) -> HealthStatus {
    match (snapshot.upstream_state, snapshot.clients) {
        (LinkState::Open, _) => HealthStatus::Healthy,
        (_, 0) => HealthStatus::Idle,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for request handlers.
pub struct ServerState {
    version: String,
    started_at: Instant,
    relay: RelayHandle,
    gateway: Arc<RestGateway>,
}

impl ServerState {
    /// Create server state.
    #[must_use]
    pub fn new(version: String, relay: RelayHandle, gateway: Arc<RestGateway>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            relay,
            gateway,
        }
    }
}

/// Build the relay router.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/public/{method}", get(public_query_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Server
// =============================================================================

/// Relay HTTP server.
pub struct HttpServer {
    port: u16,
    state: Arc<ServerState>,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<ServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`HttpServerError`] if binding fails or the server fails while running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`HttpServerError::ServerFailed`] if the server fails while running.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HttpServerError> {
        let local = listener.local_addr().ok();
        tracing::info!(addr = ?local, "Relay server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Relay server stopped");
        Ok(())
    }
}

// =============================================================================
// WebSocket
// =============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.relay.clone()))
}

async fn handle_socket(socket: WebSocket, relay: RelayHandle) {
    let (mut sink, mut stream) = socket.split();

    let connection = match relay.connect().await {
        Ok(connection) => connection,
        Err(e) => {
            let _ = sink.send(Message::Text(error_frame(&e.to_string()).into())).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let ClientConnection {
        id,
        mut frames,
        kicked,
    } = connection;

    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = kicked.cancelled() => break,
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    if sink.send(Message::Text(frame.as_ref().into())).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if relay.client_message(id, text.to_string()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    relay.disconnect(id).await;
    writer.abort();
    tracing::debug!(session = id, "Client socket closed");
}

// =============================================================================
// Query Proxy
// =============================================================================

/// Query string of a proxied request.
#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    /// Pair.
    pub pair: Option<String>,
    /// Interval in minutes.
    pub interval: Option<u32>,
    /// Cursor.
    pub since: Option<String>,
}

/// Error body shaped like the upstream envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    errors: Vec<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            errors: vec![message.into()],
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.errors }))).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::UpstreamRejected(errors) => Self {
                status: StatusCode::BAD_REQUEST,
                errors,
            },
            GatewayError::InvalidRequest(_) => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            GatewayError::RateLimited | GatewayError::ExhaustedRetries { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            GatewayError::UpstreamStatus { .. }
            | GatewayError::Network(_)
            | GatewayError::InvalidResponse(_) => Self::new(StatusCode::BAD_GATEWAY, e.to_string()),
        }
    }
}

async fn public_query_handler(
    State(state): State<Arc<ServerState>>,
    Path(method): Path<String>,
    Query(params): Query<QueryParams>,
) -> Result<Response, ApiError> {
    if !ALLOWED_METHODS.contains(&method.as_str()) {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("EGeneral:Unknown method {method}"),
        ));
    }

    let query = PublicQuery {
        method,
        pair: params.pair,
        interval: params.interval,
        since: params.since,
    };
    let body = state.gateway.public_query(&query).await?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

// =============================================================================
// Health Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<ServerState>>) -> Response {
    let Ok(snapshot) = state.relay.snapshot().await else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": HealthStatus::Unhealthy })),
        )
            .into_response();
    };

    let response = HealthResponse {
        status: determine_health_status(&snapshot),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        clients: snapshot.clients,
        max_clients: snapshot.max_clients,
        subscriptions: snapshot.subscriptions,
        upstream: UpstreamStatus {
            state: snapshot.upstream_state,
            connected: snapshot.upstream_state == LinkState::Open,
            reconnect_attempts: snapshot.reconnect_attempts,
            abandoned: snapshot.upstream_abandoned,
            opened_at: snapshot.upstream_opened_at,
        },
    };
    (StatusCode::OK, Json(response)).into_response()
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    if state.relay.snapshot().await.is_ok() {
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
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
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
