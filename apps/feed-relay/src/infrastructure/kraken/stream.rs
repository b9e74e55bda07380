//! Kraken WebSocket Transport
//!
//! `tokio-tungstenite` adapter for the upstream transport port. Frames are
//! passed through as text; protocol-level ping/pong only counts as activity.
//!
//! # Stream URL
//!
//! - Public market data: `wss://ws.kraken.com`

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{
    TransportError, TransportFrame, UpstreamConnector, UpstreamTransport,
};

/// Connection timeout for the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Opens WebSocket connections to a fixed upstream address.
#[derive(Debug, Clone)]
pub struct KrakenConnector {
    url: String,
}

impl KrakenConnector {
    /// Create a connector for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Upstream address.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl UpstreamConnector for KrakenConnector {
    async fn connect(&self) -> Result<Box<dyn UpstreamTransport>, TransportError> {
        tracing::info!(url = %self.url, "Connecting to upstream feed");

        let handshake = tokio_tungstenite::connect_async(self.url.as_str());
        let (ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| TransportError::Connect(format!("timed out after {CONNECT_TIMEOUT:?}")))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Box::new(KrakenTransport { ws }))
    }
}

/// An open upstream WebSocket.
pub struct KrakenTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl UpstreamTransport for KrakenTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<TransportFrame, TransportError>> {
        let message = match self.ws.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
        };

        let frame = match message {
            Message::Text(text) => Ok(TransportFrame::Text(text.to_string())),
            Message::Ping(data) => match self.ws.send(Message::Pong(data)).await {
                Ok(()) => Ok(TransportFrame::Alive),
                Err(e) => Err(TransportError::Io(e.to_string())),
            },
            Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => Ok(TransportFrame::Alive),
            Message::Close(frame) => Err(TransportError::Closed(
                frame.map_or_else(|| "no close frame".to_string(), |f| f.reason.to_string()),
            )),
        };
        Some(frame)
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            tracing::debug!(error = %e, "Upstream close handshake failed");
        }
    }
}
