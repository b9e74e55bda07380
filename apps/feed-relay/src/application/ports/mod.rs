//! Port Interfaces
//!
//! Contracts between the relay core and the outside world, following the
//! Hexagonal Architecture pattern. Infrastructure adapters implement these;
//! tests substitute in-process fakes.
//!
//! ## Driven Ports (Outbound)
//!
//! - `UpstreamConnector` / `UpstreamTransport`: the streaming link to the exchange
//! - `PreferenceStore`: key-value persistence for consumer selections

use async_trait::async_trait;

// =============================================================================
// Upstream Transport
// =============================================================================

/// A frame received from the upstream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    /// Text payload, passed on verbatim.
    Text(String),
    /// Transport-level traffic with no payload (ping, pong, binary).
    Alive,
}

/// Transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport could not be opened.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Read or write failed on an open transport.
    #[error("transport I/O failed: {0}")]
    Io(String),
    /// Peer closed the transport.
    #[error("closed by peer: {0}")]
    Closed(String),
}

/// An open streaming connection.
///
/// `recv` must be cancel-safe: the link task polls it inside `select!`.
#[async_trait]
pub trait UpstreamTransport: Send {
    /// Write a text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next frame, or `None` once the transport has ended.
    async fn recv(&mut self) -> Option<Result<TransportFrame, TransportError>>;

    /// Close the transport, best effort.
    async fn close(&mut self);
}

/// Opens upstream transports.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Open a new transport to the fixed upstream address.
    async fn connect(&self) -> Result<Box<dyn UpstreamTransport>, TransportError>;
}

// =============================================================================
// Preference Store
// =============================================================================

/// Key for the last selected symbol.
pub const LAST_SYMBOL_KEY: &str = "last_symbol";

/// Key for the last selected interval.
pub const LAST_INTERVAL_KEY: &str = "last_interval";

/// Preference store failure.
#[derive(Debug, thiserror::Error)]
pub enum PreferenceError {
    /// Backing storage could not be read or written.
    #[error("preference storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Stored data is not valid.
    #[error("preference storage is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// String key-value persistence. `get` and `set` are idempotent; no
/// transactional guarantees.
pub trait PreferenceStore: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns [`PreferenceError`] if the backing storage fails.
    fn get(&self, key: &str) -> Result<Option<String>, PreferenceError>;

    /// Write a value.
    ///
    /// # Errors
    ///
    /// Returns [`PreferenceError`] if the backing storage fails.
    fn set(&self, key: &str, value: &str) -> Result<(), PreferenceError>;
}
