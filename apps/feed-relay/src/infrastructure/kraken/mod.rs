//! Kraken Adapters
//!
//! Concrete adapters for the upstream exchange:
//!
//! - **Stream**: WebSocket transport for the public market-data feed
//! - **REST**: Rate-limited gateway for point-in-time public queries
//! - **Messages**: The few upstream request shapes the relay itself emits

pub mod messages;
pub mod rest;
pub mod stream;

pub use messages::{PingRequest, RestEnvelope, SubscriptionDetails, SubscriptionRequest};
pub use rest::{GatewayConfig, GatewayError, PublicQuery, RestGateway};
pub use stream::{KrakenConnector, KrakenTransport};
