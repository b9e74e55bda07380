//! Kraken Wire Messages
//!
//! Outbound request frames for the public WebSocket feed and the response
//! envelope of the public REST API.
//!
//! # WebSocket
//!
//! ```json
//! {"event":"subscribe","pair":["XBT/USD"],"subscription":{"name":"ohlc","interval":5}}
//! {"event":"unsubscribe","pair":["XBT/USD"],"subscription":{"name":"ohlc","interval":5}}
//! {"event":"ping","reqid":42}
//! ```
//!
//! # REST
//!
//! ```json
//! {"error":[],"result":{"XXBTZUSD":[...],"last":1688671200}}
//! ```
//!
//! # References
//!
//! - [WebSocket API v1](https://docs.kraken.com/api/docs/websocket-v1/subscribe)
//! - [REST Market Data](https://docs.kraken.com/api/docs/rest-api/get-ohlc-data)

use serde::{Deserialize, Serialize};

use crate::domain::subscription::Subscription;

// =============================================================================
// WebSocket Requests
// =============================================================================

/// Subscribe or unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRequest {
    /// `subscribe` or `unsubscribe`.
    pub event: &'static str,
    /// Pairs the request applies to.
    pub pair: Vec<String>,
    /// Channel details.
    pub subscription: SubscriptionDetails,
}

/// Channel name and interval of a subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionDetails {
    /// Channel name.
    pub name: String,
    /// Interval in minutes, for channels that take one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
}

impl SubscriptionRequest {
    /// Create a subscribe request for one subscription.
    #[must_use]
    pub fn subscribe(sub: &Subscription) -> Self {
        Self::new("subscribe", sub)
    }

    /// Create an unsubscribe request for one subscription.
    #[must_use]
    pub fn unsubscribe(sub: &Subscription) -> Self {
        Self::new("unsubscribe", sub)
    }

    fn new(event: &'static str, sub: &Subscription) -> Self {
        Self {
            event,
            pair: vec![sub.target.clone()],
            subscription: SubscriptionDetails {
                name: sub.name.clone(),
                interval: sub.interval,
            },
        }
    }

    /// Serialize to a text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Application-level keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PingRequest {
    /// Always `ping`.
    pub event: &'static str,
    /// Request id echoed by the pong.
    pub reqid: u64,
}

impl PingRequest {
    /// Create a ping.
    #[must_use]
    pub const fn new(reqid: u64) -> Self {
        Self {
            event: "ping",
            reqid,
        }
    }

    /// Serialize to a text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        format!(r#"{{"event":"ping","reqid":{}}}"#, self.reqid)
    }
}

// =============================================================================
// REST Envelope
// =============================================================================

/// Response envelope shared by every public REST endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestEnvelope {
    /// Error strings; empty on success.
    #[serde(default)]
    pub error: Vec<String>,
    /// Result keyed by pair, plus endpoint-specific cursors such as `last`.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl RestEnvelope {
    /// Whether the upstream reported a semantic error.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        !self.error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_with_interval() {
        let sub = Subscription::new("ohlc", Some(5), "XBT/USD");
        assert_eq!(
            SubscriptionRequest::subscribe(&sub).to_json(),
            r#"{"event":"subscribe","pair":["XBT/USD"],"subscription":{"name":"ohlc","interval":5}}"#
        );
    }

    #[test]
    fn unsubscribe_without_interval() {
        let sub = Subscription::new("ticker", None, "ETH/USD");
        assert_eq!(
            SubscriptionRequest::unsubscribe(&sub).to_json(),
            r#"{"event":"unsubscribe","pair":["ETH/USD"],"subscription":{"name":"ticker"}}"#
        );
    }

    #[test]
    fn ping_matches_serde_output() {
        let ping = PingRequest::new(7);
        assert_eq!(ping.to_json(), serde_json::to_string(&ping).unwrap());
    }

    #[test]
    fn envelope_detects_rejection() {
        let ok: RestEnvelope = serde_json::from_str(r#"{"error":[],"result":{"last":1}}"#).unwrap();
        assert!(!ok.is_rejected());

        let rejected: RestEnvelope =
            serde_json::from_str(r#"{"error":["EQuery:Unknown asset pair"]}"#).unwrap();
        assert!(rejected.is_rejected());
        assert!(rejected.result.is_none());
    }
}
