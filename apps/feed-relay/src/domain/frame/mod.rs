//! Frame Classification
//!
//! The relay is a content-agnostic router for everything except
//! subscribe/unsubscribe intents. This module holds the only structural
//! inspection it performs:
//!
//! - Upstream frames are classified as data, error or control so data and
//!   errors can be routed verbatim and control traffic logged.
//! - Client frames are checked for subscribe, unsubscribe and ping intents.
//!   Anything else is forwarded upstream untouched.
//! - Relay frames (as seen by a consumer) separate status pushes from data.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::connection::LinkState;
use super::subscription::{Channel, Subscription};

// =============================================================================
// Upstream Frames
// =============================================================================

/// Classification of a frame received from upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// Heartbeats, pongs, status and acknowledgements. Logged, not forwarded.
    Control,
    /// A data update for `target` on `channel`.
    Data {
        /// Channel the update belongs to.
        channel: Channel,
        /// Target symbol.
        target: String,
    },
    /// An error report, optionally naming the pair it concerns.
    Error {
        /// Pair named by the error, if any.
        target: Option<String>,
        /// Human-readable message.
        message: String,
    },
}

/// Classify an upstream text frame.
///
/// Arrays whose last two elements are strings are data updates routed by
/// `(channel, target)`. Objects reporting `status: "error"`, carrying an
/// `errorMessage`, or a non-empty `error` field are errors. Everything else,
/// including text that is not JSON, is control traffic.
#[must_use]
pub fn classify_upstream(text: &str) -> FrameKind {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return FrameKind::Control;
    };

    match value {
        Value::Array(items) => classify_array(&items),
        Value::Object(ref object) if is_error_object(object) => FrameKind::Error {
            target: object.get("pair").and_then(Value::as_str).map(str::to_string),
            message: error_message(object),
        },
        _ => FrameKind::Control,
    }
}

fn classify_array(items: &[Value]) -> FrameKind {
    let [.., Value::String(channel), Value::String(target)] = items else {
        return FrameKind::Control;
    };

    FrameKind::Data {
        channel: Channel::parse(channel),
        target: target.clone(),
    }
}

fn is_error_object(object: &serde_json::Map<String, Value>) -> bool {
    if object.get("status").and_then(Value::as_str) == Some("error") {
        return true;
    }
    if object.contains_key("errorMessage") {
        return true;
    }
    match object.get("error") {
        None | Some(Value::Null) => false,
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn error_message(object: &serde_json::Map<String, Value>) -> String {
    if let Some(message) = object.get("errorMessage").and_then(Value::as_str) {
        return message.to_string();
    }
    match object.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
            .collect::<Vec<_>>()
            .join("; "),
        Some(other) => other.to_string(),
        None => "upstream reported an error".to_string(),
    }
}

// =============================================================================
// Client Intents
// =============================================================================

/// What a downstream client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIntent {
    /// Add subscriptions.
    Subscribe(Vec<Subscription>),
    /// Drop subscriptions.
    Unsubscribe(Vec<Subscription>),
    /// Application-level ping, answered by the relay itself.
    Ping {
        /// Request id echoed in the pong.
        reqid: Option<u64>,
    },
    /// Not interpreted; forwarded upstream verbatim.
    Passthrough,
}

/// A subscribe/unsubscribe intent the relay cannot act on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntentError {
    /// No channel name given.
    #[error("{event} intent is missing a channel name")]
    MissingName {
        /// `subscribe` or `unsubscribe`.
        event: String,
    },
    /// No target symbol given.
    #[error("{event} intent is missing a target")]
    MissingTarget {
        /// `subscribe` or `unsubscribe`.
        event: String,
    },
    /// Interval present but not a non-negative integer.
    #[error("{event} intent has an invalid interval: {value}")]
    InvalidInterval {
        /// `subscribe` or `unsubscribe`.
        event: String,
        /// Offending value.
        value: String,
    },
}

/// Interpret a client text frame.
///
/// Accepts both the upstream's native shape
/// (`{"event":"subscribe","pair":[..],"subscription":{"name":..,"interval":..}}`)
/// and the compact shape (`{"event":"subscribe","name":..,"interval":..,"target":..}`).
/// `type` is accepted in place of `event`.
///
/// # Errors
///
/// Returns [`IntentError`] when a subscribe or unsubscribe intent lacks a
/// name or target, or carries a malformed interval.
pub fn parse_client_intent(text: &str) -> Result<ClientIntent, IntentError> {
    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(text) else {
        return Ok(ClientIntent::Passthrough);
    };

    let event = object
        .get("event")
        .or_else(|| object.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    match event {
        "subscribe" => parse_subscriptions(event, &object).map(ClientIntent::Subscribe),
        "unsubscribe" => parse_subscriptions(event, &object).map(ClientIntent::Unsubscribe),
        "ping" => Ok(ClientIntent::Ping {
            reqid: object.get("reqid").and_then(Value::as_u64),
        }),
        _ => Ok(ClientIntent::Passthrough),
    }
}

fn parse_subscriptions(
    event: &str,
    object: &serde_json::Map<String, Value>,
) -> Result<Vec<Subscription>, IntentError> {
    // Native shape nests name/interval under "subscription"; compact keeps them flat.
    let details = object
        .get("subscription")
        .and_then(Value::as_object)
        .unwrap_or(object);

    let name = details
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| IntentError::MissingName {
            event: event.to_string(),
        })?;

    let interval = match details.get("interval") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| IntentError::InvalidInterval {
                    event: event.to_string(),
                    value: value.to_string(),
                })?,
        ),
    };

    let targets: Vec<&str> = match (object.get("pair"), object.get("target")) {
        (Some(Value::Array(pairs)), _) => pairs.iter().filter_map(Value::as_str).collect(),
        (Some(Value::String(pair)), _) | (None, Some(Value::String(pair))) => vec![pair.as_str()],
        _ => Vec::new(),
    };
    let targets: Vec<&str> = targets.into_iter().filter(|t| !t.is_empty()).collect();

    if targets.is_empty() {
        return Err(IntentError::MissingTarget {
            event: event.to_string(),
        });
    }

    Ok(targets
        .into_iter()
        .map(|target| Subscription::new(name, interval, target))
        .collect())
}

// =============================================================================
// Relay Frames
// =============================================================================

/// Connectivity status pushed to every session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFrame {
    /// Always `"status"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Whether the upstream link is open.
    pub connected: bool,
    /// Upstream link state.
    pub state: LinkState,
    /// Terminal error, set when the relay gave up reconnecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusFrame {
    /// Status for a link state.
    #[must_use]
    pub fn new(state: LinkState) -> Self {
        Self {
            kind: "status".to_string(),
            connected: state == LinkState::Open,
            state,
            error: None,
        }
    }

    /// Attach a terminal error.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Serialize to a text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"type":"status","connected":{}}}"#, self.connected)
        })
    }
}

/// Error frame sent to a single session.
#[must_use]
pub fn error_frame(message: &str) -> String {
    serde_json::json!({ "type": "error", "error": message }).to_string()
}

/// Pong answering a client ping.
#[must_use]
pub fn pong_frame(reqid: Option<u64>) -> String {
    match reqid {
        Some(reqid) => serde_json::json!({ "event": "pong", "reqid": reqid }).to_string(),
        None => serde_json::json!({ "event": "pong" }).to_string(),
    }
}

/// Classification of a frame received from the relay by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    /// Connectivity status of the relay's upstream link.
    Status(StatusFrame),
    /// Forwarded data update.
    Data {
        /// Channel the update belongs to.
        channel: Channel,
        /// Target symbol.
        target: String,
    },
    /// Error from the relay or forwarded from upstream.
    Error {
        /// Human-readable message.
        message: String,
    },
    /// Pongs and other control traffic.
    Control,
}

/// Classify a frame received from the relay.
///
/// Status frames are never reported as data.
#[must_use]
pub fn classify_relay_frame(text: &str) -> RelayFrame {
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(text)
        && object.get("type").and_then(Value::as_str) == Some("status")
    {
        return serde_json::from_value(Value::Object(object)).map_or_else(
            |e| RelayFrame::Error {
                message: format!("malformed status frame: {e}"),
            },
            RelayFrame::Status,
        );
    }

    match classify_upstream(text) {
        FrameKind::Data { channel, target } => RelayFrame::Data { channel, target },
        FrameKind::Error { message, .. } => RelayFrame::Error { message },
        FrameKind::Control => RelayFrame::Control,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(r#"[42,[["1.0","2.0"]],"ohlc-5","XBT/USD"]"#, "ohlc", Some(5), "XBT/USD" ; "ohlc with interval")]
    #[test_case(r#"[340,{"a":["5525.4",1,1.0]},"ticker","XBT/USD"]"#, "ticker", None, "XBT/USD" ; "ticker")]
    #[test_case(r#"[0,{"as":[]},{"bs":[]},"book-10","ETH/USD"]"#, "book", Some(10), "ETH/USD" ; "book with depth suffix")]
    fn data_frames_are_routed_by_channel_and_target(
        text: &str,
        name: &str,
        interval: Option<u32>,
        target: &str,
    ) {
        let FrameKind::Data { channel, target: t } = classify_upstream(text) else {
            panic!("expected data frame");
        };
        assert_eq!(channel.name, name);
        assert_eq!(channel.interval, interval);
        assert_eq!(t, target);
    }

    #[test_case(r#"{"event":"heartbeat"}"# ; "heartbeat")]
    #[test_case(r#"{"event":"pong","reqid":7}"# ; "pong")]
    #[test_case(r#"{"event":"systemStatus","status":"online","version":"1.9"}"# ; "system status")]
    #[test_case(r#"{"event":"subscriptionStatus","status":"subscribed","pair":"XBT/USD"}"# ; "subscribed ack")]
    #[test_case(r#"{"error":[],"result":{}}"# ; "empty error array")]
    #[test_case("not json at all" ; "non json")]
    #[test_case("[1,2,3]" ; "array without strings")]
    #[test_case(r#"["only-one"]"# ; "array with single string")]
    fn control_frames_are_not_forwarded(text: &str) {
        assert_eq!(classify_upstream(text), FrameKind::Control);
    }

    #[test]
    fn subscription_error_names_its_pair() {
        let text = r#"{"errorMessage":"Currency pair not supported","event":"subscriptionStatus","pair":"XBT/USDX","status":"error"}"#;

        assert_eq!(
            classify_upstream(text),
            FrameKind::Error {
                target: Some("XBT/USDX".to_string()),
                message: "Currency pair not supported".to_string(),
            }
        );
    }

    #[test_case(r#"{"error":["EQuery:Unknown asset pair"]}"#, "EQuery:Unknown asset pair" ; "error array")]
    #[test_case(r#"{"error":"boom"}"#, "boom" ; "error string")]
    #[test_case(r#"{"status":"error"}"#, "upstream reported an error" ; "bare status")]
    fn error_objects_are_errors(text: &str, message: &str) {
        let FrameKind::Error { message: m, target } = classify_upstream(text) else {
            panic!("expected error frame");
        };
        assert_eq!(m, message);
        assert_eq!(target, None);
    }

    #[test]
    fn native_subscribe_expands_pairs() {
        let text = r#"{"event":"subscribe","pair":["XBT/USD","ETH/USD"],"subscription":{"name":"ohlc","interval":5}}"#;

        assert_eq!(
            parse_client_intent(text),
            Ok(ClientIntent::Subscribe(vec![
                Subscription::new("ohlc", Some(5), "XBT/USD"),
                Subscription::new("ohlc", Some(5), "ETH/USD"),
            ]))
        );
    }

    #[test]
    fn compact_intents_use_target() {
        let text = r#"{"type":"unsubscribe","name":"ticker","target":"XBT/USD"}"#;

        assert_eq!(
            parse_client_intent(text),
            Ok(ClientIntent::Unsubscribe(vec![Subscription::new(
                "ticker", None, "XBT/USD"
            )]))
        );
    }

    #[test_case(r#"{"event":"subscribe","target":"XBT/USD"}"# => matches Err(IntentError::MissingName { .. }) ; "missing name")]
    #[test_case(r#"{"event":"subscribe","name":"ohlc"}"# => matches Err(IntentError::MissingTarget { .. }) ; "missing target")]
    #[test_case(r#"{"event":"subscribe","pair":[],"subscription":{"name":"ohlc"}}"# => matches Err(IntentError::MissingTarget { .. }) ; "empty pair list")]
    #[test_case(r#"{"event":"subscribe","name":"ohlc","interval":"5","target":"XBT/USD"}"# => matches Err(IntentError::InvalidInterval { .. }) ; "string interval")]
    #[test_case(r#"{"event":"unsubscribe","name":"ohlc","interval":-1,"target":"XBT/USD"}"# => matches Err(IntentError::InvalidInterval { .. }) ; "negative interval")]
    fn malformed_intents_are_rejected(text: &str) -> Result<ClientIntent, IntentError> {
        parse_client_intent(text)
    }

    #[test_case(r#"{"event":"ping","reqid":42}"# => Ok(ClientIntent::Ping { reqid: Some(42) }) ; "ping with reqid")]
    #[test_case(r#"{"event":"ping"}"# => Ok(ClientIntent::Ping { reqid: None }) ; "ping without reqid")]
    #[test_case(r#"{"event":"addOrder"}"# => Ok(ClientIntent::Passthrough) ; "unknown event")]
    #[test_case(r#"{"foo":"bar"}"# => Ok(ClientIntent::Passthrough) ; "no event")]
    #[test_case("hello" => Ok(ClientIntent::Passthrough) ; "plain text")]
    #[test_case("[1,2]" => Ok(ClientIntent::Passthrough) ; "array")]
    fn other_client_frames(text: &str) -> Result<ClientIntent, IntentError> {
        parse_client_intent(text)
    }

    #[test]
    fn status_frame_shape() {
        let open = StatusFrame::new(LinkState::Open).to_json();
        assert_eq!(open, r#"{"type":"status","connected":true,"state":"open"}"#);

        let abandoned = StatusFrame::new(LinkState::Disconnected)
            .with_error("connection abandoned after 5 attempts")
            .to_json();
        let value: Value = serde_json::from_str(&abandoned).unwrap();
        assert_eq!(value["connected"], false);
        assert_eq!(value["state"], "disconnected");
        assert_eq!(value["error"], "connection abandoned after 5 attempts");
    }

    #[test]
    fn relay_status_is_never_data() {
        let status = StatusFrame::new(LinkState::Connecting).to_json();
        assert!(matches!(
            classify_relay_frame(&status),
            RelayFrame::Status(StatusFrame { connected: false, state: LinkState::Connecting, .. })
        ));
    }

    #[test]
    fn relay_frames_pass_data_and_errors_through() {
        assert!(matches!(
            classify_relay_frame(r#"[1,{},"trade","XBT/USD"]"#),
            RelayFrame::Data { .. }
        ));
        assert_eq!(
            classify_relay_frame(&error_frame("capacity exceeded")),
            RelayFrame::Error {
                message: "capacity exceeded".to_string()
            }
        );
        assert_eq!(classify_relay_frame(&pong_frame(Some(1))), RelayFrame::Control);
    }
}
