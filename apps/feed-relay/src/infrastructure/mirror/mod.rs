//! Relay Mirror Client
//!
//! The consumer side of the relay protocol. A [`MirrorClient`] keeps one
//! WebSocket to the relay, holds the set of subscriptions its caller wants,
//! replays that set on every (re)connect, and reconnects with the same
//! state machine and backoff policy the relay uses upstream. Once the
//! attempt budget runs out it stops and reports
//! [`MirrorError::ConnectionAbandoned`] instead of retrying forever.
//!
//! Relay status frames are reported as [`MirrorEvent::Status`] and never
//! as data.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::domain::connection::{BackoffPolicy, LinkInput, LinkState, LinkStateMachine, RetryDecision};
use crate::domain::frame::{RelayFrame, StatusFrame, classify_relay_frame};
use crate::domain::subscription::{Channel, Subscription};
use crate::infrastructure::upstream::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};

/// Connection timeout for the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the mirror client.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Handshake did not finish in time.
    #[error("connection timed out")]
    ConnectTimeout,

    /// Relay closed the connection or the stream ended.
    #[error("connection closed")]
    ConnectionClosed,

    /// No traffic within the heartbeat window.
    #[error("no traffic for {}s", .0.as_secs())]
    HeartbeatTimeout(Duration),

    /// Reconnect budget exhausted.
    #[error("connection abandoned after {attempts} reconnect attempts")]
    ConnectionAbandoned {
        /// Reconnect attempts made.
        attempts: u32,
    },
}

// =============================================================================
// Events and Configuration
// =============================================================================

/// Events emitted by the mirror client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    /// Connected to the relay; desired subscriptions replayed.
    Connected {
        /// Subscriptions sent on this connect.
        replayed: usize,
    },
    /// Lost the relay connection.
    Disconnected {
        /// What went wrong.
        reason: String,
    },
    /// Waiting before the next attempt.
    Reconnecting {
        /// One-based attempt number.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// Relay's view of its upstream link.
    Status(StatusFrame),
    /// A data update, verbatim.
    Data {
        /// Channel of the update.
        channel: Channel,
        /// Target symbol.
        target: String,
        /// Raw frame.
        text: String,
    },
    /// Error reported by the relay or forwarded from upstream.
    Error(String),
    /// Gave up reconnecting.
    Abandoned {
        /// Reconnect attempts made.
        attempts: u32,
    },
}

/// Configuration for the mirror client.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Relay WebSocket URL, e.g. `ws://localhost:8080/ws`.
    pub url: String,
    /// Reconnect backoff.
    pub backoff: BackoffPolicy,
    /// Reconnect budget (0 = unlimited).
    pub max_attempts: u32,
    /// Keep-alive ping and silence timeout.
    pub heartbeat: HeartbeatConfig,
}

impl MirrorConfig {
    /// Defaults for a relay at `url`: 1s to 30s backoff, 10 attempts.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backoff: BackoffPolicy::client(),
            max_attempts: 10,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Subscribe,
    Unsubscribe,
}

impl Intent {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Compact subscribe/unsubscribe frame sent to the relay.
#[derive(Debug, Serialize)]
struct IntentMessage<'a> {
    event: &'static str,
    #[serde(flatten)]
    subscription: &'a Subscription,
}

fn intent_json(intent: Intent, subscription: &Subscription) -> String {
    let message = IntentMessage {
        event: intent.as_str(),
        subscription,
    };
    serde_json::to_string(&message).unwrap_or_default()
}

#[derive(Debug, Default)]
struct Shared {
    desired: RwLock<BTreeSet<Subscription>>,
    state: RwLock<LinkState>,
}

/// Caller side of a running [`MirrorClient`].
#[derive(Debug, Clone)]
pub struct MirrorHandle {
    shared: Arc<Shared>,
    intents: mpsc::UnboundedSender<(Intent, Subscription)>,
}

impl MirrorHandle {
    /// Add a desired subscription. Sent now if connected, and on every
    /// reconnect.
    pub fn subscribe(&self, subscription: Subscription) {
        if self.shared.desired.write().insert(subscription.clone()) {
            let _ = self.intents.send((Intent::Subscribe, subscription));
        }
    }

    /// Drop a desired subscription.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        if self.shared.desired.write().remove(subscription) {
            let _ = self.intents.send((Intent::Unsubscribe, subscription.clone()));
        }
    }

    /// Replace one subscription with another, e.g. on a symbol or interval
    /// change. Both intents go out back to back.
    pub fn switch(&self, from: &Subscription, to: Subscription) {
        self.unsubscribe(from);
        self.subscribe(to);
    }

    /// Desired subscriptions, sorted.
    #[must_use]
    pub fn desired(&self) -> Vec<Subscription> {
        self.shared.desired.read().iter().cloned().collect()
    }

    /// Connection state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.shared.state.read()
    }
}

// =============================================================================
// Mirror Client
// =============================================================================

/// Reconnecting relay client.
pub struct MirrorClient {
    config: MirrorConfig,
    shared: Arc<Shared>,
    intents: mpsc::UnboundedReceiver<(Intent, Subscription)>,
    event_tx: mpsc::Sender<MirrorEvent>,
    cancel: CancellationToken,
    machine: LinkStateMachine,
}

impl MirrorClient {
    /// Create a client and its handle.
    #[must_use]
    pub fn new(
        config: MirrorConfig,
        event_tx: mpsc::Sender<MirrorEvent>,
        cancel: CancellationToken,
    ) -> (Self, MirrorHandle) {
        let shared = Arc::new(Shared::default());
        let (intents_tx, intents) = mpsc::unbounded_channel();
        let machine = LinkStateMachine::new(config.max_attempts);

        let client = Self {
            config,
            shared: Arc::clone(&shared),
            intents,
            event_tx,
            cancel,
            machine,
        };
        let handle = MirrorHandle {
            shared,
            intents: intents_tx,
        };
        (client, handle)
    }

    /// Run the connection loop until cancelled or abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::ConnectionAbandoned`] once the reconnect
    /// budget is exhausted.
    pub async fn run(mut self) -> Result<(), MirrorError> {
        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Mirror client cancelled");
                return Ok(());
            }

            self.apply(LinkInput::Connect);
            match self.connect_and_run().await {
                Ok(()) => {
                    self.apply(LinkInput::Close);
                    self.apply(LinkInput::Closed);
                    tracing::info!("Mirror connection closed");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Mirror connection error");
                    self.apply(LinkInput::Lost);
                    self.emit(MirrorEvent::Disconnected {
                        reason: e.to_string(),
                    })
                    .await;
                }
            }

            match self.machine.next_retry(&self.config.backoff) {
                RetryDecision::RetryAfter { attempt, delay } => {
                    tracing::info!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Reconnecting to relay"
                    );
                    self.emit(MirrorEvent::Reconnecting { attempt, delay }).await;

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            tracing::info!("Mirror client cancelled during reconnect delay");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp { attempts } => {
                    tracing::error!(attempts, "Mirror reconnect budget exhausted");
                    self.emit(MirrorEvent::Abandoned { attempts }).await;
                    return Err(MirrorError::ConnectionAbandoned { attempts });
                }
            }
        }
    }

    /// Connect and run until error or cancellation.
    async fn connect_and_run(&mut self) -> Result<(), MirrorError> {
        tracing::debug!(url = %self.config.url, "Connecting to relay");

        let connect = tokio_tungstenite::connect_async(self.config.url.as_str());
        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(CONNECT_TIMEOUT, connect) => {
                result.map_err(|_| MirrorError::ConnectTimeout)??
            }
        };
        let (mut write, mut read) = ws_stream.split();

        self.apply(LinkInput::Opened);

        // The desired set is authoritative; queued intents are already in it.
        while self.intents.try_recv().is_ok() {}
        let replay: Vec<Subscription> = self.shared.desired.read().iter().cloned().collect();
        for subscription in &replay {
            write
                .send(Message::Text(intent_json(Intent::Subscribe, subscription).into()))
                .await?;
        }
        tracing::info!(replayed = replay.len(), "Connected to relay");
        self.emit(MirrorEvent::Connected {
            replayed: replay.len(),
        })
        .await;

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(4);
        let heartbeat_cancel = self.cancel.child_token();
        tokio::spawn(
            HeartbeatMonitor::new(
                self.config.heartbeat,
                Arc::clone(&heartbeat_state),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );

        let result = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break Ok(());
                }
                Some((intent, subscription)) = self.intents.recv() => {
                    let text = intent_json(intent, &subscription);
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        break Err(e.into());
                    }
                }
                Some(heartbeat) = heartbeat_rx.recv() => match heartbeat {
                    HeartbeatEvent::SendPing => {
                        if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                            break Err(e.into());
                        }
                    }
                    HeartbeatEvent::Timeout { silent_for } => {
                        break Err(MirrorError::HeartbeatTimeout(silent_for));
                    }
                },
                message = read.next() => {
                    heartbeat_state.record_activity();
                    match message {
                        Some(Ok(Message::Text(text))) => self.on_text(text.as_str()).await,
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break Err(MirrorError::ConnectionClosed),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(e.into()),
                    }
                }
            }
        };

        heartbeat_cancel.cancel();
        result
    }

    async fn on_text(&self, text: &str) {
        let event = match classify_relay_frame(text) {
            RelayFrame::Status(status) => {
                tracing::debug!(state = %status.state, connected = status.connected, "Relay status");
                MirrorEvent::Status(status)
            }
            RelayFrame::Data { channel, target } => MirrorEvent::Data {
                channel,
                target,
                text: text.to_string(),
            },
            RelayFrame::Error { message } => {
                tracing::warn!(error = %message, "Relay reported error");
                MirrorEvent::Error(message)
            }
            RelayFrame::Control => {
                tracing::trace!(frame = %text, "Relay control frame");
                return;
            }
        };
        self.emit(event).await;
    }

    fn apply(&mut self, input: LinkInput) {
        match self.machine.apply(input) {
            Ok(state) => *self.shared.state.write() = state,
            Err(e) => tracing::debug!(error = %e, "Ignored mirror transition"),
        }
    }

    async fn emit(&self, event: MirrorEvent) {
        if self.event_tx.send(event).await.is_err() {
            tracing::debug!("Mirror event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ohlc() -> Subscription {
        Subscription::new("ohlc", Some(5), "XBT/USD")
    }

    #[test]
    fn intent_messages_use_compact_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&intent_json(Intent::Subscribe, &ohlc())).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "event": "subscribe",
                "name": "ohlc",
                "interval": 5,
                "target": "XBT/USD"
            })
        );

        let ticker = Subscription::new("ticker", None, "ETH/USD");
        let json: serde_json::Value =
            serde_json::from_str(&intent_json(Intent::Unsubscribe, &ticker)).unwrap();
        assert_eq!(json.get("interval"), None);
        assert_eq!(json["event"], "unsubscribe");
    }

    #[tokio::test]
    async fn handle_tracks_desired_set_and_dedups_intents() {
        let (events, _rx) = mpsc::channel(8);
        let (mut client, handle) =
            MirrorClient::new(MirrorConfig::new("ws://127.0.0.1:1/ws"), events, CancellationToken::new());

        handle.subscribe(ohlc());
        handle.subscribe(ohlc());
        assert_eq!(handle.desired(), vec![ohlc()]);

        let eth = Subscription::new("ohlc", Some(5), "ETH/USD");
        handle.switch(&ohlc(), eth.clone());
        assert_eq!(handle.desired(), vec![eth.clone()]);

        let mut sent = Vec::new();
        while let Ok(intent) = client.intents.try_recv() {
            sent.push(intent);
        }
        assert_eq!(
            sent,
            vec![
                (Intent::Subscribe, ohlc()),
                (Intent::Unsubscribe, ohlc()),
                (Intent::Subscribe, eth),
            ]
        );
        assert_eq!(handle.state(), LinkState::Disconnected);
    }

    #[test]
    fn default_config_budget() {
        let config = MirrorConfig::new("ws://localhost:8080/ws");
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.backoff.max_delay, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_relay_is_abandoned_after_budget() {
        let (events, mut rx) = mpsc::channel(64);
        let mut config = MirrorConfig::new("ws://127.0.0.1:1/ws");
        config.max_attempts = 2;
        config.backoff = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(20));
        let (client, handle) = MirrorClient::new(config, events, CancellationToken::new());

        let result = client.run().await;
        assert!(matches!(
            result,
            Err(MirrorError::ConnectionAbandoned { attempts: 2 })
        ));
        assert_eq!(handle.state(), LinkState::Disconnected);

        let mut reconnecting = 0;
        let mut abandoned = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                MirrorEvent::Reconnecting { .. } => reconnecting += 1,
                MirrorEvent::Abandoned { attempts } => abandoned = attempts == 2,
                _ => {}
            }
        }
        assert_eq!(reconnecting, 2);
        assert!(abandoned);
    }
}
