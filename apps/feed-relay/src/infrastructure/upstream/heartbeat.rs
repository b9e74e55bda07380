//! Heartbeat Monitor
//!
//! Keeps the upstream link honest: asks for a keep-alive ping at a fixed
//! interval and reports a timeout when nothing at all has arrived within the
//! timeout window. Any inbound traffic counts as proof of life, not only the
//! pong, so a busy feed never trips the timeout.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::UpstreamSettings;

/// Shortest ping interval the monitor will run with.
pub const MIN_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Interval between keep-alive pings.
    pub ping_interval: Duration,
    /// Silence tolerated before the link is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, timeout: Duration) -> Self {
        Self {
            ping_interval,
            timeout,
        }
    }

    /// Create configuration from `UpstreamSettings`.
    #[must_use]
    pub const fn from_upstream_settings(settings: &UpstreamSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            timeout: settings.heartbeat_timeout,
        }
    }
}

/// Events emitted by the heartbeat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Time to send a keep-alive ping.
    SendPing,
    /// Nothing received within the timeout; the link should be closed.
    Timeout {
        /// Silence observed.
        silent_for: Duration,
    },
}

/// Last-activity timestamp shared between the monitor and the reader.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// Record that something arrived on the link.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Time since anything arrived.
    #[must_use]
    pub fn silent_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }
}

/// Heartbeat monitor task.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Create a new heartbeat monitor.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the event channel closes, or a timeout fires.
    ///
    /// A zero ping interval is raised to [`MIN_PING_INTERVAL`].
    pub async fn run(self) {
        let period = if self.config.ping_interval.is_zero() {
            tracing::warn!(
                min_ms = u64::try_from(MIN_PING_INTERVAL.as_millis()).unwrap_or(u64::MAX),
                "Zero heartbeat interval, using minimum"
            );
            MIN_PING_INTERVAL
        } else {
            self.config.ping_interval
        };
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if self.check_and_ping().await.is_break() {
                        break;
                    }
                }
            }
        }
    }

    async fn check_and_ping(&self) -> std::ops::ControlFlow<()> {
        let silent_for = self.state.silent_for();
        if silent_for > self.config.timeout {
            tracing::warn!(
                silent_secs = silent_for.as_secs(),
                timeout_secs = self.config.timeout.as_secs(),
                "Heartbeat timeout detected"
            );
            let _ = self.event_tx.send(HeartbeatEvent::Timeout { silent_for }).await;
            return std::ops::ControlFlow::Break(());
        }

        if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
            tracing::debug!("Event channel closed, stopping heartbeat");
            return std::ops::ControlFlow::Break(());
        }

        std::ops::ControlFlow::Continue(())
    }
}
