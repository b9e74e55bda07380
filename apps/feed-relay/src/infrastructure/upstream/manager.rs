//! Upstream Connection Manager
//!
//! Owns the single shared upstream link and its reconnect state machine.
//! The manager is a plain struct driven by the relay hub: the hub calls
//! [`UpstreamManager::ensure_connected`], [`UpstreamManager::send`] and
//! [`UpstreamManager::shutdown`], and feeds every [`LinkEvent`] back through
//! [`UpstreamManager::handle_event`]. All mutation therefore happens on the
//! hub's task; link I/O and retry timers run in their own tasks and only
//! ever talk back through the event channel.
//!
//! Every link and retry timer is tagged with a generation. Events from a
//! generation the manager has moved past are dropped, so a link that was
//! replaced or told to close can never disturb the current one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::heartbeat::HeartbeatConfig;
use super::link::{LinkEvent, LinkTask};
use crate::application::ports::UpstreamConnector;
use crate::domain::connection::{
    BackoffPolicy, LinkInput, LinkState, LinkStateMachine, RetryDecision,
};
use crate::domain::frame::{FrameKind, classify_upstream};
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::kraken::messages::SubscriptionRequest;
use crate::infrastructure::metrics;
use crate::infrastructure::relay::SessionCounter;

// =============================================================================
// Error and Outcome Types
// =============================================================================

/// Errors surfaced by [`UpstreamManager::send`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// The link is not open.
    #[error("upstream not connected (state: {state})")]
    NotConnected {
        /// Current link state.
        state: LinkState,
    },
    /// The link's outbound queue is full.
    #[error("upstream outbound queue is full")]
    Backlogged,
}

/// What the hub should do after a link event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamOutcome {
    /// Link state changed; push a status frame to every session.
    StateChanged(LinkState),
    /// Data or error frame to route to sessions, verbatim.
    Forward {
        /// Frame text as received.
        text: String,
        /// Classification used for routing.
        kind: FrameKind,
    },
    /// Retry budget exhausted; the link stays down until a new request.
    Abandoned {
        /// Reconnect attempts that were made.
        attempts: u32,
    },
}

/// Tuning for the manager.
#[derive(Debug, Clone, Copy)]
pub struct UpstreamConfig {
    /// Reconnect backoff.
    pub backoff: BackoffPolicy,
    /// Reconnect attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
    /// Keep-alive and silence timeout.
    pub heartbeat: HeartbeatConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::upstream(),
            max_attempts: 5,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// The single shared upstream link.
pub struct UpstreamManager {
    connector: Arc<dyn UpstreamConnector>,
    config: UpstreamConfig,
    machine: LinkStateMachine,
    generation: u64,
    writer: Option<mpsc::Sender<String>>,
    link_cancel: Option<CancellationToken>,
    retry_cancel: Option<CancellationToken>,
    events: mpsc::Sender<LinkEvent>,
    opened_at: Option<DateTime<Utc>>,
}

impl UpstreamManager {
    /// Create a manager; link events are reported on `events`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        config: UpstreamConfig,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        Self {
            connector,
            config,
            machine: LinkStateMachine::new(config.max_attempts),
            generation: 0,
            writer: None,
            link_cancel: None,
            retry_cancel: None,
            events,
            opened_at: None,
        }
    }

    /// Current link state.
    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.machine.state()
    }

    /// Reconnect attempts since the last successful open.
    #[must_use]
    pub const fn reconnect_attempts(&self) -> u32 {
        self.machine.reconnect().attempts
    }

    /// Whether the retry budget was exhausted.
    #[must_use]
    pub const fn gave_up(&self) -> bool {
        self.machine.reconnect().gave_up
    }

    /// When the current link opened.
    #[must_use]
    pub const fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    /// Start a link unless one is open or connecting.
    ///
    /// Returns the new state if it changed.
    pub fn ensure_connected(&mut self) -> Option<LinkState> {
        if self.state().is_active() {
            return None;
        }

        self.cancel_retry();
        if self.gave_up() {
            self.machine.reset_reconnect();
        }
        self.start_link()
    }

    /// Write a frame to the open link.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::NotConnected`] unless the link is open, and
    /// [`UpstreamError::Backlogged`] if its outbound queue is full.
    pub fn send(&self, text: String) -> Result<(), UpstreamError> {
        let state = self.state();
        let writer = match (&self.writer, state) {
            (Some(writer), LinkState::Open) => writer,
            _ => return Err(UpstreamError::NotConnected { state }),
        };

        writer.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => UpstreamError::Backlogged,
            mpsc::error::TrySendError::Closed(_) => UpstreamError::NotConnected { state },
        })
    }

    /// Close the link and cancel any pending reconnect.
    ///
    /// Returns the new state if it changed.
    pub fn shutdown(&mut self) -> Option<LinkState> {
        self.cancel_retry();
        self.machine.reset_reconnect();
        self.writer = None;
        self.opened_at = None;

        if !self.state().is_active() {
            return None;
        }

        let state = self.transition(LinkInput::Close)?;
        if let Some(cancel) = self.link_cancel.take() {
            cancel.cancel();
        }
        tracing::info!(generation = self.generation, "Closing upstream link");
        Some(state)
    }

    /// Apply a link event.
    ///
    /// `sessions` decides whether a lost link is worth reconnecting;
    /// `registry` supplies the subscriptions replayed when a link opens.
    pub fn handle_event(
        &mut self,
        event: LinkEvent,
        sessions: &SessionCounter,
        registry: &SubscriptionRegistry,
    ) -> Option<UpstreamOutcome> {
        if event.generation() != self.generation {
            tracing::trace!(
                stale = event.generation(),
                current = self.generation,
                "Ignoring stale link event"
            );
            return None;
        }

        match event {
            LinkEvent::Opened { writer, .. } => self.on_opened(writer, registry),
            LinkEvent::Frame { text, .. } => Self::on_frame(text),
            LinkEvent::Lost { reason, .. } => self.on_lost(&reason, sessions),
            LinkEvent::Closed { .. } => {
                self.link_cancel = None;
                self.transition(LinkInput::Closed)
                    .map(UpstreamOutcome::StateChanged)
            }
            LinkEvent::RetryDue { .. } => {
                self.retry_cancel = None;
                if self.state() != LinkState::Disconnected || sessions.active() == 0 {
                    return None;
                }
                self.start_link().map(UpstreamOutcome::StateChanged)
            }
        }
    }

    fn on_opened(
        &mut self,
        writer: mpsc::Sender<String>,
        registry: &SubscriptionRegistry,
    ) -> Option<UpstreamOutcome> {
        let state = self.transition(LinkInput::Opened)?;
        self.writer = Some(writer);
        self.opened_at = Some(Utc::now());

        let replay = registry.all_subscriptions();
        tracing::info!(
            generation = self.generation,
            replayed = replay.len(),
            "Upstream link open"
        );
        for sub in &replay {
            if let Err(e) = self.send(SubscriptionRequest::subscribe(sub).to_json()) {
                tracing::warn!(subscription = %sub, error = %e, "Replay failed");
            }
        }
        metrics::record_upstream_state(state);
        Some(UpstreamOutcome::StateChanged(state))
    }

    fn on_frame(text: String) -> Option<UpstreamOutcome> {
        let kind = classify_upstream(&text);
        metrics::record_upstream_frame(&kind);
        match kind {
            FrameKind::Control => {
                tracing::trace!(frame = %text, "Upstream control frame");
                None
            }
            kind => Some(UpstreamOutcome::Forward { text, kind }),
        }
    }

    fn on_lost(&mut self, reason: &str, sessions: &SessionCounter) -> Option<UpstreamOutcome> {
        self.writer = None;
        self.link_cancel = None;
        self.opened_at = None;
        let state = self.transition(LinkInput::Lost)?;
        metrics::record_upstream_state(state);

        if sessions.active() == 0 {
            tracing::info!(reason, "Upstream link lost with no sessions, staying down");
            return Some(UpstreamOutcome::StateChanged(state));
        }

        match self.machine.next_retry(&self.config.backoff) {
            RetryDecision::RetryAfter { attempt, delay } => {
                tracing::warn!(
                    reason,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Upstream link lost, reconnecting"
                );
                metrics::record_reconnect_attempt();
                self.schedule_retry(delay);
                Some(UpstreamOutcome::StateChanged(state))
            }
            RetryDecision::GiveUp { attempts } => {
                tracing::error!(reason, attempts, "Upstream reconnect budget exhausted");
                Some(UpstreamOutcome::Abandoned { attempts })
            }
        }
    }

    fn start_link(&mut self) -> Option<LinkState> {
        let state = self.transition(LinkInput::Connect)?;
        self.generation += 1;

        let cancel = CancellationToken::new();
        self.link_cancel = Some(cancel.clone());
        tokio::spawn(
            LinkTask::new(
                Arc::clone(&self.connector),
                self.config.heartbeat,
                self.generation,
                self.events.clone(),
                cancel,
            )
            .run(),
        );

        tracing::debug!(generation = self.generation, "Upstream link starting");
        metrics::record_upstream_state(state);
        Some(state)
    }

    fn schedule_retry(&mut self, delay: std::time::Duration) {
        let cancel = CancellationToken::new();
        self.retry_cancel = Some(cancel.clone());

        let events = self.events.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = events.send(LinkEvent::RetryDue { generation }).await;
                }
            }
        });
    }

    fn cancel_retry(&mut self) {
        if let Some(cancel) = self.retry_cancel.take() {
            cancel.cancel();
        }
    }

    fn transition(&mut self, input: LinkInput) -> Option<LinkState> {
        match self.machine.apply(input) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring link event");
                None
            }
        }
    }
}

impl Drop for UpstreamManager {
    fn drop(&mut self) {
        self.cancel_retry();
        if let Some(cancel) = self.link_cancel.take() {
            cancel.cancel();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
