//! Relay Hub
//!
//! Single task that owns every piece of shared relay state: the session
//! table, the admission counter, the subscription registry and the upstream
//! connection manager. Socket handlers talk to it through a cloneable
//! [`RelayHandle`]; the upstream link talks to it through link events. The
//! hub never awaits a client, so one slow consumer cannot stall the
//! upstream reader or any other session.
//!
//! # Data Flow
//!
//! ```text
//!                      ┌──────────── RelayHub ────────────┐
//! client ws ──cmd────► │  sessions   registry   upstream  │ ◄──events── link task ◄── upstream ws
//! client ws ◄─queue─── │                                  │ ──writer──► link task ──► upstream ws
//!                      └──────────────────────────────────┘
//! ```
//!
//! Everything a client sends is forwarded upstream verbatim except
//! subscribe, unsubscribe and ping intents, which the hub handles itself.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::session::{ClientConnection, ClientSession, Delivery, OutboundFrame, SessionCounter};
use crate::application::ports::UpstreamConnector;
use crate::domain::connection::LinkState;
use crate::domain::frame::{
    ClientIntent, FrameKind, StatusFrame, error_frame, parse_client_intent, pong_frame,
};
use crate::domain::subscription::{SessionId, SubscriptionChanges, SubscriptionRegistry};
use crate::infrastructure::config::{BackpressurePolicy, ServerSettings};
use crate::infrastructure::kraken::messages::SubscriptionRequest;
use crate::infrastructure::metrics;
use crate::infrastructure::upstream::{
    LinkEvent, UpstreamConfig, UpstreamManager, UpstreamOutcome,
};

const COMMAND_CAPACITY: usize = 1024;
const LINK_EVENT_CAPACITY: usize = 4096;

// =============================================================================
// Settings and Errors
// =============================================================================

/// Fan-out limits.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Maximum concurrent sessions.
    pub max_clients: usize,
    /// Per-session outbound queue capacity.
    pub queue_capacity: usize,
    /// What to do with a full queue.
    pub backpressure: BackpressurePolicy,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for RelaySettings {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            max_clients: settings.max_clients,
            queue_capacity: settings.client_queue_capacity,
            backpressure: settings.backpressure,
        }
    }
}

/// Errors returned through a [`RelayHandle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Admission control refused the session.
    #[error("capacity exceeded: {limit} clients already connected")]
    CapacityExceeded {
        /// Configured maximum.
        limit: usize,
    },
    /// The hub has stopped.
    #[error("relay is shutting down")]
    Unavailable,
}

/// Point-in-time view of the hub.
#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    /// Connected sessions.
    pub clients: usize,
    /// Configured session limit.
    pub max_clients: usize,
    /// Distinct subscriptions held upstream.
    pub subscriptions: usize,
    /// Upstream link state.
    pub upstream_state: LinkState,
    /// Reconnect attempts since the last successful open.
    pub reconnect_attempts: u32,
    /// Whether the reconnect budget ran out.
    pub upstream_abandoned: bool,
    /// When the current upstream link opened.
    pub upstream_opened_at: Option<DateTime<Utc>>,
    /// Sessions admitted since start.
    pub admitted_total: u64,
    /// Sessions refused since start.
    pub rejected_total: u64,
}

// =============================================================================
// Handle
// =============================================================================

enum Command {
    Connect {
        reply: oneshot::Sender<Result<ClientConnection, RelayError>>,
    },
    Message {
        session: SessionId,
        text: String,
    },
    Disconnect {
        session: SessionId,
    },
    Snapshot {
        reply: oneshot::Sender<RelaySnapshot>,
    },
}

/// Cloneable handle to a running hub.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect { .. } => f.write_str("Connect"),
            Self::Message { session, .. } => write!(f, "Message({session})"),
            Self::Disconnect { session } => write!(f, "Disconnect({session})"),
            Self::Snapshot { .. } => f.write_str("Snapshot"),
        }
    }
}

impl RelayHandle {
    /// Ask for admission.
    ///
    /// On success the session has already been sent a status frame.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::CapacityExceeded`] when the relay is full and
    /// [`RelayError::Unavailable`] when it has stopped.
    pub async fn connect(&self) -> Result<ClientConnection, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { reply })
            .await
            .map_err(|_| RelayError::Unavailable)?;
        rx.await.map_err(|_| RelayError::Unavailable)?
    }

    /// Deliver a client text frame.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Unavailable`] when the hub has stopped.
    pub async fn client_message(&self, session: SessionId, text: String) -> Result<(), RelayError> {
        self.commands
            .send(Command::Message { session, text })
            .await
            .map_err(|_| RelayError::Unavailable)
    }

    /// Remove a session. Safe to call more than once.
    pub async fn disconnect(&self, session: SessionId) {
        let _ = self.commands.send(Command::Disconnect { session }).await;
    }

    /// Current hub state.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Unavailable`] when the hub has stopped.
    pub async fn snapshot(&self) -> Result<RelaySnapshot, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| RelayError::Unavailable)?;
        rx.await.map_err(|_| RelayError::Unavailable)
    }
}

// =============================================================================
// Hub
// =============================================================================

/// The fan-out router task.
pub struct RelayHub {
    settings: RelaySettings,
    sessions: HashMap<SessionId, ClientSession>,
    counter: SessionCounter,
    registry: SubscriptionRegistry,
    upstream: UpstreamManager,
    commands: mpsc::Receiver<Command>,
    link_events: mpsc::Receiver<LinkEvent>,
    cancel: CancellationToken,
}

impl RelayHub {
    /// Spawn a hub; it runs until `cancel` fires.
    #[must_use]
    pub fn spawn(
        settings: RelaySettings,
        upstream: UpstreamConfig,
        connector: Arc<dyn UpstreamConnector>,
        cancel: CancellationToken,
    ) -> (RelayHandle, JoinHandle<()>) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (link_tx, link_events) = mpsc::channel(LINK_EVENT_CAPACITY);

        let hub = Self {
            settings,
            sessions: HashMap::new(),
            counter: SessionCounter::default(),
            registry: SubscriptionRegistry::new(),
            upstream: UpstreamManager::new(connector, upstream, link_tx),
            commands,
            link_events,
            cancel,
        };

        let handle = RelayHandle {
            commands: commands_tx,
        };
        (handle, tokio::spawn(hub.run()))
    }

    async fn run(mut self) {
        tracing::info!(
            max_clients = self.settings.max_clients,
            queue_capacity = self.settings.queue_capacity,
            backpressure = self.settings.backpressure.as_str(),
            "Relay hub started"
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some(event) = self.link_events.recv() => self.handle_link_event(event),
            }
        }

        for session in self.sessions.values() {
            session.kick();
        }
        self.upstream.shutdown();
        tracing::info!("Relay hub stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                let result = self.on_connect();
                if let Err(Ok(connection)) = reply.send(result) {
                    // Caller went away before admission completed.
                    self.on_disconnect(connection.id);
                }
            }
            Command::Message { session, text } => self.on_message(session, &text),
            Command::Disconnect { session } => self.on_disconnect(session),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // -------------------------------------------------------------------------
    // Client side
    // -------------------------------------------------------------------------

    fn on_connect(&mut self) -> Result<ClientConnection, RelayError> {
        let limit = self.settings.max_clients;
        let id = self.counter.try_admit(limit).map_err(|active| {
            tracing::warn!(active, limit, "Rejecting client: capacity exceeded");
            metrics::record_admission_rejected();
            RelayError::CapacityExceeded { limit }
        })?;

        let (session, connection) = ClientSession::open(id, self.settings.queue_capacity);
        self.sessions.insert(id, session);
        metrics::set_active_clients(self.counter.active());
        tracing::info!(session = id, active = self.counter.active(), "Client admitted");

        // A state change is pushed to everyone, the new session included.
        if let Some(state) = self.upstream.ensure_connected() {
            self.broadcast_status(StatusFrame::new(state));
        } else {
            let status: OutboundFrame = StatusFrame::new(self.upstream.state()).to_json().into();
            self.deliver_to(std::iter::once(id), &status);
        }

        Ok(connection)
    }

    fn on_message(&mut self, session: SessionId, text: &str) {
        if !self.sessions.contains_key(&session) {
            return;
        }

        match parse_client_intent(text) {
            Ok(ClientIntent::Subscribe(subs)) => {
                let changes = self.registry.add_subscriptions(session, &subs);
                tracing::debug!(
                    session,
                    requested = subs.len(),
                    new = changes.subscribe.len(),
                    "Subscribe"
                );
                self.apply_changes(&changes);
                if let Some(state) = self.upstream.ensure_connected() {
                    self.broadcast_status(StatusFrame::new(state));
                }
            }
            Ok(ClientIntent::Unsubscribe(subs)) => {
                let changes = self.registry.remove_subscriptions(session, &subs);
                tracing::debug!(
                    session,
                    requested = subs.len(),
                    released = changes.unsubscribe.len(),
                    "Unsubscribe"
                );
                self.apply_changes(&changes);
            }
            Ok(ClientIntent::Ping { reqid }) => {
                self.deliver_to(std::iter::once(session), &pong_frame(reqid).into());
            }
            Ok(ClientIntent::Passthrough) => {
                if let Err(e) = self.upstream.send(text.to_string()) {
                    tracing::debug!(session, error = %e, "Passthrough refused");
                    self.deliver_to(std::iter::once(session), &error_frame(&e.to_string()).into());
                }
            }
            Err(e) => {
                tracing::debug!(session, error = %e, "Malformed client intent");
                self.deliver_to(std::iter::once(session), &error_frame(&e.to_string()).into());
            }
        }
    }

    fn on_disconnect(&mut self, session: SessionId) {
        let Some(removed) = self.sessions.remove(&session) else {
            return;
        };
        removed.kick();
        self.counter.release();

        let changes = self.registry.remove_session(session);
        self.apply_changes(&changes);

        metrics::set_active_clients(self.counter.active());
        tracing::info!(
            session,
            active = self.counter.active(),
            dropped = removed.dropped(),
            "Client disconnected"
        );

        if self.counter.active() == 0 && self.upstream.shutdown().is_some() {
            tracing::info!("Last client left, upstream link closing");
        }
    }

    /// Forward first-subscriber and last-subscriber changes upstream.
    ///
    /// While the link is down nothing is sent: the registry is replayed on open.
    fn apply_changes(&self, changes: &SubscriptionChanges) {
        metrics::set_subscriptions(self.registry.stats().subscription_count);
        if self.upstream.state() != LinkState::Open {
            return;
        }

        let frames = changes
            .subscribe
            .iter()
            .map(|sub| (sub, SubscriptionRequest::subscribe(sub)))
            .chain(
                changes
                    .unsubscribe
                    .iter()
                    .map(|sub| (sub, SubscriptionRequest::unsubscribe(sub))),
            );

        for (sub, request) in frames {
            if let Err(e) = self.upstream.send(request.to_json()) {
                tracing::warn!(
                    subscription = %sub,
                    event = request.event,
                    error = %e,
                    "Upstream request not sent"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Upstream side
    // -------------------------------------------------------------------------

    fn handle_link_event(&mut self, event: LinkEvent) {
        let Some(outcome) = self
            .upstream
            .handle_event(event, &self.counter, &self.registry)
        else {
            return;
        };

        match outcome {
            UpstreamOutcome::StateChanged(state) => self.broadcast_status(StatusFrame::new(state)),
            UpstreamOutcome::Forward { text, kind } => self.route(text, &kind),
            UpstreamOutcome::Abandoned { attempts } => {
                let status = StatusFrame::new(self.upstream.state()).with_error(format!(
                    "connection abandoned after {attempts} reconnect attempts"
                ));
                self.broadcast_status(status);
            }
        }
    }

    fn route(&mut self, text: String, kind: &FrameKind) {
        let recipients: Vec<SessionId> = match kind {
            FrameKind::Data { channel, target } => self
                .registry
                .subscribers_matching(channel, target)
                .into_iter()
                .collect(),
            FrameKind::Error {
                target: Some(target),
                ..
            } => self.registry.subscribers_of_target(target).into_iter().collect(),
            FrameKind::Error { target: None, .. } => self.sessions.keys().copied().collect(),
            FrameKind::Control => return,
        };

        if !recipients.is_empty() {
            self.deliver_to(recipients, &text.into());
        }
    }

    // -------------------------------------------------------------------------
    // Delivery
    // -------------------------------------------------------------------------

    fn broadcast_status(&mut self, status: StatusFrame) {
        let all: Vec<SessionId> = self.sessions.keys().copied().collect();
        self.deliver_to(all, &status.to_json().into());
    }

    /// Queue `frame` for each recipient without waiting on any of them.
    fn deliver_to(
        &mut self,
        recipients: impl IntoIterator<Item = SessionId>,
        frame: &OutboundFrame,
    ) {
        let mut evict = Vec::new();

        for id in recipients {
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };

            match session.deliver(frame) {
                Delivery::Queued => metrics::record_frame_sent(),
                Delivery::Full => {
                    metrics::record_frame_dropped();
                    if self.settings.backpressure == BackpressurePolicy::Disconnect {
                        tracing::warn!(session = id, "Client queue full, disconnecting");
                        evict.push(id);
                    } else {
                        tracing::trace!(session = id, "Client queue full, frame dropped");
                    }
                }
                Delivery::Closed => evict.push(id),
            }
        }

        for id in evict {
            self.on_disconnect(id);
        }
    }

    fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            clients: self.counter.active(),
            max_clients: self.settings.max_clients,
            subscriptions: self.registry.stats().subscription_count,
            upstream_state: self.upstream.state(),
            reconnect_attempts: self.upstream.reconnect_attempts(),
            upstream_abandoned: self.upstream.gave_up(),
            upstream_opened_at: self.upstream.opened_at(),
            admitted_total: self.counter.admitted_total(),
            rejected_total: self.counter.rejected_total(),
        }
    }
}
