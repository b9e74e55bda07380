//! Upstream Link Task
//!
//! Owns one transport for its whole life: opens it, pumps frames to the
//! connection manager, writes queued outbound frames, sends keep-alive pings
//! and closes it on request. The task never decides whether to reconnect;
//! it only reports what happened, tagged with its generation so the manager
//! can ignore a link it has already replaced.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
use crate::application::ports::{TransportFrame, UpstreamConnector, UpstreamTransport};
use crate::infrastructure::kraken::messages::PingRequest;

/// Outbound frames a link buffers before `send` reports backlog.
pub const WRITER_CAPACITY: usize = 1024;

/// Events reported to the connection manager.
#[derive(Debug)]
pub enum LinkEvent {
    /// Transport opened; frames for upstream go to `writer`.
    Opened {
        /// Link generation.
        generation: u64,
        /// Outbound queue of the open transport.
        writer: mpsc::Sender<String>,
    },
    /// A text frame arrived.
    Frame {
        /// Link generation.
        generation: u64,
        /// Payload, verbatim.
        text: String,
    },
    /// The transport failed, closed unexpectedly, or never opened.
    Lost {
        /// Link generation.
        generation: u64,
        /// What went wrong.
        reason: String,
    },
    /// Requested close finished.
    Closed {
        /// Link generation.
        generation: u64,
    },
    /// A scheduled reconnect is due.
    RetryDue {
        /// Generation of the link whose loss scheduled the retry.
        generation: u64,
    },
}

impl LinkEvent {
    /// Generation the event belongs to.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        match self {
            Self::Opened { generation, .. }
            | Self::Frame { generation, .. }
            | Self::Lost { generation, .. }
            | Self::Closed { generation }
            | Self::RetryDue { generation } => *generation,
        }
    }
}

/// One upstream connection attempt and, if it opens, its lifetime.
pub struct LinkTask {
    connector: Arc<dyn UpstreamConnector>,
    heartbeat: HeartbeatConfig,
    generation: u64,
    events: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
}

impl LinkTask {
    /// Create a link task.
    #[must_use]
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        heartbeat: HeartbeatConfig,
        generation: u64,
        events: mpsc::Sender<LinkEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            heartbeat,
            generation,
            events,
            cancel,
        }
    }

    /// Run the link to completion.
    pub async fn run(self) {
        let generation = self.generation;

        let connected = tokio::select! {
            () = self.cancel.cancelled() => {
                self.report(LinkEvent::Closed { generation }).await;
                return;
            }
            result = self.connector.connect() => result,
        };

        let transport = match connected {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(generation, error = %e, "Upstream connect failed");
                self.report(LinkEvent::Lost {
                    generation,
                    reason: e.to_string(),
                })
                .await;
                return;
            }
        };

        let (writer, writer_rx) = mpsc::channel(WRITER_CAPACITY);
        self.report(LinkEvent::Opened { generation, writer }).await;

        let event = self.pump(transport, writer_rx).await;
        self.report(event).await;
    }

    /// Drive an open transport until it ends; returns the final event.
    async fn pump(
        &self,
        mut transport: Box<dyn UpstreamTransport>,
        mut writer_rx: mpsc::Receiver<String>,
    ) -> LinkEvent {
        let generation = self.generation;
        let heartbeat_state = Arc::new(HeartbeatState::new());
        let heartbeat_cancel = self.cancel.child_token();
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(4);
        tokio::spawn(
            HeartbeatMonitor::new(
                self.heartbeat,
                Arc::clone(&heartbeat_state),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );

        let mut next_reqid: u64 = 1;
        let event = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    transport.close().await;
                    break LinkEvent::Closed { generation };
                }
                frame = transport.recv() => {
                    heartbeat_state.record_activity();
                    match frame {
                        Some(Ok(TransportFrame::Text(text))) => {
                            self.report(LinkEvent::Frame { generation, text }).await;
                        }
                        Some(Ok(TransportFrame::Alive)) => {}
                        Some(Err(e)) => {
                            break LinkEvent::Lost { generation, reason: e.to_string() };
                        }
                        None => {
                            break LinkEvent::Lost {
                                generation,
                                reason: "transport ended".to_string(),
                            };
                        }
                    }
                }
                Some(text) = writer_rx.recv() => {
                    if let Err(e) = transport.send(text).await {
                        break LinkEvent::Lost { generation, reason: e.to_string() };
                    }
                }
                Some(heartbeat) = heartbeat_rx.recv() => match heartbeat {
                    HeartbeatEvent::SendPing => {
                        let ping = PingRequest::new(next_reqid);
                        next_reqid += 1;
                        if let Err(e) = transport.send(ping.to_json()).await {
                            break LinkEvent::Lost { generation, reason: e.to_string() };
                        }
                    }
                    HeartbeatEvent::Timeout { silent_for } => {
                        transport.close().await;
                        break LinkEvent::Lost {
                            generation,
                            reason: format!("no traffic for {}s", silent_for.as_secs()),
                        };
                    }
                },
            }
        };

        heartbeat_cancel.cancel();
        event
    }

    async fn report(&self, event: LinkEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!(generation = self.generation, "Link event receiver dropped");
        }
    }
}
