//! Client Sessions
//!
//! Per-session outbound state and the admission counter. Both are owned by
//! the relay hub; nothing else touches them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::SessionId;

/// Frame queued for a session, shared across every recipient of a broadcast.
pub type OutboundFrame = Arc<str>;

// =============================================================================
// Session Counter
// =============================================================================

/// Admission bookkeeping for one relay instance.
#[derive(Debug, Default, Clone)]
pub struct SessionCounter {
    active: usize,
    admitted_total: u64,
    rejected_total: u64,
    next_id: SessionId,
}

impl SessionCounter {
    /// Admit a session if fewer than `limit` are active.
    ///
    /// # Errors
    ///
    /// Returns the number of active sessions when the limit is reached.
    pub fn try_admit(&mut self, limit: usize) -> Result<SessionId, usize> {
        if self.active >= limit {
            self.rejected_total += 1;
            return Err(self.active);
        }

        self.active += 1;
        self.admitted_total += 1;
        self.next_id += 1;
        Ok(self.next_id)
    }

    /// Release an admitted session.
    pub const fn release(&mut self) {
        self.active = self.active.saturating_sub(1);
    }

    /// Sessions currently admitted.
    #[must_use]
    pub const fn active(&self) -> usize {
        self.active
    }

    /// Sessions admitted since start.
    #[must_use]
    pub const fn admitted_total(&self) -> u64 {
        self.admitted_total
    }

    /// Sessions refused since start.
    #[must_use]
    pub const fn rejected_total(&self) -> u64 {
        self.rejected_total
    }
}

// =============================================================================
// Client Session
// =============================================================================

/// Hub-side half of a downstream connection.
#[derive(Debug)]
pub struct ClientSession {
    id: SessionId,
    outbound: mpsc::Sender<OutboundFrame>,
    kicked: CancellationToken,
    admitted_at: DateTime<Utc>,
    dropped: u64,
}

/// Result of queueing a frame for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Frame queued.
    Queued,
    /// Queue full; frame not queued.
    Full,
    /// Socket side is gone.
    Closed,
}

impl ClientSession {
    /// Create a session and the socket-side [`ClientConnection`].
    #[must_use]
    pub fn open(id: SessionId, queue_capacity: usize) -> (Self, ClientConnection) {
        let (outbound, frames) = mpsc::channel(queue_capacity.max(1));
        let kicked = CancellationToken::new();

        let session = Self {
            id,
            outbound,
            kicked: kicked.clone(),
            admitted_at: Utc::now(),
            dropped: 0,
        };
        let connection = ClientConnection { id, frames, kicked };
        (session, connection)
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// When the session was admitted.
    #[must_use]
    pub const fn admitted_at(&self) -> DateTime<Utc> {
        self.admitted_at
    }

    /// Frames dropped for this session because its queue was full.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queue a frame without waiting.
    pub fn deliver(&mut self, frame: &OutboundFrame) -> Delivery {
        match self.outbound.try_send(Arc::clone(frame)) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped += 1;
                Delivery::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Tell the socket side to close.
    pub fn kick(&self) {
        self.kicked.cancel();
    }
}

/// Socket-side half of an admitted session.
#[derive(Debug)]
pub struct ClientConnection {
    /// Session identifier.
    pub id: SessionId,
    /// Frames to write to the socket, in order.
    pub frames: mpsc::Receiver<OutboundFrame>,
    /// Cancelled when the hub forces the session closed.
    pub kicked: CancellationToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_enforces_limit() {
        let mut counter = SessionCounter::default();

        assert_eq!(counter.try_admit(2), Ok(1));
        assert_eq!(counter.try_admit(2), Ok(2));
        assert_eq!(counter.try_admit(2), Err(2));
        assert_eq!(counter.rejected_total(), 1);

        counter.release();
        assert_eq!(counter.try_admit(2), Ok(3));
        assert_eq!(counter.admitted_total(), 3);
        assert_eq!(counter.active(), 2);
    }

    #[test]
    fn independent_counters_do_not_interfere() {
        let mut a = SessionCounter::default();
        let mut b = SessionCounter::default();

        a.try_admit(1).unwrap();
        assert!(a.try_admit(1).is_err());
        assert_eq!(b.try_admit(1), Ok(1));
    }

    #[test]
    fn release_never_underflows() {
        let mut counter = SessionCounter::default();
        counter.release();
        assert_eq!(counter.active(), 0);
    }

    #[tokio::test]
    async fn full_queue_counts_drops() {
        let (mut session, mut connection) = ClientSession::open(1, 1);
        let frame: OutboundFrame = Arc::from("a");

        assert_eq!(session.deliver(&frame), Delivery::Queued);
        assert_eq!(session.deliver(&frame), Delivery::Full);
        assert_eq!(session.dropped(), 1);

        assert_eq!(&*connection.frames.recv().await.unwrap(), "a");
        assert_eq!(session.deliver(&frame), Delivery::Queued);
    }

    #[tokio::test]
    async fn closed_socket_side_is_reported() {
        let (mut session, connection) = ClientSession::open(1, 4);
        drop(connection);
        assert_eq!(session.deliver(&Arc::from("a")), Delivery::Closed);
    }

    #[test]
    fn kick_cancels_connection_token() {
        let (session, connection) = ClientSession::open(7, 4);
        session.kick();
        assert!(connection.kicked.is_cancelled());
        assert_eq!(connection.id, 7);
    }
}
