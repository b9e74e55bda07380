//! Link Lifecycle State Machine
//!
//! Connection state shared by the upstream connection manager and the
//! client-side mirror. Transitions are an explicit table so the reconnect
//! logic can be exercised without a transport.
//!
//! ```text
//!              Connect               Opened
//! Disconnected ───────► Connecting ─────────► Open
//!      ▲                 │    │                │ │
//!      │      Lost       │    │ Close   Close  │ │ Lost
//!      ├─────────────────┘    ▼                ▼ │
//!      │                   Closing ◄───────────┘ │
//!      │   Closed / Lost      │                  │
//!      ├──────────────────────┘                  │
//!      └─────────────────────────────────────────┘
//! ```

mod backoff;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use backoff::{BackoffPolicy, DEFAULT_JITTER_FACTOR};

/// Connection state of a streaming link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// No transport, no connection attempt in flight.
    #[default]
    Disconnected,
    /// Transport is being established.
    Connecting,
    /// Transport is established and usable.
    Open,
    /// Transport is being torn down on request.
    Closing,
}

impl LinkState {
    /// Lowercase name used in status frames and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }

    /// Whether a connection exists or is being established.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive the link state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkInput {
    /// Start opening a transport.
    Connect,
    /// Transport finished opening.
    Opened,
    /// Transport failed or closed without being asked to.
    Lost,
    /// Owner asked for the transport to close.
    Close,
    /// Requested close finished.
    Closed,
}

/// Rejected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid link transition: {input:?} while {from}")]
pub struct TransitionError {
    /// State the machine was in.
    pub from: LinkState,
    /// Input that was rejected.
    pub input: LinkInput,
}

/// Transition table.
const fn transition(from: LinkState, input: LinkInput) -> Option<LinkState> {
    use LinkInput as I;
    use LinkState as S;

    match (from, input) {
        (S::Disconnected | S::Closing, I::Connect) => Some(S::Connecting),
        (S::Connecting, I::Opened) => Some(S::Open),
        (S::Connecting | S::Open | S::Closing, I::Lost) | (S::Closing, I::Closed) => {
            Some(S::Disconnected)
        }
        (S::Connecting | S::Open, I::Close) => Some(S::Closing),
        (S::Disconnected, I::Close) => Some(S::Disconnected),
        _ => None,
    }
}

/// Reconnection bookkeeping, reset on every successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconnectState {
    /// Reconnection attempts since the last successful open.
    pub attempts: u32,
    /// Delay scheduled for the pending attempt, if any.
    pub next_delay: Option<Duration>,
    /// Attempt budget (0 = unlimited).
    pub max_attempts: u32,
    /// Set once the budget is exhausted.
    pub gave_up: bool,
}

impl ReconnectState {
    /// Create state with an attempt budget.
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            next_delay: None,
            max_attempts,
            gave_up: false,
        }
    }

    /// Clear counters, keeping the budget.
    pub const fn reset(&mut self) {
        *self = Self::new(self.max_attempts);
    }
}

/// What to do after an unexpected loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`; `attempt` is one-based.
    RetryAfter {
        /// Attempt number being scheduled.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Budget exhausted after `attempts` retries.
    GiveUp {
        /// Retries that were made.
        attempts: u32,
    },
}

/// Link lifecycle plus reconnect accounting.
#[derive(Debug, Clone)]
pub struct LinkStateMachine {
    state: LinkState,
    reconnect: ReconnectState,
}

impl LinkStateMachine {
    /// Create a disconnected machine.
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            state: LinkState::Disconnected,
            reconnect: ReconnectState::new(max_attempts),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Reconnection bookkeeping.
    #[must_use]
    pub const fn reconnect(&self) -> &ReconnectState {
        &self.reconnect
    }

    /// Apply an input.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if the table has no entry for the pair;
    /// the state is left unchanged.
    pub fn apply(&mut self, input: LinkInput) -> Result<LinkState, TransitionError> {
        let next = transition(self.state, input).ok_or(TransitionError {
            from: self.state,
            input,
        })?;

        if input == LinkInput::Opened {
            self.reconnect.reset();
        }
        self.state = next;
        Ok(next)
    }

    /// Decide whether to retry after a loss, consuming one attempt.
    pub fn next_retry(&mut self, policy: &BackoffPolicy) -> RetryDecision {
        let budget = self.reconnect.max_attempts;
        if budget > 0 && self.reconnect.attempts >= budget {
            self.reconnect.gave_up = true;
            self.reconnect.next_delay = None;
            return RetryDecision::GiveUp {
                attempts: self.reconnect.attempts,
            };
        }

        let delay = policy.next_delay(self.reconnect.attempts);
        self.reconnect.attempts += 1;
        self.reconnect.next_delay = Some(delay);

        RetryDecision::RetryAfter {
            attempt: self.reconnect.attempts,
            delay,
        }
    }

    /// Forget previous failures, e.g. when a fresh consumer asks for a link.
    pub const fn reset_reconnect(&mut self) {
        self.reconnect.reset();
    }
}
