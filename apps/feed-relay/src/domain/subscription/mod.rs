//! Subscription Registry
//!
//! Tracks which downstream sessions want which upstream streams.
//!
//! # Design
//!
//! The registry tracks:
//! - The set of subscriptions each session holds
//! - The set of sessions behind each distinct subscription
//!
//! The subscriber set doubles as a reference count: a subscription is
//! requested upstream when its first subscriber arrives and withdrawn when
//! the last one leaves. The registry is the only record of what should be
//! subscribed upstream, so reconnect replay reads [`SubscriptionRegistry::all_subscriptions`].

use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a downstream session.
pub type SessionId = u64;

/// A feed stream: channel name, optional interval and target symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subscription {
    /// Channel name (`ohlc`, `ticker`, `trade`, ...).
    pub name: String,
    /// Channel interval in minutes, where the channel takes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
    /// Target symbol (`XBT/USD`).
    pub target: String,
}

impl Subscription {
    /// Create a subscription.
    #[must_use]
    pub fn new(name: impl Into<String>, interval: Option<u32>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval,
            target: target.into(),
        }
    }

    /// Whether a data frame on `channel` for `target` belongs to this subscription.
    ///
    /// Without an interval the subscription accepts the bare channel or the
    /// interval upstream assigns by default, never another session's interval.
    #[must_use]
    pub fn matches(&self, channel: &Channel, target: &str) -> bool {
        if self.name != channel.name || self.target != target {
            return false;
        }

        match self.interval {
            Some(interval) => channel.interval == Some(interval),
            None => {
                channel.interval.is_none() || channel.interval == default_interval(&self.name)
            }
        }
    }
}

/// Interval upstream applies to a channel subscribed without one.
fn default_interval(name: &str) -> Option<u32> {
    match name {
        "ohlc" => Some(1),
        "book" => Some(10),
        _ => None,
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.interval {
            Some(interval) => write!(f, "{}-{interval}:{}", self.name, self.target),
            None => write!(f, "{}:{}", self.name, self.target),
        }
    }
}

/// Channel identifier as it appears in upstream data frames.
///
/// `"ohlc-5"` carries an interval; `"ticker"` does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    /// Channel name.
    pub name: String,
    /// Numeric suffix, if any.
    pub interval: Option<u32>,
}

impl Channel {
    /// Parse a channel string from a data frame.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if let Some((name, suffix)) = raw.rsplit_once('-')
            && let Ok(interval) = suffix.parse::<u32>()
        {
            return Self {
                name: name.to_string(),
                interval: Some(interval),
            };
        }

        Self {
            name: raw.to_string(),
            interval: None,
        }
    }
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes to apply upstream after a registry mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Subscriptions whose first subscriber just arrived.
    pub subscribe: Vec<Subscription>,
    /// Subscriptions whose last subscriber just left.
    pub unsubscribe: Vec<Subscription>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    /// Subscriptions held by each session.
    by_session: HashMap<SessionId, HashSet<Subscription>>,
    /// Sessions behind each distinct subscription.
    subscribers: HashMap<Subscription, HashSet<SessionId>>,
}

impl RegistryState {
    fn add(&mut self, session: SessionId, subs: &[Subscription]) -> Vec<Subscription> {
        let session_set = self.by_session.entry(session).or_default();
        let mut first = Vec::new();

        for sub in subs {
            if !session_set.insert(sub.clone()) {
                continue;
            }

            let sessions = self.subscribers.entry(sub.clone()).or_default();
            sessions.insert(session);
            if sessions.len() == 1 {
                first.push(sub.clone());
            }
        }

        if session_set.is_empty() {
            self.by_session.remove(&session);
        }

        first
    }

    fn remove(&mut self, session: SessionId, subs: &[Subscription]) -> Vec<Subscription> {
        let Some(session_set) = self.by_session.get_mut(&session) else {
            return vec![];
        };

        let mut last = Vec::new();
        for sub in subs {
            if !session_set.remove(sub) {
                continue;
            }
            if Self::release(&mut self.subscribers, session, sub) {
                last.push(sub.clone());
            }
        }

        if session_set.is_empty() {
            self.by_session.remove(&session);
        }

        last
    }

    fn remove_session(&mut self, session: SessionId) -> Vec<Subscription> {
        let Some(session_set) = self.by_session.remove(&session) else {
            return vec![];
        };

        let mut last: Vec<_> = session_set
            .into_iter()
            .filter(|sub| Self::release(&mut self.subscribers, session, sub))
            .collect();
        last.sort();
        last
    }

    /// Drop `session` from `sub`'s subscribers; true when none remain.
    fn release(
        subscribers: &mut HashMap<Subscription, HashSet<SessionId>>,
        session: SessionId,
        sub: &Subscription,
    ) -> bool {
        let Some(sessions) = subscribers.get_mut(sub) else {
            return false;
        };
        sessions.remove(&session);
        if sessions.is_empty() {
            subscribers.remove(sub);
            return true;
        }
        false
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Reference-counted registry of downstream subscriptions.
///
/// # Example
///
/// ```rust
/// use feed_relay::domain::subscription::{Subscription, SubscriptionRegistry};
///
/// let registry = SubscriptionRegistry::new();
/// let ohlc = Subscription::new("ohlc", Some(5), "XBT/USD");
///
/// // First subscriber - subscribe upstream
/// let changes = registry.add_subscriptions(1, &[ohlc.clone()]);
/// assert_eq!(changes.subscribe, vec![ohlc.clone()]);
///
/// // Second subscriber - nothing to do upstream
/// assert!(registry.add_subscriptions(2, &[ohlc.clone()]).is_empty());
///
/// // Session 1 leaves - session 2 still holds it
/// assert!(registry.remove_session(1).is_empty());
///
/// // Last subscriber leaves - unsubscribe upstream
/// let changes = registry.remove_subscriptions(2, &[ohlc.clone()]);
/// assert_eq!(changes.unsubscribe, vec![ohlc]);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add subscriptions for a session. Idempotent per (session, subscription).
    pub fn add_subscriptions(&self, session: SessionId, subs: &[Subscription]) -> SubscriptionChanges {
        SubscriptionChanges {
            subscribe: self.state.write().add(session, subs),
            unsubscribe: Vec::new(),
        }
    }

    /// Remove subscriptions for a session.
    pub fn remove_subscriptions(
        &self,
        session: SessionId,
        subs: &[Subscription],
    ) -> SubscriptionChanges {
        SubscriptionChanges {
            subscribe: Vec::new(),
            unsubscribe: self.state.write().remove(session, subs),
        }
    }

    /// Remove every subscription a session holds.
    pub fn remove_session(&self, session: SessionId) -> SubscriptionChanges {
        SubscriptionChanges {
            subscribe: Vec::new(),
            unsubscribe: self.state.write().remove_session(session),
        }
    }

    /// Every subscription with at least one subscriber, sorted.
    #[must_use]
    pub fn all_subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<_> = self.state.read().subscribers.keys().cloned().collect();
        subs.sort();
        subs
    }

    /// Subscriptions held by one session, sorted.
    #[must_use]
    pub fn session_subscriptions(&self, session: SessionId) -> Vec<Subscription> {
        let mut subs: Vec<_> = self
            .state
            .read()
            .by_session
            .get(&session)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        subs.sort();
        subs
    }

    /// Number of sessions holding `sub`.
    #[must_use]
    pub fn subscriber_count(&self, sub: &Subscription) -> usize {
        self.state.read().subscribers.get(sub).map_or(0, HashSet::len)
    }

    /// Sessions subscribed to data arriving on `channel` for `target`.
    #[must_use]
    pub fn subscribers_matching(&self, channel: &Channel, target: &str) -> HashSet<SessionId> {
        self.state
            .read()
            .subscribers
            .iter()
            .filter(|(sub, _)| sub.matches(channel, target))
            .flat_map(|(_, sessions)| sessions.iter().copied())
            .collect()
    }

    /// Sessions holding any subscription for `target`.
    #[must_use]
    pub fn subscribers_of_target(&self, target: &str) -> HashSet<SessionId> {
        self.state
            .read()
            .subscribers
            .iter()
            .filter(|(sub, _)| sub.target == target)
            .flat_map(|(_, sessions)| sessions.iter().copied())
            .collect()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let state = self.state.read();
        SubscriptionStats {
            subscription_count: state.subscribers.len(),
            session_count: state.by_session.len(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    /// Distinct subscriptions with at least one subscriber.
    pub subscription_count: usize,
    /// Sessions holding at least one subscription.
    pub session_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
