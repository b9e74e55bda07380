//! Upstream Connection
//!
//! The single shared link to the exchange feed: lifecycle and reconnect
//! decisions in [`UpstreamManager`], transport I/O in the link task, and
//! liveness in the heartbeat monitor.

pub mod heartbeat;
mod link;
mod manager;

pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
pub use link::{LinkEvent, LinkTask, WRITER_CAPACITY};
pub use manager::{UpstreamConfig, UpstreamError, UpstreamManager, UpstreamOutcome};

use crate::infrastructure::config::UpstreamSettings;

impl From<&UpstreamSettings> for UpstreamConfig {
    fn from(settings: &UpstreamSettings) -> Self {
        Self {
            backoff: settings.backoff(),
            max_attempts: settings.max_reconnect_attempts,
            heartbeat: HeartbeatConfig::from_upstream_settings(settings),
        }
    }
}
