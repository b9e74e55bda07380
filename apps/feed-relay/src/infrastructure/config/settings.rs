//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.
//! Unparseable numbers fall back to their defaults; malformed URLs and
//! zero-sized limits are rejected.

use std::time::Duration;

use reqwest::Url;

use crate::domain::connection::BackoffPolicy;

/// What to do when a session's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Drop the frame for that session only.
    #[default]
    Drop,
    /// Remove the session and close its socket.
    Disconnect,
}

impl BackpressurePolicy {
    /// Parse policy from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "disconnect" => Self::Disconnect,
            _ => Self::Drop,
        }
    }

    /// Get the policy name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Downstream server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// HTTP port for `/ws`, the query proxy and health endpoints.
    pub port: u16,
    /// Maximum concurrent client sessions.
    pub max_clients: usize,
    /// Per-session outbound queue capacity.
    pub client_queue_capacity: usize,
    /// Full-queue policy.
    pub backpressure: BackpressurePolicy,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            max_clients: 20,
            client_queue_capacity: 256,
            backpressure: BackpressurePolicy::Drop,
        }
    }
}

/// Upstream streaming link settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Upstream WebSocket address.
    pub ws_url: String,
    /// Keep-alive ping interval.
    pub heartbeat_interval: Duration,
    /// Silence tolerated before the link is force-closed.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_base: Duration,
    /// Maximum reconnection delay.
    pub reconnect_max: Duration,
    /// Reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws.kraken.com".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(10),
            max_reconnect_attempts: 5,
        }
    }
}

impl UpstreamSettings {
    /// Backoff policy built from the reconnect delays.
    #[must_use]
    pub const fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.reconnect_base, self.reconnect_max)
    }
}

/// Point-in-time query gateway settings.
#[derive(Debug, Clone)]
pub struct RestSettings {
    /// Base URL of the public REST API.
    pub base_url: String,
    /// Requests admitted per endpoint per minute.
    pub quota_per_minute: usize,
    /// Retries after throttling or network failures.
    pub max_retries: u32,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.kraken.com/0/public".to_string(),
            quota_per_minute: 15,
            max_retries: 3,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// Downstream server settings.
    pub server: ServerSettings,
    /// Upstream link settings.
    pub upstream: UpstreamSettings,
    /// Query gateway settings.
    pub rest: RestSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL is malformed or a limit is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL is malformed or a limit is zero.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let server_defaults = ServerSettings::default();
        let upstream_defaults = UpstreamSettings::default();
        let rest_defaults = RestSettings::default();

        let server = ServerSettings {
            port: env.parse("RELAY_PORT", server_defaults.port),
            max_clients: env.nonzero("RELAY_MAX_CLIENTS", server_defaults.max_clients)?,
            client_queue_capacity: env.nonzero(
                "RELAY_CLIENT_QUEUE_CAPACITY",
                server_defaults.client_queue_capacity,
            )?,
            backpressure: env
                .get("RELAY_BACKPRESSURE")
                .map(|s| BackpressurePolicy::from_str_case_insensitive(&s))
                .unwrap_or_default(),
        };

        let upstream = UpstreamSettings {
            ws_url: env.url("RELAY_UPSTREAM_WS_URL", &["ws", "wss"], upstream_defaults.ws_url)?,
            heartbeat_interval: env.nonzero_secs(
                "RELAY_HEARTBEAT_INTERVAL_SECS",
                upstream_defaults.heartbeat_interval,
            )?,
            heartbeat_timeout: env.nonzero_secs(
                "RELAY_HEARTBEAT_TIMEOUT_SECS",
                upstream_defaults.heartbeat_timeout,
            )?,
            reconnect_base: env
                .get("RELAY_RECONNECT_BASE_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(upstream_defaults.reconnect_base, Duration::from_millis),
            reconnect_max: env.secs("RELAY_RECONNECT_MAX_SECS", upstream_defaults.reconnect_max),
            max_reconnect_attempts: env.parse(
                "RELAY_RECONNECT_MAX_ATTEMPTS",
                upstream_defaults.max_reconnect_attempts,
            ),
        };

        let rest = RestSettings {
            base_url: env.url(
                "RELAY_UPSTREAM_REST_URL",
                &["http", "https"],
                rest_defaults.base_url,
            )?,
            quota_per_minute: env.nonzero(
                "RELAY_REST_QUOTA_PER_MINUTE",
                rest_defaults.quota_per_minute,
            )?,
            max_retries: env.parse("RELAY_REST_MAX_RETRIES", rest_defaults.max_retries),
            timeout: env.nonzero_secs("RELAY_REST_TIMEOUT_SECS", rest_defaults.timeout)?,
        };

        Ok(Self {
            server,
            upstream,
            rest,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// URL could not be parsed or has the wrong scheme.
    #[error("invalid URL in {key}: {value} ({reason})")]
    InvalidUrl {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
        /// Parse failure or scheme mismatch.
        reason: String,
    },
    /// Limit must be greater than zero.
    #[error("environment variable {0} must be greater than zero")]
    ZeroValue(String),
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn nonzero_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.secs(key, default) {
            d if d.is_zero() => Err(ConfigError::ZeroValue(key.to_string())),
            d => Ok(d),
        }
    }

    fn nonzero(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        match self.parse(key, default) {
            0 => Err(ConfigError::ZeroValue(key.to_string())),
            n => Ok(n),
        }
    }

    fn url(&self, key: &str, schemes: &[&str], default: String) -> Result<String, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };

        let invalid = |reason: String| ConfigError::InvalidUrl {
            key: key.to_string(),
            value: raw.clone(),
            reason,
        };

        let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
        if !schemes.contains(&url.scheme()) {
            return Err(invalid(format!("expected scheme {}", schemes.join("/"))));
        }
        Ok(raw.trim().trim_end_matches('/').to_string())
    }
}
