//! Rate-Limited REST Gateway
//!
//! Point-in-time queries against the public REST API, with two layers of
//! protection against the upstream's request quota:
//!
//! 1. **Proactive throttling.** Each endpoint key keeps a sliding one-minute
//!    window of send timestamps. A request that would exceed the quota waits
//!    first (`base * 2^round`, capped at 30s and never past the moment the
//!    window frees a slot) instead of being sent and refused.
//! 2. **Reactive retry.** A `429 Too Many Requests` or a network failure is
//!    retried after `base * 2^attempt` (or `Retry-After`, capped at 30s), up to
//!    `max_retries` times. Other non-2xx responses are returned immediately
//!    because a stable 4xx/5xx from bad input will not fix itself.
//!
//! Only requests that are actually sent occupy a slot in the window.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::{Client, StatusCode, Url};
use tokio::time::Instant;

use super::messages::RestEnvelope;
use crate::infrastructure::config::RestSettings;
use crate::infrastructure::metrics;

/// Longest single throttle or retry wait.
pub const MAX_THROTTLE_WAIT: Duration = Duration::from_secs(30);

// =============================================================================
// Configuration
// =============================================================================

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL, without trailing slash.
    pub base_url: String,
    /// Requests admitted per endpoint per window.
    pub quota: usize,
    /// Sliding window length.
    pub window: Duration,
    /// Retries after throttling or network failure.
    pub max_retries: u32,
    /// Base of both the proactive and the retry backoff.
    pub backoff_base: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&RestSettings::default())
    }
}

impl From<&RestSettings> for GatewayConfig {
    fn from(settings: &RestSettings) -> Self {
        Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            quota: settings.quota_per_minute,
            window: Duration::from_secs(60),
            max_retries: settings.max_retries,
            backoff_base: Duration::from_secs(1),
            timeout: settings.timeout,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Gateway failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Upstream answered `429 Too Many Requests`.
    #[error("rate limited by upstream")]
    RateLimited,
    /// Upstream answered with a non-2xx status other than 429.
    #[error("upstream returned {status}: {body}")]
    UpstreamStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// Request never got a response.
    #[error("network failure: {0}")]
    Network(String),
    /// Upstream reported a semantic error (unknown pair, bad argument).
    #[error("upstream rejected request: {}", .0.join("; "))]
    UpstreamRejected(Vec<String>),
    /// Retries ran out; carries the last transient failure.
    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries {
        /// Attempts made, the first included.
        attempts: u32,
        /// Last failure seen.
        last: Box<GatewayError>,
    },
    /// Response body was not a valid envelope.
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
    /// Request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Short label for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::UpstreamStatus { .. } => "upstream_status",
            Self::Network(_) => "network",
            Self::UpstreamRejected(_) => "rejected",
            Self::ExhaustedRetries { .. } => "exhausted",
            Self::InvalidResponse(_) => "invalid_response",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}

// =============================================================================
// Query
// =============================================================================

/// A public market-data query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicQuery {
    /// Endpoint name (`OHLC`, `Ticker`, ...); also the quota key.
    pub method: String,
    /// Pair, e.g. `XBTUSD`.
    pub pair: Option<String>,
    /// Interval in minutes.
    pub interval: Option<u32>,
    /// Cursor returned as `last` by a previous call.
    pub since: Option<String>,
}

impl PublicQuery {
    /// Query parameters in wire order.
    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(pair) = &self.pair {
            params.push(("pair", pair.clone()));
        }
        if let Some(interval) = self.interval {
            params.push(("interval", interval.to_string()));
        }
        if let Some(since) = &self.since {
            params.push(("since", since.clone()));
        }
        params
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Sliding-window limiter keyed by endpoint.
#[derive(Debug, Default)]
struct SlidingWindows {
    windows: HashMap<String, VecDeque<Instant>>,
}

impl SlidingWindows {
    /// Admit a send now, or say how long to wait before asking again.
    fn try_admit(
        &mut self,
        endpoint: &str,
        quota: usize,
        window: Duration,
        now: Instant,
    ) -> Result<(), Duration> {
        let sent = self.windows.entry(endpoint.to_string()).or_default();
        while sent
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            sent.pop_front();
        }

        if sent.len() < quota {
            sent.push_back(now);
            return Ok(());
        }

        let until_free = sent
            .front()
            .map_or(Duration::ZERO, |t| window.saturating_sub(now.saturating_duration_since(*t)));
        Err(until_free)
    }

    fn in_window(&self, endpoint: &str) -> usize {
        self.windows.get(endpoint).map_or(0, VecDeque::len)
    }
}

/// Rate-limited client for the public REST API.
#[derive(Debug)]
pub struct RestGateway {
    client: Client,
    config: GatewayConfig,
    windows: Mutex<SlidingWindows>,
}

impl RestGateway {
    /// Create a gateway.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] if the HTTP client cannot be built.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            client,
            config,
            windows: Mutex::new(SlidingWindows::default()),
        })
    }

    /// Gateway configuration.
    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Requests counted in `endpoint`'s current window.
    #[must_use]
    pub fn in_window(&self, endpoint: &str) -> usize {
        self.windows.lock().in_window(endpoint)
    }

    /// Run a public query; the method name is the quota key.
    ///
    /// # Errors
    ///
    /// See [`RestGateway::request`].
    pub async fn public_query(&self, query: &PublicQuery) -> Result<String, GatewayError> {
        let base = format!("{}/{}", self.config.base_url, query.method);
        let url = Url::parse_with_params(&base, query.params())
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        self.request(&query.method, url.as_str()).await
    }

    /// GET `url`, counted against `endpoint`'s quota. Returns the body
    /// verbatim once the envelope reports no errors.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::UpstreamStatus`] for a non-2xx other than 429
    /// - [`GatewayError::UpstreamRejected`] when the envelope's `error` is non-empty
    /// - [`GatewayError::ExhaustedRetries`] when throttling or network failures persist
    /// - [`GatewayError::InvalidResponse`] when the body is not an envelope
    pub async fn request(&self, endpoint: &str, url: &str) -> Result<String, GatewayError> {
        let started = Instant::now();
        let result = self.request_with_retry(endpoint, url).await;

        let outcome = result.as_ref().map_or_else(GatewayError::label, |_| "ok");
        metrics::record_rest_request(endpoint, outcome, started.elapsed());
        result
    }

    async fn request_with_retry(&self, endpoint: &str, url: &str) -> Result<String, GatewayError> {
        let mut attempt: u32 = 0;

        loop {
            self.acquire(endpoint).await;

            let (failure, retry_after) = match self.client.get(url).send().await {
                Err(e) => (GatewayError::Network(e.to_string()), None),
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    (GatewayError::RateLimited, retry_after)
                }
                Ok(response) => return Self::read_response(response).await,
            };

            attempt += 1;
            if attempt > self.config.max_retries {
                tracing::warn!(endpoint, attempts = attempt, error = %failure, "Giving up on request");
                return Err(GatewayError::ExhaustedRetries {
                    attempts: attempt,
                    last: Box::new(failure),
                });
            }

            let delay = self.retry_delay(attempt, retry_after);
            tracing::warn!(
                endpoint,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %failure,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn read_response(response: reqwest::Response) -> Result<String, GatewayError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(GatewayError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        let envelope: RestEnvelope = serde_json::from_str(&body)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        if envelope.is_rejected() {
            return Err(GatewayError::UpstreamRejected(envelope.error));
        }
        Ok(body)
    }

    /// Wait until `endpoint`'s window admits one more send, then claim the slot.
    async fn acquire(&self, endpoint: &str) {
        let mut round: u32 = 0;
        loop {
            let admitted = self.windows.lock().try_admit(
                endpoint,
                self.config.quota,
                self.config.window,
                Instant::now(),
            );

            let until_free = match admitted {
                Ok(()) => return,
                Err(until_free) => until_free,
            };

            round += 1;
            let wait = self.backoff(round).min(MAX_THROTTLE_WAIT).min(until_free);
            tracing::debug!(
                endpoint,
                round,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "Quota reached, delaying request"
            );
            metrics::record_rest_throttle_wait(endpoint);
            tokio::time::sleep(wait).await;
        }
    }

    /// Wait before retry `attempt` (one-based). A server hint is honored up
    /// to [`MAX_THROTTLE_WAIT`].
    fn retry_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or_else(|| self.backoff(attempt.saturating_sub(1)))
            .min(MAX_THROTTLE_WAIT)
    }

    fn backoff(&self, exponent: u32) -> Duration {
        let factor = 1_u32.checked_shl(exponent.min(16)).unwrap_or(u32::MAX);
        self.config
            .backoff_base
            .checked_mul(factor)
            .unwrap_or(MAX_THROTTLE_WAIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_test_gateway(quota: usize) -> RestGateway {
        RestGateway::new(GatewayConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            quota,
            window: Duration::from_secs(60),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
        })
        .unwrap()
    }

    #[test]
    fn window_admits_up_to_quota() {
        let mut windows = SlidingWindows::default();
        let now = Instant::now();

        for _ in 0..3 {
            assert!(windows.try_admit("OHLC", 3, Duration::from_secs(60), now).is_ok());
        }
        assert_eq!(
            windows.try_admit("OHLC", 3, Duration::from_secs(60), now + Duration::from_secs(10)),
            Err(Duration::from_secs(50))
        );
        // Other endpoints have their own window.
        assert!(windows.try_admit("Ticker", 3, Duration::from_secs(60), now).is_ok());
        // Old sends age out.
        assert!(
            windows
                .try_admit("OHLC", 3, Duration::from_secs(60), now + Duration::from_secs(60))
                .is_ok()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn request_over_quota_waits_for_the_window() {
        let gateway = window_test_gateway(15);
        let started = Instant::now();

        for _ in 0..15 {
            gateway.acquire("OHLC").await;
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(gateway.in_window("OHLC"), 15);

        gateway.acquire("OHLC").await;
        let waited = started.elapsed();

        assert!(waited >= Duration::from_secs(60), "waited only {waited:?}");
        assert!(waited < Duration::from_secs(61));
        assert_eq!(gateway.in_window("OHLC"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_waits_grow_and_cap() {
        let gateway = window_test_gateway(1);
        gateway.acquire("Depth").await;

        let started = Instant::now();
        gateway.acquire("Depth").await;

        // 2 + 4 + 8 + 16 + 30 capped by the 60s window
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_is_pending_while_window_is_full() {
        let gateway = window_test_gateway(1);
        gateway.acquire("Spread").await;

        let mut blocked = tokio_test::task::spawn(gateway.acquire("Spread"));
        tokio_test::assert_pending!(blocked.poll());

        // Another endpoint is not held up.
        let mut other = tokio_test::task::spawn(gateway.acquire("Ticker"));
        tokio_test::assert_ready!(other.poll());

        tokio::time::advance(Duration::from_secs(60)).await;
        tokio_test::assert_ready!(blocked.poll());
        assert_eq!(gateway.in_window("Spread"), 1);
    }

    #[test]
    fn retry_after_hint_is_capped() {
        let gateway = window_test_gateway(15);

        assert_eq!(
            gateway.retry_delay(1, Some(Duration::from_secs(3600))),
            MAX_THROTTLE_WAIT
        );
        assert_eq!(
            gateway.retry_delay(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(gateway.retry_delay(1, None), Duration::from_secs(1));
        assert_eq!(gateway.retry_delay(3, None), Duration::from_secs(4));
        assert_eq!(gateway.retry_delay(10, None), MAX_THROTTLE_WAIT);
    }

    #[test]
    fn query_params_skip_missing_fields() {
        let query = PublicQuery {
            method: "OHLC".to_string(),
            pair: Some("XBTUSD".to_string()),
            interval: Some(5),
            since: None,
        };
        assert_eq!(
            query.params(),
            vec![("pair", "XBTUSD".to_string()), ("interval", "5".to_string())]
        );
    }

    #[test]
    fn error_labels_are_stable() {
        let exhausted = GatewayError::ExhaustedRetries {
            attempts: 4,
            last: Box::new(GatewayError::RateLimited),
        };
        assert_eq!(exhausted.label(), "exhausted");
        assert_eq!(
            exhausted.to_string(),
            "gave up after 4 attempts: rate limited by upstream"
        );
        assert_eq!(
            GatewayError::UpstreamRejected(vec!["EQuery:Unknown asset pair".to_string()])
                .to_string(),
            "upstream rejected request: EQuery:Unknown asset pair"
        );
    }
}
