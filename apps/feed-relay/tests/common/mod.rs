//! Shared fixtures: an in-process upstream exchange and relay harnesses.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use feed_relay::infrastructure::upstream::HeartbeatConfig;
use feed_relay::{
    BackoffPolicy, BackpressurePolicy, ClientConnection, GatewayConfig, HttpServer, RelayHandle,
    RelayHub, RelaySettings, RestGateway, ServerState, TransportError, TransportFrame,
    UpstreamConfig, UpstreamConnector, UpstreamTransport,
};

/// How long a test waits for something that should happen.
pub const WAIT: Duration = Duration::from_secs(5);

/// How long a test waits to be sure something does not happen.
pub const QUIET: Duration = Duration::from_millis(200);

type Inbound = Option<Result<TransportFrame, TransportError>>;

#[derive(Default)]
struct UpstreamState {
    refuse: bool,
    connects: usize,
    current: Option<mpsc::UnboundedSender<Inbound>>,
}

/// In-process stand-in for the exchange feed.
#[derive(Clone)]
pub struct FakeUpstream {
    state: Arc<Mutex<UpstreamState>>,
    sent_tx: mpsc::UnboundedSender<String>,
    sent_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(UpstreamState::default())),
            sent_tx,
            sent_rx: Arc::new(tokio::sync::Mutex::new(sent_rx)),
        }
    }

    pub fn connector(&self) -> Arc<dyn UpstreamConnector> {
        Arc::new(FakeConnector {
            upstream: self.clone(),
        })
    }

    /// Refuse (or accept again) new connections.
    pub fn set_refuse(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Successful connections so far.
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// Whether a link is currently attached.
    pub fn is_attached(&self) -> bool {
        self.state
            .lock()
            .current
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Push a text frame down the current link.
    pub fn push(&self, text: &str) {
        let state = self.state.lock();
        let tx = state.current.as_ref().expect("no upstream link");
        tx.send(Some(Ok(TransportFrame::Text(text.to_string()))))
            .expect("link gone");
    }

    /// Break the current link as a network failure would.
    pub fn sever(&self) {
        if let Some(tx) = self.state.lock().current.take() {
            let _ = tx.send(Some(Err(TransportError::Io("connection reset".to_string()))));
        }
    }

    /// Next frame the relay wrote upstream.
    pub async fn next_sent(&self) -> String {
        timeout(WAIT, self.sent_rx.lock().await.recv())
            .await
            .expect("timed out waiting for an upstream write")
            .expect("sent channel closed")
    }

    /// Next `n` frames written upstream, parsed.
    pub async fn next_sent_json(&self, n: usize) -> Vec<serde_json::Value> {
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            frames.push(serde_json::from_str(&self.next_sent().await).unwrap());
        }
        frames
    }

    /// Assert nothing is written upstream for a short while.
    pub async fn assert_quiet(&self) {
        let got = timeout(QUIET, self.sent_rx.lock().await.recv()).await;
        assert!(got.is_err(), "unexpected upstream write: {got:?}");
    }

    /// Wait until the relay has connected `n` times.
    pub async fn wait_connects(&self, n: usize) {
        timeout(WAIT, async {
            while self.connects() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for upstream connect");
    }
}

struct FakeConnector {
    upstream: FakeUpstream,
}

#[async_trait]
impl UpstreamConnector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn UpstreamTransport>, TransportError> {
        let mut state = self.upstream.state.lock();
        if state.refuse {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        state.connects += 1;
        state.current = Some(inbound_tx);
        Ok(Box::new(FakeTransport {
            inbound,
            sent: self.upstream.sent_tx.clone(),
        }))
    }
}

struct FakeTransport {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    sent: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl UpstreamTransport for FakeTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        // Keep-alive pings are not interesting to the tests.
        if !text.contains(r#""event":"ping""#) {
            let _ = self.sent.send(text);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<TransportFrame, TransportError>> {
        match self.inbound.recv().await {
            Some(item) => item,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Upstream settings with short, jitter-free backoff.
pub fn fast_upstream(max_attempts: u32) -> UpstreamConfig {
    UpstreamConfig {
        backoff: BackoffPolicy::new(Duration::from_millis(20), Duration::from_millis(100))
            .without_jitter(),
        max_attempts,
        heartbeat: HeartbeatConfig::new(Duration::from_secs(3600), Duration::from_secs(7200)),
    }
}

/// A hub running against a fake upstream.
pub struct RelayHarness {
    pub upstream: FakeUpstream,
    pub relay: RelayHandle,
    pub cancel: CancellationToken,
}

impl RelayHarness {
    pub fn start(max_clients: usize) -> Self {
        Self::with_settings(
            RelaySettings {
                max_clients,
                queue_capacity: 64,
                backpressure: BackpressurePolicy::Drop,
            },
            fast_upstream(5),
        )
    }

    pub fn with_settings(settings: RelaySettings, upstream_config: UpstreamConfig) -> Self {
        let upstream = FakeUpstream::new();
        let cancel = CancellationToken::new();
        let (relay, _task) =
            RelayHub::spawn(settings, upstream_config, upstream.connector(), cancel.clone());
        Self {
            upstream,
            relay,
            cancel,
        }
    }

    /// Connect a client and consume its first status frame.
    pub async fn client(&self) -> ClientConnection {
        let mut connection = self.relay.connect().await.unwrap();
        let status = next_json(&mut connection).await;
        assert_eq!(status["type"], "status");
        connection
    }

    /// Send a client frame.
    pub async fn say(&self, connection: &ClientConnection, text: &str) {
        self.relay
            .client_message(connection.id, text.to_string())
            .await
            .unwrap();
    }

    /// Wait until the upstream link is open, skipping the status frames.
    pub async fn wait_open(&self) {
        timeout(WAIT, async {
            loop {
                let snapshot = self.relay.snapshot().await.unwrap();
                if snapshot.upstream_state == feed_relay::LinkState::Open {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("upstream never opened");
    }
}

impl Drop for RelayHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Next frame queued for a client.
pub async fn next_frame(connection: &mut ClientConnection) -> String {
    let frame = timeout(WAIT, connection.frames.recv())
        .await
        .expect("timed out waiting for a client frame")
        .expect("client queue closed");
    frame.to_string()
}

/// Next frame queued for a client, parsed.
pub async fn next_json(connection: &mut ClientConnection) -> serde_json::Value {
    serde_json::from_str(&next_frame(connection).await).unwrap()
}

/// Next non-status frame queued for a client.
pub async fn next_payload(connection: &mut ClientConnection) -> String {
    loop {
        let frame = next_frame(connection).await;
        let is_status = serde_json::from_str::<serde_json::Value>(&frame)
            .is_ok_and(|v| v["type"] == "status");
        if !is_status {
            return frame;
        }
    }
}

/// Assert a client receives nothing but status frames for a short while.
pub async fn assert_no_payload(connection: &mut ClientConnection) {
    let deadline = tokio::time::Instant::now() + QUIET;
    while let Ok(frame) = tokio::time::timeout_at(deadline, connection.frames.recv()).await {
        let frame = frame.expect("client queue closed");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap_or_default();
        assert_eq!(value["type"], "status", "unexpected frame: {frame}");
    }
}

/// A full relay server on an ephemeral port.
pub struct ServerHarness {
    pub upstream: FakeUpstream,
    pub relay: RelayHandle,
    pub addr: std::net::SocketAddr,
    pub cancel: CancellationToken,
}

impl ServerHarness {
    pub async fn start(max_clients: usize, rest_base_url: &str) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, max_clients, rest_base_url)
    }

    /// Start on a fixed address, e.g. to bring a relay back after a restart.
    pub async fn start_at(addr: std::net::SocketAddr, max_clients: usize) -> Self {
        let listener = timeout(WAIT, async {
            loop {
                match tokio::net::TcpListener::bind(addr).await {
                    Ok(listener) => return listener,
                    Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        })
        .await
        .expect("address never became free");
        Self::serve(listener, max_clients, "http://127.0.0.1:9")
    }

    fn serve(listener: tokio::net::TcpListener, max_clients: usize, rest_base_url: &str) -> Self {
        let upstream = FakeUpstream::new();
        let cancel = CancellationToken::new();
        let (relay, _task) = RelayHub::spawn(
            RelaySettings {
                max_clients,
                queue_capacity: 64,
                backpressure: BackpressurePolicy::Drop,
            },
            fast_upstream(5),
            upstream.connector(),
            cancel.clone(),
        );

        let gateway = RestGateway::new(GatewayConfig {
            base_url: rest_base_url.to_string(),
            quota: 100,
            window: Duration::from_secs(60),
            max_retries: 1,
            backoff_base: Duration::from_millis(10),
            timeout: Duration::from_secs(2),
        })
        .unwrap();
        let state = Arc::new(ServerState::new(
            "test".to_string(),
            relay.clone(),
            Arc::new(gateway),
        ));

        let addr = listener.local_addr().unwrap();
        let server = HttpServer::new(addr.port(), state, cancel.clone());
        tokio::spawn(server.serve(listener));

        Self {
            upstream,
            relay,
            addr,
            cancel,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

impl Drop for ServerHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
