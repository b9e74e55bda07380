//! HTTP Surface Integration Tests
//!
//! Exercises the axum server end to end: WebSocket clients, the query
//! proxy status mapping and the health endpoints.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{ServerHarness, WAIT};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn ws_connect(url: &str) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn next_text(ws: &mut WsStream) -> String {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket ended")
            .unwrap();
        match message {
            Message::Text(text) => return text.to_string(),
            Message::Close(_) => panic!("socket closed"),
            _ => {}
        }
    }
}

async fn next_non_status(ws: &mut WsStream) -> String {
    loop {
        let text = next_text(ws).await;
        let value: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
        if value["type"] != "status" {
            return text;
        }
    }
}

// =============================================================================
// WebSocket
// =============================================================================

#[tokio::test]
async fn websocket_client_subscribes_and_receives_data() {
    let harness = ServerHarness::start(20, "http://127.0.0.1:9").await;
    let mut ws = ws_connect(&harness.ws_url()).await;

    let status: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(status["type"], "status");

    ws.send(Message::Text(
        r#"{"event":"subscribe","pair":["XBT/USD"],"subscription":{"name":"trade"}}"#.into(),
    ))
    .await
    .unwrap();

    let sent: serde_json::Value =
        serde_json::from_str(&harness.upstream.next_sent().await).unwrap();
    assert_eq!(sent["event"], "subscribe");
    assert_eq!(sent["subscription"]["name"], "trade");

    let trade = r#"[337,[["37005.5","0.1","1700000000.1","b","l",""]],"trade","XBT/USD"]"#;
    harness.upstream.push(trade);
    assert_eq!(next_non_status(&mut ws).await, trade);
}

#[tokio::test]
async fn websocket_over_capacity_gets_error_then_close() {
    let harness = ServerHarness::start(1, "http://127.0.0.1:9").await;
    let mut first = ws_connect(&harness.ws_url()).await;
    next_text(&mut first).await;

    let mut second = ws_connect(&harness.ws_url()).await;
    let error: serde_json::Value = serde_json::from_str(&next_text(&mut second).await).unwrap();
    assert_eq!(error["type"], "error");
    assert!(error["error"].as_str().unwrap().contains("capacity exceeded"));

    let closed = timeout(WAIT, async {
        loop {
            match second.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "rejected socket stayed open");

    // The admitted client is unaffected.
    first.send(Message::Text(r#"{"event":"ping","reqid":1}"#.into())).await.unwrap();
    let pong: serde_json::Value = serde_json::from_str(&next_non_status(&mut first).await).unwrap();
    assert_eq!(pong["event"], "pong");
}

#[tokio::test]
async fn closing_socket_releases_session() {
    let harness = ServerHarness::start(20, "http://127.0.0.1:9").await;
    let mut ws = ws_connect(&harness.ws_url()).await;
    next_text(&mut ws).await;
    assert_eq!(harness.relay.snapshot().await.unwrap().clients, 1);

    ws.close(None).await.unwrap();

    timeout(WAIT, async {
        while harness.relay.snapshot().await.unwrap().clients > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session not released");
}

// =============================================================================
// Query Proxy
// =============================================================================

#[tokio::test]
async fn query_proxy_maps_upstream_outcomes() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Ticker"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"error":[],"result":{"XXBTZUSD":{}}}"#),
        )
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/OHLC"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"error":["EQuery:Unknown asset pair"]}"#),
        )
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/Depth"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/Spread"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&upstream)
        .await;

    let harness = ServerHarness::start(20, &upstream.uri()).await;
    let http = reqwest::Client::new();

    let ok = http
        .get(harness.http_url("/api/public/Ticker?pair=XBTUSD"))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(ok.text().await.unwrap(), r#"{"error":[],"result":{"XXBTZUSD":{}}}"#);

    let rejected = http
        .get(harness.http_url("/api/public/OHLC?pair=FOO&interval=5"))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = rejected.json().await.unwrap();
    assert_eq!(body["error"][0], "EQuery:Unknown asset pair");

    let failed = http
        .get(harness.http_url("/api/public/Depth?pair=XBTUSD"))
        .send()
        .await
        .unwrap();
    assert_eq!(failed.status(), StatusCode::BAD_GATEWAY);

    let throttled = http
        .get(harness.http_url("/api/public/Spread?pair=XBTUSD"))
        .send()
        .await
        .unwrap();
    assert_eq!(throttled.status(), StatusCode::SERVICE_UNAVAILABLE);

    let unknown = http
        .get(harness.http_url("/api/public/AddOrder"))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn health_endpoints_report_relay_state() {
    let harness = ServerHarness::start(20, "http://127.0.0.1:9").await;
    let http = reqwest::Client::new();

    let health: serde_json::Value = http
        .get(harness.http_url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "idle");
    assert_eq!(health["clients"], 0);
    assert_eq!(health["max_clients"], 20);
    assert_eq!(health["upstream"]["state"], "disconnected");
    assert_eq!(health["version"], "test");

    let mut ws = ws_connect(&harness.ws_url()).await;
    next_text(&mut ws).await;
    harness.upstream.wait_connects(1).await;

    let health: serde_json::Value = timeout(WAIT, async {
        loop {
            let health: serde_json::Value = http
                .get(harness.http_url("/health"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if health["status"] == "healthy" {
                return health;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("relay never became healthy");
    assert_eq!(health["clients"], 1);
    assert_eq!(health["upstream"]["connected"], true);

    let live = http.get(harness.http_url("/healthz")).send().await.unwrap();
    assert_eq!(live.status(), StatusCode::OK);
    let ready = http.get(harness.http_url("/readyz")).send().await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
    assert_eq!(ready.text().await.unwrap(), "READY");
}
