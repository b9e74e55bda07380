//! Relay Watch
//!
//! Command-line consumer of the feed relay. Restores the last selected
//! symbol and interval from a JSON preference file, lets flags override
//! them, saves the selection back, subscribes through a reconnecting
//! [`MirrorClient`] and prints every data frame to stdout.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin relay-watch -- --symbol ETH/USD --interval 5
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use feed_relay::application::ports::{LAST_INTERVAL_KEY, LAST_SYMBOL_KEY};
use feed_relay::infrastructure::telemetry;
use feed_relay::{
    JsonFilePreferenceStore, MirrorClient, MirrorConfig, MirrorEvent, PreferenceStore,
    Subscription, TelemetryConfig,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_SYMBOL: &str = "XBT/USD";

#[derive(Parser, Debug)]
#[command(name = "relay-watch")]
#[command(about = "Stream market data from a feed relay")]
struct Args {
    /// Relay WebSocket URL
    #[arg(long, env = "RELAY_WATCH_URL", default_value = "ws://localhost:8080/ws")]
    url: String,

    /// Channel name (ohlc, ticker, trade, spread, book)
    #[arg(long, default_value = "ohlc")]
    channel: String,

    /// Symbol; defaults to the last one used
    #[arg(long)]
    symbol: Option<String>,

    /// Interval in minutes; defaults to the last one used
    #[arg(long)]
    interval: Option<u32>,

    /// Preference file
    #[arg(long, env = "RELAY_WATCH_PREFS", default_value = "relay-watch.json")]
    prefs: String,

    /// Reconnect budget (0 = unlimited)
    #[arg(long, default_value = "10")]
    max_attempts: u32,

    /// Exit after this many data frames (0 = run until interrupted)
    #[arg(long, default_value = "0")]
    limit: u64,
}

/// Resolve the selection from flags and stored preferences, then save it.
fn resolve_selection(args: &Args, store: &dyn PreferenceStore) -> Result<Subscription> {
    let symbol = match &args.symbol {
        Some(symbol) => symbol.clone(),
        None => store
            .get(LAST_SYMBOL_KEY)
            .context("read last symbol")?
            .unwrap_or_else(|| DEFAULT_SYMBOL.to_string()),
    };

    let interval = match args.interval {
        Some(interval) => Some(interval),
        None => store
            .get(LAST_INTERVAL_KEY)
            .context("read last interval")?
            .and_then(|v| v.parse().ok()),
    };

    store
        .set(LAST_SYMBOL_KEY, &symbol)
        .context("save last symbol")?;
    if let Some(interval) = interval {
        store
            .set(LAST_INTERVAL_KEY, &interval.to_string())
            .context("save last interval")?;
    }

    Ok(Subscription::new(args.channel.clone(), interval, symbol))
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let _telemetry_guard = telemetry::init_with_config(TelemetryConfig {
        enabled: false,
        ..TelemetryConfig::from_env()
    });

    let args = Args::parse();
    let store = JsonFilePreferenceStore::new(&args.prefs);
    let subscription = resolve_selection(&args, &store)?;
    tracing::info!(url = %args.url, subscription = %subscription, "Starting relay watch");

    let cancel = CancellationToken::new();
    let (event_tx, mut events) = mpsc::channel(1024);
    let mut config = MirrorConfig::new(args.url.clone());
    config.max_attempts = args.max_attempts;

    let (client, handle) = MirrorClient::new(config, event_tx, cancel.clone());
    handle.subscribe(subscription);
    let client_task = tokio::spawn(client.run());

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, stopping");
        }
        ctrl_c_cancel.cancel();
    });

    let mut received = 0_u64;
    while let Some(event) = events.recv().await {
        match event {
            MirrorEvent::Data { text, .. } => {
                println!("{text}");
                received += 1;
                if args.limit > 0 && received >= args.limit {
                    cancel.cancel();
                }
            }
            MirrorEvent::Status(status) => {
                tracing::info!(state = %status.state, connected = status.connected, "Relay status");
                if let Some(error) = status.error {
                    tracing::warn!(error = %error, "Relay upstream error");
                }
            }
            MirrorEvent::Connected { replayed } => tracing::info!(replayed, "Connected"),
            MirrorEvent::Disconnected { reason } => tracing::warn!(reason = %reason, "Disconnected"),
            MirrorEvent::Reconnecting { attempt, delay } => {
                tracing::info!(attempt, delay_ms = delay.as_millis(), "Reconnecting");
            }
            MirrorEvent::Error(message) => tracing::warn!(error = %message, "Relay error"),
            MirrorEvent::Abandoned { attempts } => {
                tracing::error!(attempts, "Gave up reconnecting");
            }
        }
    }

    client_task
        .await
        .context("mirror task panicked")?
        .context("mirror client failed")?;

    tracing::info!(received, "Relay watch stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_relay::MemoryPreferenceStore;

    fn args(symbol: Option<&str>, interval: Option<u32>) -> Args {
        Args {
            url: "ws://localhost:8080/ws".to_string(),
            channel: "ohlc".to_string(),
            symbol: symbol.map(ToString::to_string),
            interval,
            prefs: String::new(),
            max_attempts: 10,
            limit: 0,
        }
    }

    #[test]
    fn stored_selection_is_restored() {
        let store = MemoryPreferenceStore::new();
        store.set(LAST_SYMBOL_KEY, "ETH/USD").unwrap();
        store.set(LAST_INTERVAL_KEY, "15").unwrap();

        let sub = resolve_selection(&args(None, None), &store).unwrap();
        assert_eq!(sub, Subscription::new("ohlc", Some(15), "ETH/USD"));
    }

    #[test]
    fn flags_override_and_are_saved() {
        let store = MemoryPreferenceStore::new();
        store.set(LAST_SYMBOL_KEY, "ETH/USD").unwrap();

        let sub = resolve_selection(&args(Some("SOL/USD"), Some(5)), &store).unwrap();
        assert_eq!(sub, Subscription::new("ohlc", Some(5), "SOL/USD"));
        assert_eq!(store.get(LAST_SYMBOL_KEY).unwrap().as_deref(), Some("SOL/USD"));
        assert_eq!(store.get(LAST_INTERVAL_KEY).unwrap().as_deref(), Some("5"));
    }

    #[test]
    fn empty_store_uses_default_symbol() {
        let store = MemoryPreferenceStore::new();
        let sub = resolve_selection(&args(None, None), &store).unwrap();
        assert_eq!(sub.target, DEFAULT_SYMBOL);
        assert_eq!(sub.interval, None);
    }
}
