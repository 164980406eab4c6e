//! Streaming ingestion worker.
//!
//! Connects to the market-data WebSocket, authenticates, subscribes to
//! trades for its symbol set, and turns every trade into a tick record plus
//! an in-memory 1-minute bar. A bar is emitted once a trade for a later
//! minute arrives. The worker owns its reconnect backoff and resubscribes
//! after every reconnect.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::feeds::persist_record;
use crate::profile::calculator::bucket_floor;
use crate::store::{Store, SymbolCache};
use crate::types::{Candle, NormalizedRecord, Tick};

/// Aggregates trades into 1-minute OHLCV bars, one open bar per symbol.
#[derive(Default)]
pub struct BarAggregator {
    current: HashMap<String, Candle>,
}

impl BarAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one trade in; returns the completed bar when the trade opens a
    /// new minute for its symbol.
    pub fn on_trade(
        &mut self,
        symbol: &str,
        time: DateTime<Utc>,
        price: f64,
        size: i64,
    ) -> Option<Candle> {
        let bucket = bucket_floor(time);

        match self.current.get_mut(symbol) {
            Some(bar) if bar.time == bucket => {
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
                bar.volume += size;
                None
            }
            Some(bar) if bucket > bar.time => {
                let completed = *bar;
                *bar = Candle {
                    time: bucket,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: size,
                };
                Some(completed)
            }
            Some(_) => None, // stale trade for an already-emitted minute
            None => {
                self.current.insert(
                    symbol.to_string(),
                    Candle {
                        time: bucket,
                        open: price,
                        high: price,
                        low: price,
                        close: price,
                        volume: size,
                    },
                );
                None
            }
        }
    }
}

/// Parse one trade message: `{"T":"t","S":"AAPL","p":150.25,"s":100,
/// "t":"2025-10-01T12:34:56.789Z","x":"V"}`.
pub fn parse_trade(msg: &serde_json::Value) -> Option<(String, Tick)> {
    let symbol = msg.get("S")?.as_str()?.to_string();
    let price = msg.get("p")?.as_f64()?;
    let size = msg.get("s").and_then(|s| s.as_i64()).unwrap_or(0);
    let time: DateTime<Utc> = msg
        .get("t")?
        .as_str()?
        .parse::<DateTime<chrono::FixedOffset>>()
        .ok()?
        .with_timezone(&Utc);
    let venue = msg
        .get("x")
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .to_string();

    Some((symbol, Tick { time, price, size, venue }))
}

pub struct StreamWorker {
    store: Store,
    ws_url: String,
    api_key: String,
    secret_key: String,
    symbols: Vec<String>,
}

impl StreamWorker {
    pub fn new(
        store: Store,
        ws_url: String,
        api_key: String,
        secret_key: String,
        symbols: Vec<String>,
    ) -> Self {
        Self { store, ws_url, api_key, secret_key, symbols }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff_ms: u64 = 1000;
        let mut cache = SymbolCache::new();
        let mut bars = BarAggregator::new();
        let mut dropped: u64 = 0;

        loop {
            if *shutdown.borrow() {
                return;
            }
            info!(target: "ingest", url = %self.ws_url, "connecting stream");

            let ws = match connect_async(&self.ws_url).await {
                Ok((ws, _)) => {
                    backoff_ms = 1000;
                    ws
                }
                Err(e) => {
                    warn!(target: "ingest", error = %e, backoff_ms, "stream connect failed");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)) => {}
                        _ = shutdown.changed() => return,
                    }
                    backoff_ms = (backoff_ms * 2).min(60_000);
                    continue;
                }
            };

            let (mut write, mut read) = ws.split();

            let auth = serde_json::json!({
                "action": "auth",
                "key": self.api_key,
                "secret": self.secret_key,
            });
            if let Err(e) = write.send(Message::Text(auth.to_string())).await {
                warn!(target: "ingest", error = %e, "auth send failed, reconnecting");
                continue;
            }

            loop {
                let msg = tokio::select! {
                    msg = read.next() => msg,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!(target: "ingest", "stream worker shutting down");
                            return;
                        }
                        continue;
                    }
                };

                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!(target: "ingest", error = %e, "stream error, reconnecting");
                        break;
                    }
                    None => {
                        warn!(target: "ingest", "stream ended, reconnecting");
                        break;
                    }
                };

                let Message::Text(text) = msg else { continue };
                let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) else {
                    dropped += 1;
                    continue;
                };
                let Some(messages) = parsed.as_array() else { continue };

                for m in messages {
                    match m.get("T").and_then(|t| t.as_str()) {
                        Some("success")
                            if m.get("msg").and_then(|s| s.as_str()) == Some("authenticated") =>
                        {
                            info!(target: "ingest", "authenticated, subscribing to trades");
                            let sub = serde_json::json!({
                                "action": "subscribe",
                                "trades": self.symbols,
                            });
                            if let Err(e) = write.send(Message::Text(sub.to_string())).await {
                                warn!(target: "ingest", error = %e, "subscribe failed");
                            }
                        }
                        Some("subscription") => {
                            debug!(target: "ingest", msg = %m, "subscription confirmed");
                        }
                        Some("t") => match parse_trade(m) {
                            Some((symbol, tick)) => {
                                self.handle_trade(&mut cache, &mut bars, &symbol, tick).await;
                            }
                            None => {
                                dropped += 1;
                                debug!(target: "ingest", total_dropped = dropped, "malformed trade dropped");
                            }
                        },
                        _ => {}
                    }
                }
            }

            warn!(target: "ingest", backoff_ms, "stream disconnected");
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)) => {}
                _ = shutdown.changed() => return,
            }
            backoff_ms = (backoff_ms * 2).min(60_000);
        }
    }

    async fn handle_trade(
        &self,
        cache: &mut SymbolCache,
        bars: &mut BarAggregator,
        symbol: &str,
        tick: Tick,
    ) {
        let completed = bars.on_trade(symbol, tick.time, tick.price, tick.size);

        let record = NormalizedRecord::Tick { symbol: symbol.to_string(), tick };
        if let Err(e) = persist_record(&self.store, cache, &record).await {
            warn!(target: "ingest", %symbol, error = %e, "tick write failed");
        }

        if let Some(candle) = completed {
            let record = NormalizedRecord::Candle { symbol: symbol.to_string(), candle };
            if let Err(e) = persist_record(&self.store, cache, &record).await {
                warn!(target: "ingest", %symbol, error = %e, "candle write failed");
            }
        }
    }
}
