//! CLOB WebSocket consumer for binary markets.
//!
//! Subscribes to the YES and NO token streams of every active market and
//! fuses per-asset updates into one price row per market. Two event shapes
//! are handled: full book snapshots and best bid/ask price changes.
//!
//! Latency discipline: the arbitrage flag is evaluated and logged before the
//! database write; the insert runs on a separate writer task fed by a
//! channel.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::arbitrage::evaluate_spread;
use crate::config::ArbitrageConfig;
use crate::store::Store;
use crate::types::{BinaryPrice, BinaryQuote};

/// One best-quote update for a single asset (token).
#[derive(Clone, Debug, PartialEq)]
pub struct AssetUpdate {
    pub asset_id: String,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub timestamp: DateTime<Utc>,
}

fn parse_decimal(v: &serde_json::Value) -> Option<Decimal> {
    if let Some(s) = v.as_str() {
        return s.parse().ok();
    }
    v.as_f64().and_then(Decimal::from_f64_retain)
}

fn parse_timestamp_ms(v: Option<&serde_json::Value>) -> DateTime<Utc> {
    let ms = v.and_then(|t| {
        t.as_i64()
            .or_else(|| t.as_str().and_then(|s| s.parse().ok()))
    });
    match ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
        Some(ts) => ts,
        None => Utc::now(),
    }
}

/// Parse one WebSocket message into asset updates. Handles both shapes:
///
/// - `book`: per-asset snapshot with full bid/ask ladders — best bid is the
///   highest bid, best ask the lowest ask.
/// - `price_change`: batched best bid/ask deltas per asset.
pub fn parse_events(text: &str) -> Vec<AssetUpdate> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };
    let events: Vec<&serde_json::Value> = match value.as_array() {
        Some(arr) => arr.iter().collect(),
        None => vec![&value],
    };

    let mut updates = Vec::new();
    for event in events {
        match event.get("event_type").and_then(|e| e.as_str()) {
            Some("book") => {
                let Some(asset_id) = event.get("asset_id").and_then(|a| a.as_str()) else {
                    continue;
                };
                let timestamp = parse_timestamp_ms(event.get("timestamp"));

                let best_of = |side: &str, best_high: bool| -> Option<Decimal> {
                    let levels = event.get(side)?.as_array()?;
                    let prices = levels
                        .iter()
                        .filter_map(|l| parse_decimal(l.get("price")?));
                    if best_high { prices.max() } else { prices.min() }
                };

                let (Some(best_bid), Some(best_ask)) =
                    (best_of("bids", true), best_of("asks", false))
                else {
                    continue;
                };
                updates.push(AssetUpdate {
                    asset_id: asset_id.to_string(),
                    best_bid,
                    best_ask,
                    timestamp,
                });
            }
            Some("price_change") => {
                let timestamp = parse_timestamp_ms(event.get("timestamp"));
                let Some(changes) = event.get("price_changes").and_then(|c| c.as_array()) else {
                    continue;
                };
                for change in changes {
                    let Some(asset_id) = change.get("asset_id").and_then(|a| a.as_str()) else {
                        continue;
                    };
                    let (Some(best_bid), Some(best_ask)) = (
                        change.get("best_bid").and_then(parse_decimal),
                        change.get("best_ask").and_then(parse_decimal),
                    ) else {
                        continue;
                    };
                    updates.push(AssetUpdate {
                        asset_id: asset_id.to_string(),
                        best_bid,
                        best_ask,
                        timestamp,
                    });
                }
            }
            _ => {}
        }
    }
    updates
}

/// Which market a token belongs to and which side it is.
#[derive(Clone, Debug)]
pub struct AssetRef {
    pub market_id: String,
    pub symbol: String,
    pub symbol_id: i32,
    pub is_yes: bool,
}

/// Per-market fusion table: latest quote for each side.
#[derive(Default)]
pub struct FusionTable {
    books: HashMap<String, (Option<BinaryQuote>, Option<BinaryQuote>)>,
}

impl FusionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one asset update; returns the fused (yes, no) pair once both
    /// sides of the market are known.
    pub fn apply(
        &mut self,
        asset: &AssetRef,
        update: &AssetUpdate,
    ) -> Option<(BinaryQuote, BinaryQuote)> {
        let quote = BinaryQuote { bid: update.best_bid, ask: update.best_ask };
        let entry = self.books.entry(asset.market_id.clone()).or_default();
        if asset.is_yes {
            entry.0 = Some(quote);
        } else {
            entry.1 = Some(quote);
        }
        entry.0.zip(entry.1)
    }
}

pub struct ArbitrageFeed {
    store: Store,
    cfg: ArbitrageConfig,
}

impl ArbitrageFeed {
    pub fn new(store: Store, cfg: ArbitrageConfig) -> Self {
        Self { store, cfg }
    }

    /// Build the token-id index from the active markets table.
    async fn load_asset_index(&self) -> HashMap<String, AssetRef> {
        let mut index = HashMap::new();
        let markets = match self.store.active_binary_markets().await {
            Ok(m) => m,
            Err(e) => {
                warn!(target: "arb", error = %e, "market listing failed");
                return index;
            }
        };
        for market in markets {
            let Ok(Some(symbol_id)) = self.store.symbol_id(&market.symbol).await else {
                continue;
            };
            index.insert(
                market.yes_token_id.clone(),
                AssetRef {
                    market_id: market.market_id.clone(),
                    symbol: market.symbol.clone(),
                    symbol_id,
                    is_yes: true,
                },
            );
            index.insert(
                market.no_token_id.clone(),
                AssetRef {
                    market_id: market.market_id,
                    symbol: market.symbol,
                    symbol_id,
                    is_yes: false,
                },
            );
        }
        index
    }

    /// Consume the CLOB stream until shutdown. Reconnects with exponential
    /// backoff and resubscribes to the current active-market set.
    pub async fn run(
        &self,
        price_tx: mpsc::Sender<(i32, BinaryPrice)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let spread_threshold = Decimal::from_f64_retain(self.cfg.spread_threshold)
            .unwrap_or_else(|| Decimal::new(995, 3));
        let fee_rate = Decimal::from_f64_retain(self.cfg.fee_rate).unwrap_or(Decimal::ZERO);
        let mut backoff_ms: u64 = 1000;
        let mut fusion = FusionTable::new();

        loop {
            if *shutdown.borrow() {
                return;
            }

            let index = self.load_asset_index().await;
            if index.is_empty() {
                info!(target: "arb", "no active markets; retrying in 30s");
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => continue,
                    _ = shutdown.changed() => return,
                }
            }

            info!(target: "arb", url = %self.cfg.ws_url, assets = index.len(), "connecting CLOB stream");
            let ws = match connect_async(&self.cfg.ws_url).await {
                Ok((ws, _)) => {
                    backoff_ms = 1000;
                    ws
                }
                Err(e) => {
                    warn!(target: "arb", error = %e, backoff_ms, "connect failed");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)) => {}
                        _ = shutdown.changed() => return,
                    }
                    backoff_ms = (backoff_ms * 2).min(60_000);
                    continue;
                }
            };

            let (mut write, mut read) = ws.split();
            let asset_ids: Vec<&String> = index.keys().collect();
            let n_assets = asset_ids.len();
            let sub = serde_json::json!({ "assets_ids": asset_ids, "type": "market" });
            if let Err(e) = write.send(Message::Text(sub.to_string())).await {
                warn!(target: "arb", error = %e, "subscribe failed, reconnecting");
                continue;
            }
            info!(target: "arb", assets = n_assets, "subscribed");

            let mut ping = tokio::time::interval(std::time::Duration::from_secs(10));

            loop {
                tokio::select! {
                    msg = read.next() => {
                        let msg = match msg {
                            Some(Ok(m)) => m,
                            Some(Err(e)) => {
                                warn!(target: "arb", error = %e, "stream error, reconnecting");
                                break;
                            }
                            None => {
                                warn!(target: "arb", "stream ended, reconnecting");
                                break;
                            }
                        };
                        let Message::Text(text) = msg else { continue };

                        for update in parse_events(&text) {
                            let Some(asset) = index.get(&update.asset_id) else { continue };
                            let Some((yes, no)) = fusion.apply(asset, &update) else { continue };

                            let eval = evaluate_spread(yes.ask, no.ask, spread_threshold, fee_rate);
                            // Fast path: flag and log before any store write.
                            if eval.arbitrage {
                                info!(
                                    target: "arb",
                                    symbol = %asset.symbol,
                                    spread = %eval.spread,
                                    profit_pct = %eval.estimated_profit_pct,
                                    "arbitrage opportunity"
                                );
                            } else {
                                debug!(target: "arb", symbol = %asset.symbol, spread = %eval.spread, "quote");
                            }

                            let row = BinaryPrice {
                                timestamp: update.timestamp,
                                symbol: asset.symbol.clone(),
                                yes,
                                no,
                                spread: eval.spread,
                                arbitrage: eval.arbitrage,
                                estimated_profit_pct: eval.estimated_profit_pct,
                            };
                            if price_tx.try_send((asset.symbol_id, row)).is_err() {
                                debug!(target: "arb", "price writer backlogged, row dropped");
                            }
                        }
                    }
                    _ = ping.tick() => {
                        let _ = write.send(Message::Ping(vec![])).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!(target: "arb", "feed shutting down");
                            return;
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)) => {}
                _ = shutdown.changed() => return,
            }
            backoff_ms = (backoff_ms * 2).min(60_000);
        }
    }
}

/// Writer task: drains fused price rows into the store, off the hot path.
pub async fn price_writer(store: Store, mut rx: mpsc::Receiver<(i32, BinaryPrice)>) {
    while let Some((symbol_id, price)) = rx.recv().await {
        if let Err(e) = store.upsert_binary_price(symbol_id, &price).await {
            warn!(target: "arb", symbol = %price.symbol, error = %e, "price upsert failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn asset(market: &str, is_yes: bool) -> AssetRef {
        AssetRef {
            market_id: market.to_string(),
            symbol: "PRES2028-DEM".into(),
            symbol_id: 7,
            is_yes,
        }
    }

    fn update(asset_id: &str, bid: Decimal, ask: Decimal) -> AssetUpdate {
        AssetUpdate {
            asset_id: asset_id.to_string(),
            best_bid: bid,
            best_ask: ask,
            timestamp: Utc::now(),
        }
    }

    /// Scenario: a full book snapshot with unsorted ladders.
    /// Expected: best bid is the highest bid, best ask the lowest ask.
    #[test]
    fn test_parse_book_snapshot() {
        let text = serde_json::json!({
            "event_type": "book",
            "asset_id": "tok-yes",
            "market": "0xabc",
            "timestamp": 1717000000123_i64,
            "bids": [
                {"price": "0.51", "size": "500"},
                {"price": "0.52", "size": "1000"},
                {"price": "0.50", "size": "200"}
            ],
            "asks": [
                {"price": "0.55", "size": "800"},
                {"price": "0.53", "size": "400"}
            ]
        })
        .to_string();

        let updates = parse_events(&text);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].asset_id, "tok-yes");
        assert_eq!(updates[0].best_bid, dec!(0.52));
        assert_eq!(updates[0].best_ask, dec!(0.53));
        assert_eq!(updates[0].timestamp.timestamp_millis(), 1717000000123);
    }

    /// Scenario: a price_change event carrying two assets.
    /// Expected: one update per asset with its own best bid/ask.
    #[test]
    fn test_parse_price_change() {
        let text = serde_json::json!([{
            "event_type": "price_change",
            "market": "0xabc",
            "timestamp": "1717000000500",
            "price_changes": [
                {"asset_id": "tok-yes", "best_bid": "0.48", "best_ask": "0.49", "side": "BUY", "size": "100"},
                {"asset_id": "tok-no", "best_bid": "0.47", "best_ask": "0.48", "side": "SELL", "size": "50"}
            ]
        }])
        .to_string();

        let updates = parse_events(&text);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].asset_id, "tok-yes");
        assert_eq!(updates[0].best_ask, dec!(0.49));
        assert_eq!(updates[1].asset_id, "tok-no");
        assert_eq!(updates[1].best_bid, dec!(0.47));
    }

    /// Scenario: junk input, unknown event types, and a book missing a side.
    /// Expected: no updates, no panics.
    #[test]
    fn test_parse_malformed_events() {
        assert!(parse_events("not json").is_empty());
        assert!(parse_events(r#"{"event_type":"last_trade_price"}"#).is_empty());
        let one_sided = serde_json::json!({
            "event_type": "book",
            "asset_id": "tok",
            "bids": [{"price": "0.5", "size": "1"}],
            "asks": []
        })
        .to_string();
        assert!(parse_events(&one_sided).is_empty());
    }

    /// Scenario: YES update arrives first, then NO for the same market.
    /// Expected: fusion yields nothing until both sides are known, then the
    /// pair; later updates replace their side.
    #[test]
    fn test_fusion_requires_both_sides() {
        let mut fusion = FusionTable::new();
        let yes = asset("0xabc", true);
        let no = asset("0xabc", false);

        assert!(fusion.apply(&yes, &update("tok-yes", dec!(0.48), dec!(0.49))).is_none());
        let (y, n) = fusion.apply(&no, &update("tok-no", dec!(0.47), dec!(0.48))).unwrap();
        assert_eq!(y.ask, dec!(0.49));
        assert_eq!(n.ask, dec!(0.48));

        let (y2, _) = fusion.apply(&yes, &update("tok-yes", dec!(0.50), dec!(0.51))).unwrap();
        assert_eq!(y2.ask, dec!(0.51));
    }
}
