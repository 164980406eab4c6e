//! Polling ingestion worker.
//!
//! Every 60 seconds, per symbol: backfill up to 100 intraday candles when
//! the store holds fewer than 20, otherwise fetch the most recent handful.
//! The demo source synthesizes a random walk so the full pipeline runs
//! without provider credentials.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::feeds::persist_record;
use crate::profile::calculator::bucket_floor;
use crate::store::{Store, SymbolCache};
use crate::types::{Candle, NormalizedRecord};

const BACKFILL_THRESHOLD: i64 = 20;
const BACKFILL_LIMIT: usize = 100;
const LATEST_LIMIT: usize = 5;

#[derive(Clone, Debug)]
pub enum PollingSource {
    /// Intraday REST API returning a 1-minute time series.
    Intraday { api_url: String, api_key: String },
    /// Synthetic random-walk candles for credential-less runs.
    Demo,
}

/// Parse an intraday time-series response:
/// `{"Time Series (1min)": {"2025-01-02 12:00:00": {"1. open": "..", ...}}}`.
pub fn parse_intraday(body: &serde_json::Value) -> Vec<Candle> {
    let Some(series) = body.get("Time Series (1min)").and_then(|s| s.as_object()) else {
        return Vec::new();
    };

    let mut candles: Vec<Candle> = series
        .iter()
        .filter_map(|(time_str, fields)| {
            let naive = NaiveDateTime::parse_from_str(time_str, "%Y-%m-%d %H:%M:%S").ok()?;
            let time = DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc);
            let field = |key: &str| -> Option<f64> {
                fields.get(key)?.as_str()?.parse().ok()
            };
            Some(Candle {
                time,
                open: field("1. open")?,
                high: field("2. high")?,
                low: field("3. low")?,
                close: field("4. close")?,
                volume: field("5. volume")? as i64,
            })
        })
        .collect();

    candles.sort_by_key(|c| c.time);
    candles
}

/// Deterministic-per-symbol random walk anchored at the current minute.
pub fn demo_candles(symbol: &str, minutes: usize, now: DateTime<Utc>) -> Vec<Candle> {
    let seed = symbol.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    let mut rng = StdRng::seed_from_u64(seed);
    let base_price = 50.0 + (seed % 400) as f64;

    let anchor = bucket_floor(now);
    let mut price = base_price;
    let mut candles = Vec::with_capacity(minutes);
    for i in (1..=minutes).rev() {
        let open = price;
        let drift: f64 = rng.gen_range(-0.004..0.004);
        let close = (open * (1.0 + drift)).max(1.0);
        let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.002));
        let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.002));
        candles.push(Candle {
            time: anchor - Duration::minutes(i as i64),
            open,
            high,
            low,
            close,
            volume: rng.gen_range(500..5000),
        });
        price = close;
    }
    candles
}

impl PollingSource {
    pub async fn fetch_intraday(
        &self,
        http: &reqwest::Client,
        symbol: &str,
    ) -> Result<Vec<Candle>> {
        match self {
            PollingSource::Intraday { api_url, api_key } => {
                let url = format!(
                    "{}/query?function=TIME_SERIES_INTRADAY&symbol={}&interval=1min&outputsize=compact&apikey={}",
                    api_url.trim_end_matches('/'),
                    symbol,
                    api_key,
                );
                let resp = http.get(&url).send().await?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(Error::Broker {
                        status: status.as_u16(),
                        body: resp.text().await.unwrap_or_default(),
                    });
                }
                let body: serde_json::Value = resp.json().await?;
                Ok(parse_intraday(&body))
            }
            PollingSource::Demo => Ok(demo_candles(symbol, BACKFILL_LIMIT, Utc::now())),
        }
    }
}

pub async fn polling_worker(
    store: Store,
    source: PollingSource,
    symbols: Vec<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("reqwest client");
    let mut cache = SymbolCache::new();

    info!(target: "ingest", symbols = symbols.len(), "polling worker started");

    loop {
        let mut sleep_secs = 60;

        for symbol in &symbols {
            let result = poll_symbol(&store, &source, &http, &mut cache, symbol).await;
            if let Err(e) = result {
                warn!(target: "ingest", %symbol, error = %e, "poll failed");
                sleep_secs = 15;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(target: "ingest", "polling worker shutting down");
                    return;
                }
            }
        }
    }
}

async fn poll_symbol(
    store: &Store,
    source: &PollingSource,
    http: &reqwest::Client,
    cache: &mut SymbolCache,
    symbol: &str,
) -> Result<()> {
    let symbol_id = cache.id(store, symbol).await?;
    let existing = store.candle_count(symbol_id).await?;

    let candles = source.fetch_intraday(http, symbol).await?;
    let take = if existing < BACKFILL_THRESHOLD { BACKFILL_LIMIT } else { LATEST_LIMIT };
    let start = candles.len().saturating_sub(take);

    for candle in &candles[start..] {
        let record = NormalizedRecord::Candle {
            symbol: symbol.to_string(),
            candle: *candle,
        };
        persist_record(store, cache, &record).await?;
    }
    Ok(())
}
