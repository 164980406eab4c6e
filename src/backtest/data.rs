//! Historical data loading for replay: per-symbol candle series merged into
//! a single timestamp-ordered map so all symbols advance bar by bar
//! together.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::Result;
use crate::store::Store;
use crate::types::Candle;

#[derive(Clone, Copy, Debug)]
pub struct Bar {
    pub symbol_id: i32,
    pub candle: Candle,
}

/// timestamp → symbol → bar, both levels in deterministic order.
pub type MergedBars = BTreeMap<DateTime<Utc>, BTreeMap<String, Bar>>;

/// Merge per-symbol series by timestamp.
pub fn merge_series(series: &BTreeMap<String, (i32, Vec<Candle>)>) -> MergedBars {
    let mut merged: MergedBars = BTreeMap::new();
    for (symbol, (symbol_id, candles)) in series {
        for candle in candles {
            merged
                .entry(candle.time)
                .or_default()
                .insert(symbol.clone(), Bar { symbol_id: *symbol_id, candle: *candle });
        }
    }
    merged
}

/// Load candle series for every symbol over `[start, end]` and merge them.
/// Symbols without stored data are skipped.
pub async fn load_and_merge(
    store: &Store,
    symbols: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<MergedBars> {
    let mut series: BTreeMap<String, (i32, Vec<Candle>)> = BTreeMap::new();

    for symbol in symbols {
        let Some(symbol_id) = store.symbol_id(symbol).await? else {
            info!(target: "backtest", %symbol, "symbol unknown to store, skipping");
            continue;
        };
        let candles = store.candles_between(symbol_id, start, end).await?;
        info!(target: "backtest", %symbol, candles = candles.len(), "loaded");
        if !candles.is_empty() {
            series.insert(symbol.clone(), (symbol_id, candles));
        }
    }

    let merged = merge_series(&series);
    info!(
        target: "backtest",
        timestamps = merged.len(),
        symbols = series.len(),
        "merged bars"
    );
    Ok(merged)
}
