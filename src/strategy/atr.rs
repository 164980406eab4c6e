//! Average True Range.
//!
//! Volatility input for the strategy's stop/target placement and risk
//! sizing. True range per bar is max(high − low, |high − prev_close|,
//! |low − prev_close|); ATR is the mean over the window.

use crate::store::Store;
use crate::types::{Candle, Side};

pub const DEFAULT_PERIODS: usize = 14;

/// ATR over the last `periods` true ranges of an ascending candle series.
/// Needs `periods + 1` candles; returns None on insufficient history.
pub fn average_true_range(candles: &[Candle], periods: usize) -> Option<f64> {
    if periods == 0 || candles.len() < periods + 1 {
        return None;
    }

    let window = &candles[candles.len() - (periods + 1)..];
    let mut sum = 0.0;
    for pair in window.windows(2) {
        let prev_close = pair[0].close;
        let c = &pair[1];
        let tr = (c.high - c.low)
            .max((c.high - prev_close).abs())
            .max((c.low - prev_close).abs());
        sum += tr;
    }

    Some(sum / periods as f64)
}

/// Stop and target prices from the ATR. When ATR is unavailable the levels
/// fall back to fixed percentages (2% stop, 4% target).
pub fn atr_levels(
    atr: Option<f64>,
    current_price: f64,
    side: Side,
    stop_multiplier: f64,
    target_multiplier: f64,
) -> (f64, f64) {
    match atr {
        Some(atr) if atr > 0.0 => {
            let stop_distance = atr * stop_multiplier;
            let target_distance = atr * target_multiplier;
            match side {
                Side::Buy => (current_price - stop_distance, current_price + target_distance),
                Side::Sell => (current_price + stop_distance, current_price - target_distance),
            }
        }
        _ => match side {
            Side::Buy => (current_price * 0.98, current_price * 1.04),
            Side::Sell => (current_price * 1.02, current_price * 0.96),
        },
    }
}

/// Load the latest candles for a symbol and compute its ATR.
pub async fn atr_from_store(store: &Store, symbol_id: i32, periods: usize) -> Option<f64> {
    let candles = store.last_candles(symbol_id, periods as i64 + 1).await.ok()?;
    average_true_range(&candles, periods)
}
