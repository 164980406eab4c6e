//! In-memory indicator calculators for historical replay.
//!
//! Replay periods predate the live profile/flow tables, so the backtest
//! recomputes everything from raw candles: the volume profile through the
//! shared engine fast path, and order flow through a candle-shape estimator
//! (close position in the range, adjusted for candle color).

use crate::detectors::market_state::{classify, momentum_score, StateInputs};
use crate::config::DetectorConfig;
use crate::profile::quick_metrics;
use crate::types::{Candle, MarketState, ProfileMetrics};

/// Minimum candle history before the profile calculator reports metrics.
pub const MIN_PROFILE_CANDLES: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlowEstimate {
    pub cumulative_delta: i64,
    pub buy_pressure: f64,
    pub sell_pressure: f64,
    pub cvd_momentum: i64,
}

impl FlowEstimate {
    pub fn neutral() -> Self {
        Self { cumulative_delta: 0, buy_pressure: 50.0, sell_pressure: 50.0, cvd_momentum: 0 }
    }
}

/// Split one candle's volume into buy and sell sides from its shape.
///
/// The close's position in the bar range sets the base ratio (close at the
/// high reads as all buying); candle color shifts the dominant side up by
/// 20%, capped at 100%.
pub fn estimate_candle_flow(candle: &Candle) -> (i64, i64) {
    let range = candle.high - candle.low;
    if range <= 0.0 {
        let half = candle.volume / 2;
        return (half, half);
    }

    let close_position = (candle.close - candle.low) / range;
    let mut buy_ratio = close_position;
    let mut sell_ratio = 1.0 - close_position;

    if candle.close > candle.open {
        buy_ratio = (buy_ratio * 1.2).min(1.0);
        sell_ratio = 1.0 - buy_ratio;
    } else if candle.close < candle.open {
        sell_ratio = (sell_ratio * 1.2).min(1.0);
        buy_ratio = 1.0 - sell_ratio;
    }

    (
        (candle.volume as f64 * buy_ratio) as i64,
        (candle.volume as f64 * sell_ratio) as i64,
    )
}

/// Order-flow estimate over the last `lookback` candles of the window.
pub fn estimate_flow(candles: &[Candle], lookback: usize) -> FlowEstimate {
    if candles.len() < 2 {
        return FlowEstimate::neutral();
    }

    let recent = if candles.len() > lookback {
        &candles[candles.len() - lookback..]
    } else {
        candles
    };

    let mut buy_volume = 0i64;
    let mut sell_volume = 0i64;
    let mut running_cvd = 0i64;
    let mut cvd_history = Vec::with_capacity(recent.len());

    for candle in recent {
        let (buy, sell) = estimate_candle_flow(candle);
        buy_volume += buy;
        sell_volume += sell;
        running_cvd += buy - sell;
        cvd_history.push(running_cvd);
    }

    let total = buy_volume + sell_volume;
    let (buy_pressure, sell_pressure) = if total > 0 {
        (
            buy_volume as f64 / total as f64 * 100.0,
            sell_volume as f64 / total as f64 * 100.0,
        )
    } else {
        (50.0, 50.0)
    };

    let cvd_momentum = if cvd_history.len() >= 2 {
        cvd_history[cvd_history.len() - 1] - cvd_history[0]
    } else {
        0
    };

    FlowEstimate {
        cumulative_delta: buy_volume - sell_volume,
        buy_pressure,
        sell_pressure,
        cvd_momentum,
    }
}

/// Volume-profile metrics over the candle window, or None below the minimum
/// history.
pub fn window_metrics(candles: &[Candle]) -> Option<ProfileMetrics> {
    if candles.len() < MIN_PROFILE_CANDLES {
        return None;
    }
    let bucket = candles.last()?.time;
    quick_metrics(bucket, candles)
}

/// Market-state read for the replay: profile + momentum + estimated flow
/// through the shared classifier.
pub fn window_state(
    candles: &[Candle],
    flow: &FlowEstimate,
    cfg: &DetectorConfig,
) -> Option<(MarketState, i32, ProfileMetrics)> {
    let metrics = window_metrics(candles)?;
    let price = candles.last()?.close;
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let inputs = StateInputs {
        price,
        poc: metrics.poc,
        vah: metrics.vah,
        val: metrics.val,
        momentum: momentum_score(&closes),
        cvd_pressure: flow.buy_pressure - flow.sell_pressure,
    };
    let (state, confidence) = classify(&inputs, cfg);
    Some((state, confidence, metrics))
}
