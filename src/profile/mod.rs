//! Volume profile engine.
//!
//! Per 1-minute bucket and symbol, distributes traded volume across price
//! levels and derives POC / value area / volume-node metrics. Ticks are the
//! preferred input; candles are the fallback approximation.
//!
//! Price levels are bucketed as integer cents internally so map keys are
//! exact and iteration order is deterministic; conversion back to dollars
//! happens at the store boundary.

pub mod calculator;
pub mod flow;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::types::{Candle, ProfileMetrics, Tick};

/// Volume totals at a single price level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LevelTotals {
    pub total: i64,
    pub buy: i64,
    pub sell: i64,
    pub count: i64,
}

/// One bucket's volume profile: price level (cents) → totals.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeProfile {
    pub levels: BTreeMap<i64, LevelTotals>,
}

pub fn cents(price: f64) -> i64 {
    (price * 100.0).round() as i64
}

pub fn dollars(cents: i64) -> f64 {
    cents as f64 / 100.0
}

impl VolumeProfile {
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn total_volume(&self) -> i64 {
        self.levels.values().map(|l| l.total).sum()
    }

    /// (aggressive_buys, aggressive_sells) over the whole bucket.
    pub fn aggressive_totals(&self) -> (i64, i64) {
        self.levels
            .values()
            .fold((0, 0), |(b, s), l| (b + l.buy, s + l.sell))
    }
}

/// Build a profile from ticks using the uptick rule.
///
/// Uptick → aggressive buy, downtick → aggressive sell. Equal price and the
/// first tick split the size: floor half to the buy side, remainder to the
/// sell side.
pub fn profile_from_ticks(ticks: &[Tick]) -> VolumeProfile {
    let mut profile = VolumeProfile::default();
    let mut prev_level: Option<i64> = None;

    for tick in ticks {
        let level = cents(tick.price);
        let entry = profile.levels.entry(level).or_default();
        entry.total += tick.size;
        entry.count += 1;

        match prev_level {
            Some(prev) if level > prev => entry.buy += tick.size,
            Some(prev) if level < prev => entry.sell += tick.size,
            _ => {
                let half = tick.size / 2;
                entry.buy += half;
                entry.sell += tick.size - half;
            }
        }
        prev_level = Some(level);
    }

    profile
}

/// Build an approximate profile from candles.
///
/// Each candle's volume is spread evenly across price levels from low to
/// high (step = max($0.10, range/10), inclusive walk), with the integer
/// remainder assigned to the level nearest the close. The directional split
/// follows candle color: bullish 60% buy / 40% sell of each slice, bearish
/// the reverse. `total = buy + sell` holds per level by construction.
pub fn profile_from_candles(candles: &[Candle]) -> VolumeProfile {
    let mut profile = VolumeProfile::default();

    for candle in candles {
        let low = cents(candle.low);
        let high = cents(candle.high);
        let close = cents(candle.close);
        let open = cents(candle.open);
        let is_bullish = close >= open;

        if candle.volume <= 0 {
            continue;
        }

        let mut levels: Vec<i64> = Vec::new();
        if high <= low {
            levels.push(close);
        } else {
            let step = ((high - low) / 10).max(10);
            let mut current = low;
            while current <= high {
                levels.push(current);
                current += step;
            }
        }

        let n = levels.len() as i64;
        let per_level = candle.volume / n;
        let remainder = candle.volume - per_level * n;

        // Remainder goes to the level nearest the close (first on ties).
        let nearest = levels
            .iter()
            .enumerate()
            .min_by_key(|(_, &p)| (p - close).abs())
            .map(|(i, _)| i)
            .unwrap_or(0);

        for (i, &level) in levels.iter().enumerate() {
            let mut slice = per_level;
            if i == nearest {
                slice += remainder;
            }
            if slice == 0 {
                continue;
            }
            let entry = profile.levels.entry(level).or_default();
            entry.total += slice;
            entry.count += 1;
            let major = slice * 6 / 10;
            if is_bullish {
                entry.buy += major;
                entry.sell += slice - major;
            } else {
                entry.sell += major;
                entry.buy += slice - major;
            }
        }
    }

    profile
}

/// Derive POC, value area, and volume-node metrics from a profile.
///
/// POC is the level with the highest total (ties resolve to the lowest
/// price). The value area expands outward from the POC toward the neighbor
/// with the greater total until it holds at least 70% of bucket volume;
/// equal neighbors expand upward. LVNs sit below 30% of the mean level
/// volume, HVNs above 150%.
pub fn metrics(bucket: DateTime<Utc>, profile: &VolumeProfile) -> Option<ProfileMetrics> {
    if profile.is_empty() {
        return None;
    }

    let prices: Vec<i64> = profile.levels.keys().copied().collect();
    let totals: Vec<i64> = profile.levels.values().map(|l| l.total).collect();
    let total_volume: i64 = totals.iter().sum();
    if total_volume == 0 {
        return None;
    }

    let mut poc_idx = 0;
    for (i, &t) in totals.iter().enumerate() {
        if t > totals[poc_idx] {
            poc_idx = i;
        }
    }

    let target = 0.70 * total_volume as f64;
    let mut accumulated = totals[poc_idx] as f64;
    let mut lo = poc_idx;
    let mut hi = poc_idx;

    while accumulated < target && (lo > 0 || hi < prices.len() - 1) {
        let below = if lo > 0 { Some(totals[lo - 1]) } else { None };
        let above = if hi < prices.len() - 1 { Some(totals[hi + 1]) } else { None };

        match (below, above) {
            (Some(b), Some(a)) if b > a => {
                lo -= 1;
                accumulated += totals[lo] as f64;
            }
            (_, Some(_)) => {
                hi += 1;
                accumulated += totals[hi] as f64;
            }
            (Some(_), None) => {
                lo -= 1;
                accumulated += totals[lo] as f64;
            }
            (None, None) => break,
        }
    }

    let mean = total_volume as f64 / prices.len() as f64;
    let lvns: Vec<f64> = prices
        .iter()
        .zip(&totals)
        .filter(|(_, &t)| (t as f64) < 0.30 * mean)
        .map(|(&p, _)| dollars(p))
        .collect();
    let hvns: Vec<f64> = prices
        .iter()
        .zip(&totals)
        .filter(|(_, &t)| (t as f64) > 1.50 * mean)
        .map(|(&p, _)| dollars(p))
        .collect();

    Some(ProfileMetrics {
        bucket,
        poc: dollars(prices[poc_idx]),
        vah: dollars(prices[hi]),
        val: dollars(prices[lo]),
        total_volume,
        lvns,
        hvns,
    })
}

/// Fast path for backtests: metrics straight from a candle window, no store.
pub fn quick_metrics(bucket: DateTime<Utc>, candles: &[Candle]) -> Option<ProfileMetrics> {
    metrics(bucket, &profile_from_candles(candles))
}
