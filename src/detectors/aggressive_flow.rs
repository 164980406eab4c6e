//! Aggressive-flow indicator.
//!
//! Scores 0-100 from volume spikes, CVD momentum, and one-sided pressure.
//! Aggressive flow at key levels is the entry confirmation the strategy
//! waits for.

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::store::Store;
use crate::types::{Aggression, FlowDirection};

const VOLUME_SPIKE_RATIO: f64 = 2.0;
const HIGH_PRESSURE: f64 = 70.0;

/// Additive score out of 100: volume ratio up to 30, CVD momentum up to 40,
/// one-sided pressure up to 30.
pub fn aggression_score(
    volume_ratio: f64,
    cvd_momentum: i64,
    buy_pressure: f64,
    sell_pressure: f64,
) -> i32 {
    let mut score = 0;

    if volume_ratio >= 3.0 {
        score += 30;
    } else if volume_ratio >= 2.0 {
        score += 20;
    } else if volume_ratio >= 1.5 {
        score += 10;
    }

    let momentum = cvd_momentum.abs();
    if momentum >= 2000 {
        score += 40;
    } else if momentum >= 1000 {
        score += 30;
    } else if momentum >= 500 {
        score += 20;
    } else if momentum >= 100 {
        score += 10;
    }

    let max_pressure = buy_pressure.max(sell_pressure);
    if max_pressure >= 80.0 {
        score += 30;
    } else if max_pressure >= 70.0 {
        score += 20;
    } else if max_pressure >= 60.0 {
        score += 10;
    }

    score.min(100)
}

/// Direction of the aggression: pressure extremes first, then CVD momentum.
pub fn flow_direction(buy_pressure: f64, sell_pressure: f64, cvd_momentum: i64) -> FlowDirection {
    if buy_pressure >= HIGH_PRESSURE || cvd_momentum > 500 {
        FlowDirection::Buy
    } else if sell_pressure >= HIGH_PRESSURE || cvd_momentum < -500 {
        FlowDirection::Sell
    } else {
        FlowDirection::Neutral
    }
}

/// Assemble the full indicator output from its raw components.
pub fn assess(
    volume_ratio: f64,
    cvd_momentum: i64,
    buy_pressure: f64,
    sell_pressure: f64,
) -> Aggression {
    let score = aggression_score(volume_ratio, cvd_momentum, buy_pressure, sell_pressure);
    Aggression {
        score,
        direction: flow_direction(buy_pressure, sell_pressure, cvd_momentum),
        volume_spike: volume_ratio >= VOLUME_SPIKE_RATIO,
        volume_ratio,
        cvd_momentum,
        buy_pressure,
        sell_pressure,
        is_aggressive: score >= 50,
    }
}

pub struct AggressiveFlowIndicator {
    store: Store,
}

impl AggressiveFlowIndicator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Detect aggression for one symbol over the last `lookback_minutes` of
    /// flow rows. Missing data degrades to the neutral default.
    pub async fn detect(&self, symbol_id: i32, lookback_minutes: i64) -> Aggression {
        let now = Utc::now();

        let flow = match self
            .store
            .order_flow_window(symbol_id, now - Duration::minutes(lookback_minutes))
            .await
        {
            Ok(rows) if !rows.is_empty() => rows,
            Ok(_) => return Aggression::neutral(),
            Err(e) => {
                warn!(target: "flow", symbol_id, error = %e, "flow window load failed");
                return Aggression::neutral();
            }
        };

        let avg_volume = self
            .store
            .avg_volume_since(symbol_id, now - Duration::minutes(60))
            .await
            .unwrap_or(1.0);
        let current_volume = self
            .store
            .volume_since(symbol_id, now - Duration::minutes(1))
            .await
            .unwrap_or(0.0);
        let volume_ratio = if avg_volume > 0.0 { current_volume / avg_volume } else { 1.0 };

        let cvd_momentum = if flow.len() >= 2 {
            flow[flow.len() - 1].cumulative_delta - flow[0].cumulative_delta
        } else {
            0
        };

        let latest = &flow[flow.len() - 1];
        assess(volume_ratio, cvd_momentum, latest.buy_pressure, latest.sell_pressure)
    }

    /// Run detection over every known symbol, logging aggressive readings.
    pub async fn run_all(&self) {
        let symbols = match self.store.all_symbols().await {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "flow", error = %e, "symbol listing failed");
                return;
            }
        };
        for (symbol_id, symbol) in symbols {
            let aggression = self.detect(symbol_id, 5).await;
            if aggression.is_aggressive {
                info!(
                    target: "flow",
                    %symbol,
                    score = aggression.score,
                    direction = %aggression.direction,
                    cvd = aggression.cvd_momentum,
                    volume_ratio = format!("{:.2}", aggression.volume_ratio),
                    "aggressive flow"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: all three components at their maximum tier.
    /// Expected: 30 + 40 + 30 = 100, flagged aggressive.
    #[test]
    fn test_score_maximum() {
        let a = assess(3.5, 2500, 85.0, 15.0);
        assert_eq!(a.score, 100);
        assert!(a.is_aggressive);
        assert!(a.volume_spike);
    }

    /// Scenario: walk each volume-ratio tier with the other components muted.
    /// Expected: 30 / 20 / 10 / 0 points.
    #[test]
    fn test_volume_ratio_tiers() {
        assert_eq!(aggression_score(3.0, 0, 50.0, 50.0), 30);
        assert_eq!(aggression_score(2.0, 0, 50.0, 50.0), 20);
        assert_eq!(aggression_score(1.5, 0, 50.0, 50.0), 10);
        assert_eq!(aggression_score(1.4, 0, 50.0, 50.0), 0);
    }

    /// Scenario: walk each CVD-momentum tier, sign-independent.
    /// Expected: 40 / 30 / 20 / 10 / 0 points.
    #[test]
    fn test_cvd_momentum_tiers() {
        assert_eq!(aggression_score(1.0, 2000, 50.0, 50.0), 40);
        assert_eq!(aggression_score(1.0, -2000, 50.0, 50.0), 40);
        assert_eq!(aggression_score(1.0, 1000, 50.0, 50.0), 30);
        assert_eq!(aggression_score(1.0, 500, 50.0, 50.0), 20);
        assert_eq!(aggression_score(1.0, 100, 50.0, 50.0), 10);
        assert_eq!(aggression_score(1.0, 99, 50.0, 50.0), 0);
    }

    /// Scenario: walk the max-pressure tiers using the sell side.
    /// Expected: 30 / 20 / 10 / 0 points; side does not matter.
    #[test]
    fn test_pressure_tiers() {
        assert_eq!(aggression_score(1.0, 0, 20.0, 80.0), 30);
        assert_eq!(aggression_score(1.0, 0, 30.0, 70.0), 20);
        assert_eq!(aggression_score(1.0, 0, 40.0, 60.0), 10);
        assert_eq!(aggression_score(1.0, 0, 45.0, 55.0), 0);
    }

    /// Scenario: direction resolution order — pressure extremes win, then
    /// CVD momentum above ±500, else neutral.
    /// Expected: BUY for bp ≥ 70 or CVDmom > 500; SELL mirrored; NEUTRAL
    /// otherwise.
    #[test]
    fn test_direction_rules() {
        assert_eq!(flow_direction(75.0, 25.0, 0), FlowDirection::Buy);
        assert_eq!(flow_direction(25.0, 75.0, 0), FlowDirection::Sell);
        assert_eq!(flow_direction(50.0, 50.0, 501), FlowDirection::Buy);
        assert_eq!(flow_direction(50.0, 50.0, -501), FlowDirection::Sell);
        assert_eq!(flow_direction(50.0, 50.0, 500), FlowDirection::Neutral);
        assert_eq!(flow_direction(60.0, 40.0, 0), FlowDirection::Neutral);
    }

    /// Scenario: score exactly at the aggressive boundary (50).
    /// Expected: is_aggressive is true at 50 and false at 40.
    #[test]
    fn test_is_aggressive_threshold() {
        // 20 (vol 2x) + 30 (cvd 1000) = 50
        let at = assess(2.0, 1000, 50.0, 50.0);
        assert_eq!(at.score, 50);
        assert!(at.is_aggressive);

        // 20 (vol 2x) + 20 (cvd 500) = 40
        let below = assess(2.0, 500, 50.0, 50.0);
        assert_eq!(below.score, 40);
        assert!(!below.is_aggressive);
    }

    /// Scenario: neutral default shape.
    /// Expected: 50/50 pressures, ratio 1.0, nothing flagged.
    #[test]
    fn test_neutral_default() {
        let a = Aggression::neutral();
        assert_eq!(a.score, 0);
        assert_eq!(a.direction, FlowDirection::Neutral);
        assert!(!a.is_aggressive);
        assert!(!a.volume_spike);
    }
}
