//! Market-state detection per Auction Market Theory.
//!
//! BALANCE: price rotating around the POC inside the value area.
//! IMBALANCE_UP / IMBALANCE_DOWN: directional break above VAH / below VAL
//! backed by momentum or order-flow pressure.
//!
//! Classification is a pure function of its inputs; the detector wraps it
//! with store reads and an append-only write per detection tick.

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::config::DetectorConfig;
use crate::store::Store;
use crate::types::{MarketState, MarketStateRow};

/// Everything the classifier looks at, already loaded.
#[derive(Clone, Copy, Debug)]
pub struct StateInputs {
    pub price: f64,
    pub poc: f64,
    pub vah: f64,
    pub val: f64,
    /// Signed momentum in [-100, 100], see [`momentum_score`].
    pub momentum: f64,
    /// buy_pressure − sell_pressure of the latest flow row.
    pub cvd_pressure: f64,
}

/// Directional momentum over a close series.
///
/// Base is the percent change over the window scaled by 10; a run of three
/// or more consecutive up closes adds 20, a down run subtracts 20. Equal
/// closes break a run. Clamped to [-100, 100].
pub fn momentum_score(closes: &[f64]) -> f64 {
    if closes.len() < 2 || closes[0] == 0.0 {
        return 0.0;
    }

    let change_pct = (closes[closes.len() - 1] - closes[0]) / closes[0] * 100.0;
    let mut momentum = change_pct * 10.0;

    let mut up = 0;
    let mut down = 0;
    let mut max_up = 0;
    let mut max_down = 0;
    for pair in closes.windows(2) {
        if pair[1] > pair[0] {
            up += 1;
            down = 0;
            max_up = max_up.max(up);
        } else if pair[1] < pair[0] {
            down += 1;
            up = 0;
            max_down = max_down.max(down);
        } else {
            up = 0;
            down = 0;
        }
    }

    if max_up >= 3 {
        momentum += 20.0;
    }
    if max_down >= 3 {
        momentum -= 20.0;
    }

    momentum.clamp(-100.0, 100.0)
}

/// Rule-based additive-confidence classification.
///
/// Each rule may assign a state and add confidence; later rules override
/// earlier state assignments. If no rule assigns a state the output is
/// (UNKNOWN, 0) regardless of accumulated confidence.
pub fn classify(inputs: &StateInputs, cfg: &DetectorConfig) -> (MarketState, i32) {
    if inputs.poc <= 0.0 {
        return (MarketState::Unknown, 0);
    }

    let t = cfg.poc_distance_threshold;
    let dist = (inputs.price - inputs.poc).abs() / inputs.poc * 100.0;
    let in_value_area = inputs.val <= inputs.price && inputs.price <= inputs.vah;

    let mut state: Option<MarketState> = None;
    let mut confidence = 0;

    // Distance from POC
    if dist < t {
        state = Some(MarketState::Balance);
        confidence += 40;
    } else if dist < t * 1.67 {
        confidence += 20;
    } else {
        confidence += 30;
    }

    // Value-area position
    if in_value_area {
        if dist < t * 1.33 {
            state = Some(MarketState::Balance);
            confidence += 30;
        }
    } else if inputs.price > inputs.vah {
        state = Some(MarketState::ImbalanceUp);
        confidence += 30;
    } else if inputs.price < inputs.val {
        state = Some(MarketState::ImbalanceDown);
        confidence += 30;
    }

    // Momentum
    if inputs.momentum.abs() > cfg.momentum_threshold {
        state = Some(if inputs.momentum > 0.0 {
            MarketState::ImbalanceUp
        } else {
            MarketState::ImbalanceDown
        });
        confidence += 20;
    } else if inputs.momentum.abs() < cfg.momentum_threshold * 0.33 {
        state = Some(MarketState::Balance);
        confidence += 10;
    }

    // CVD pressure
    if inputs.cvd_pressure.abs() > cfg.cvd_pressure_threshold {
        state = Some(if inputs.cvd_pressure > 0.0 {
            MarketState::ImbalanceUp
        } else {
            MarketState::ImbalanceDown
        });
        confidence += 10;
    }

    match state {
        Some(s) => (s, confidence.clamp(0, 100)),
        None => (MarketState::Unknown, 0),
    }
}

pub struct MarketStateDetector {
    store: Store,
    cfg: DetectorConfig,
}

impl MarketStateDetector {
    pub fn new(store: Store, cfg: DetectorConfig) -> Self {
        Self { store, cfg }
    }

    /// Detect the current state for one symbol. Recoverable problems (no
    /// price yet, no profile yet) degrade to the UNKNOWN default row.
    pub async fn detect(&self, symbol_id: i32) -> MarketStateRow {
        let now = Utc::now();
        let unknown = MarketStateRow {
            time: now,
            state: MarketState::Unknown,
            confidence: 0,
            balance_high: None,
            balance_low: None,
            poc: None,
        };

        let price = match self.store.latest_close(symbol_id).await {
            Ok(Some(p)) => p,
            Ok(None) => return unknown,
            Err(e) => {
                warn!(target: "state", symbol_id, error = %e, "price lookup failed");
                return unknown;
            }
        };
        let metrics = match self.store.latest_profile_metrics(symbol_id).await {
            Ok(Some(m)) => m,
            Ok(None) => return unknown,
            Err(e) => {
                warn!(target: "state", symbol_id, error = %e, "metrics lookup failed");
                return unknown;
            }
        };

        let since = now - Duration::minutes(self.cfg.lookback_period);
        let closes: Vec<f64> = self
            .store
            .candles_since(symbol_id, since)
            .await
            .unwrap_or_default()
            .iter()
            .map(|c| c.close)
            .collect();
        let momentum = momentum_score(&closes);

        let cvd_pressure = self
            .store
            .recent_order_flow(symbol_id, 1)
            .await
            .unwrap_or_default()
            .first()
            .map(|f| f.buy_pressure - f.sell_pressure)
            .unwrap_or(0.0);

        let inputs = StateInputs {
            price,
            poc: metrics.poc,
            vah: metrics.vah,
            val: metrics.val,
            momentum,
            cvd_pressure,
        };
        let (state, confidence) = classify(&inputs, &self.cfg);

        MarketStateRow {
            time: now,
            state,
            confidence,
            balance_high: Some(metrics.vah),
            balance_low: Some(metrics.val),
            poc: Some(metrics.poc),
        }
    }

    /// Detect and persist the state of every known symbol.
    pub async fn run_all(&self) {
        let symbols = match self.store.all_symbols().await {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "state", error = %e, "symbol listing failed");
                return;
            }
        };

        for (symbol_id, symbol) in symbols {
            let row = self.detect(symbol_id).await;
            debug!(
                target: "state",
                %symbol,
                state = %row.state,
                confidence = row.confidence,
                "detected"
            );
            if let Err(e) = self.store.insert_market_state(symbol_id, &row).await {
                warn!(target: "state", %symbol, error = %e, "state insert failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DetectorConfig {
        DetectorConfig::default()
    }

    // ── momentum ──

    /// Scenario: four rising closes 100→103.
    /// Expected: base 30 (3% × 10) plus 20 for the 3-long up run = 50.
    #[test]
    fn test_momentum_up_run_bonus() {
        let m = momentum_score(&[100.0, 101.0, 102.0, 103.0]);
        assert!((m - 50.0).abs() < 1e-9, "momentum {}", m);
    }

    /// Scenario: four falling closes 100→97.
    /// Expected: symmetric negative: -30 - 20 = -50.
    #[test]
    fn test_momentum_down_run_bonus() {
        let m = momentum_score(&[100.0, 99.0, 98.0, 97.0]);
        assert!((m + 50.0).abs() < 1e-9, "momentum {}", m);
    }

    /// Scenario: an equal close interrupts the up run.
    /// Expected: runs reset on flat closes, so no +20 bonus applies.
    #[test]
    fn test_momentum_flat_close_breaks_run() {
        let m = momentum_score(&[100.0, 101.0, 101.0, 102.0, 103.0]);
        assert!((m - 30.0).abs() < 1e-9, "momentum {}", m);
    }

    /// Scenario: a 15% move over the window.
    /// Expected: base 150 clamps to 100.
    #[test]
    fn test_momentum_clamped() {
        let m = momentum_score(&[100.0, 115.0]);
        assert!((m - 100.0).abs() < 1e-9);
        let m = momentum_score(&[100.0, 85.0]);
        assert!((m + 100.0).abs() < 1e-9);
    }

    /// Scenario: fewer than two closes, or a zero first close.
    /// Expected: momentum is 0 in both degenerate cases.
    #[test]
    fn test_momentum_degenerate_inputs() {
        assert_eq!(momentum_score(&[]), 0.0);
        assert_eq!(momentum_score(&[100.0]), 0.0);
        assert_eq!(momentum_score(&[0.0, 100.0]), 0.0);
    }

    /// Scenario: a round trip — three up closes then three down closes back
    /// to the start.
    /// Expected: both run bonuses apply and cancel; net change is zero, so
    /// momentum is exactly 0.
    #[test]
    fn test_momentum_both_runs_cancel() {
        let closes = [100.0, 101.0, 102.0, 103.0, 102.0, 101.0, 100.0];
        let m = momentum_score(&closes);
        assert!((m - 0.0).abs() < 1e-9, "momentum {}", m);
    }

    // ── classification ──

    /// Scenario: price sitting on the POC inside the value area, quiet
    /// momentum and flow.
    /// Expected: BALANCE with confidence 40 + 30 + 10 = 80.
    #[test]
    fn test_classify_balance_at_poc() {
        let inputs = StateInputs {
            price: 100.0,
            poc: 100.0,
            vah: 101.0,
            val: 99.0,
            momentum: 0.0,
            cvd_pressure: 0.0,
        };
        let (state, confidence) = classify(&inputs, &cfg());
        assert_eq!(state, MarketState::Balance);
        assert_eq!(confidence, 80);
    }

    /// Scenario: breakout — price 3% above POC and above VAH, strong
    /// momentum and buy-side CVD pressure.
    /// Expected: IMBALANCE_UP with confidence 30 + 30 + 20 + 10 = 90.
    #[test]
    fn test_classify_imbalance_up_breakout() {
        let inputs = StateInputs {
            price: 103.0,
            poc: 100.0,
            vah: 101.0,
            val: 99.0,
            momentum: 2.0,
            cvd_pressure: 20.0,
        };
        let (state, confidence) = classify(&inputs, &cfg());
        assert_eq!(state, MarketState::ImbalanceUp);
        assert_eq!(confidence, 90);
    }

    /// Scenario: breakdown below VAL with selling pressure.
    /// Expected: IMBALANCE_DOWN, mirror of the breakout case.
    #[test]
    fn test_classify_imbalance_down_breakdown() {
        let inputs = StateInputs {
            price: 97.0,
            poc: 100.0,
            vah: 101.0,
            val: 99.0,
            momentum: -2.0,
            cvd_pressure: -20.0,
        };
        let (state, confidence) = classify(&inputs, &cfg());
        assert_eq!(state, MarketState::ImbalanceDown);
        assert_eq!(confidence, 90);
    }

    /// Scenario: every rule lands in its dead zone — moderate POC distance,
    /// inside the value area but not close enough, middling momentum, weak
    /// CVD pressure.
    /// Expected: UNKNOWN with zero confidence even though rules accumulated
    /// confidence without assigning a state.
    #[test]
    fn test_classify_unknown_when_no_rule_fires() {
        let inputs = StateInputs {
            price: 102.0, // dist 2% — between 1.5 and 2.505
            poc: 100.0,
            vah: 103.0, // in value area, but dist ≥ 1.995
            val: 99.0,
            momentum: 1.0,     // between 0.495 and 1.5
            cvd_pressure: 10.0, // below 15
        };
        let (state, confidence) = classify(&inputs, &cfg());
        assert_eq!(state, MarketState::Unknown);
        assert_eq!(confidence, 0);
    }

    /// Scenario: momentum rule flips a BALANCE read into IMBALANCE.
    /// Expected: later rules override earlier state assignments.
    #[test]
    fn test_classify_momentum_overrides_balance() {
        let inputs = StateInputs {
            price: 100.0,
            poc: 100.0,
            vah: 101.0,
            val: 99.0,
            momentum: 5.0,
            cvd_pressure: 0.0,
        };
        let (state, confidence) = classify(&inputs, &cfg());
        assert_eq!(state, MarketState::ImbalanceUp);
        // 40 (near POC) + 30 (in VA) + 20 (momentum)
        assert_eq!(confidence, 90);
    }

    /// Scenario: degenerate metrics with POC at zero.
    /// Expected: UNKNOWN, 0 — the classifier refuses to divide by zero.
    #[test]
    fn test_classify_zero_poc() {
        let inputs = StateInputs {
            price: 100.0,
            poc: 0.0,
            vah: 0.0,
            val: 0.0,
            momentum: 0.0,
            cvd_pressure: 0.0,
        };
        assert_eq!(classify(&inputs, &cfg()), (MarketState::Unknown, 0));
    }

    /// Scenario: confidence never exceeds 100 across representative inputs.
    /// Expected: the clamp holds for the maximal-rule case.
    #[test]
    fn test_classify_confidence_bounded() {
        let inputs = StateInputs {
            price: 100.1,
            poc: 100.0,
            vah: 101.0,
            val: 99.0,
            momentum: 0.0,
            cvd_pressure: 50.0,
        };
        let (_, confidence) = classify(&inputs, &cfg());
        assert!((0..=100).contains(&confidence));
    }

    /// Scenario: identical inputs classified twice.
    /// Expected: identical outputs — classification is pure.
    #[test]
    fn test_classify_is_pure() {
        let inputs = StateInputs {
            price: 103.0,
            poc: 100.0,
            vah: 101.0,
            val: 99.0,
            momentum: 2.0,
            cvd_pressure: 20.0,
        };
        assert_eq!(classify(&inputs, &cfg()), classify(&inputs, &cfg()));
    }
}
