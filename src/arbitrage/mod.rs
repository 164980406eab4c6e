//! Binary-market arbitrage engine.
//!
//! Streams YES/NO quotes per market, fuses both sides, and flags spreads
//! below the threshold: buying both outcomes for under $1.00 locks the
//! payoff. Execution places paired orders; a 60-second scanner exits
//! positions early when the spread normalizes.

pub mod client;
pub mod feed;
pub mod markets;
pub mod monitor;
pub mod strategy;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Spread evaluation shared by the feed (flagging) and the strategy
/// (execution gating).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpreadEval {
    pub spread: Decimal,
    pub arbitrage: bool,
    /// Net profit percent after fees, relative to cost.
    pub estimated_profit_pct: Decimal,
}

pub fn evaluate_spread(
    yes_ask: Decimal,
    no_ask: Decimal,
    spread_threshold: Decimal,
    fee_rate: Decimal,
) -> SpreadEval {
    let spread = yes_ask + no_ask;
    let arbitrage = spread < spread_threshold;

    let estimated_profit_pct = if spread > Decimal::ZERO {
        let gross = dec!(1.00) - spread;
        let fees = spread * fee_rate;
        (gross - fees) / spread * dec!(100)
    } else {
        Decimal::ZERO
    };

    SpreadEval { spread, arbitrage, estimated_profit_pct }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rust_decimal::prelude::ToPrimitive;

    /// Scenario: YES ask 0.49, NO ask 0.48, threshold 0.995, no fees.
    /// Expected: spread 0.97, flagged, estimated profit ≈ 3.09%.
    #[test]
    fn test_spread_detection() {
        let eval = evaluate_spread(dec!(0.49), dec!(0.48), dec!(0.995), Decimal::ZERO);
        assert_eq!(eval.spread, dec!(0.97));
        assert!(eval.arbitrage);
        let profit = eval.estimated_profit_pct.to_f64().unwrap();
        assert!((profit - 3.0928).abs() < 0.001, "profit {profit}");
    }

    /// Scenario: spread exactly at the threshold.
    /// Expected: not flagged — the rule is strictly below.
    #[test]
    fn test_threshold_is_strict() {
        let eval = evaluate_spread(dec!(0.50), dec!(0.495), dec!(0.995), Decimal::ZERO);
        assert_eq!(eval.spread, dec!(0.995));
        assert!(!eval.arbitrage);
    }

    /// Scenario: flag equivalence across a grid of asks.
    /// Expected: arbitrage ⟺ yes_ask + no_ask < threshold, every time.
    #[test]
    fn test_flag_equivalence_invariant() {
        let threshold = dec!(0.995);
        for yes_c in (40..60).step_by(3) {
            for no_c in (40..60).step_by(3) {
                let yes = Decimal::new(yes_c, 2);
                let no = Decimal::new(no_c, 2);
                let eval = evaluate_spread(yes, no, threshold, Decimal::ZERO);
                assert_eq!(eval.arbitrage, yes + no < threshold, "yes {yes} no {no}");
            }
        }
    }

    /// Scenario: a 2% fee rate on a 0.97 spread.
    /// Expected: fees cut the net profit: (0.03 − 0.0194) / 0.97 ≈ 1.09%.
    #[test]
    fn test_fees_reduce_profit() {
        let eval = evaluate_spread(dec!(0.49), dec!(0.48), dec!(0.995), dec!(0.02));
        let profit = eval.estimated_profit_pct.to_f64().unwrap();
        assert!((profit - 1.0928).abs() < 0.001, "profit {profit}");
    }

    /// Scenario: degenerate zero spread (both books empty → zero asks).
    /// Expected: profit reported as zero, no division by zero.
    #[test]
    fn test_zero_spread_degenerate() {
        let eval = evaluate_spread(Decimal::ZERO, Decimal::ZERO, dec!(0.995), Decimal::ZERO);
        assert_eq!(eval.estimated_profit_pct, Decimal::ZERO);
        assert!(eval.arbitrage); // 0 < 0.995, flagged but unexecutable (strategy gates size)
    }
}
