//! Order-flow derivation from a bucket's volume profile.

use chrono::{DateTime, Utc};

use crate::profile::VolumeProfile;
use crate::types::OrderFlowRow;

/// Derive the order-flow row for one bucket.
///
/// `prev_cvd` is the cumulative delta of the latest earlier bucket for the
/// same symbol (0 at the start of history); the new cumulative delta chains
/// from it. An empty bucket carries the CVD forward with neutral pressures.
pub fn order_flow_from_profile(
    bucket: DateTime<Utc>,
    profile: &VolumeProfile,
    prev_cvd: i64,
) -> OrderFlowRow {
    let (aggressive_buys, aggressive_sells) = profile.aggressive_totals();
    let total = aggressive_buys + aggressive_sells;
    let delta = aggressive_buys - aggressive_sells;

    let (buy_pressure, sell_pressure) = if total > 0 {
        (
            aggressive_buys as f64 / total as f64 * 100.0,
            aggressive_sells as f64 / total as f64 * 100.0,
        )
    } else {
        (50.0, 50.0)
    };

    OrderFlowRow {
        bucket,
        delta,
        cumulative_delta: prev_cvd + delta,
        aggressive_buys,
        aggressive_sells,
        buy_pressure,
        sell_pressure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::profile_from_ticks;
    use crate::types::Tick;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 14, 30, 0).unwrap()
    }

    fn tick(offset_s: i64, price: f64, size: i64) -> Tick {
        Tick {
            time: t0() + chrono::Duration::seconds(offset_s),
            price,
            size,
            venue: String::new(),
        }
    }

    /// Scenario: the uptick-rule tick sequence (buy=35, sell=23) with prior
    /// CVD 100.
    /// Expected: delta = +12, cumulative delta chains to 112, pressures sum
    /// to 100 with the buy side above 60%.
    #[test]
    fn test_flow_from_tick_profile() {
        let ticks = vec![
            tick(0, 100.0, 10),
            tick(1, 101.0, 20),
            tick(2, 101.0, 5),
            tick(3, 100.0, 15),
            tick(4, 102.0, 8),
        ];
        let profile = profile_from_ticks(&ticks);
        let flow = order_flow_from_profile(t0(), &profile, 100);

        assert_eq!(flow.aggressive_buys, 35);
        assert_eq!(flow.aggressive_sells, 23);
        assert_eq!(flow.delta, 12);
        assert_eq!(flow.cumulative_delta, 112);
        assert!((flow.buy_pressure + flow.sell_pressure - 100.0).abs() < 1e-9);
        assert!((flow.buy_pressure - 35.0 / 58.0 * 100.0).abs() < 1e-9);
    }

    /// Scenario: empty bucket with prior CVD -40.
    /// Expected: zero delta, CVD carried unchanged, 50/50 pressures.
    #[test]
    fn test_flow_empty_bucket_defaults() {
        let flow = order_flow_from_profile(t0(), &VolumeProfile::default(), -40);
        assert_eq!(flow.delta, 0);
        assert_eq!(flow.cumulative_delta, -40);
        assert_eq!(flow.aggressive_buys, 0);
        assert_eq!(flow.aggressive_sells, 0);
        assert!((flow.buy_pressure - 50.0).abs() < 1e-10);
        assert!((flow.sell_pressure - 50.0).abs() < 1e-10);
    }

    /// Scenario: two consecutive buckets chained through prev_cvd.
    /// Expected: cvd(t) − cvd(t−1) = delta(t) within a symbol.
    #[test]
    fn test_cvd_chaining_invariant() {
        let bucket1 = profile_from_ticks(&[tick(0, 10.0, 4), tick(1, 10.1, 6)]);
        let flow1 = order_flow_from_profile(t0(), &bucket1, 0);

        let bucket2 = profile_from_ticks(&[tick(60, 10.1, 3), tick(61, 10.0, 9)]);
        let flow2 = order_flow_from_profile(
            t0() + chrono::Duration::minutes(1),
            &bucket2,
            flow1.cumulative_delta,
        );

        assert_eq!(flow2.cumulative_delta - flow1.cumulative_delta, flow2.delta);
        assert_eq!(flow1.delta, flow1.aggressive_buys - flow1.aggressive_sells);
        assert_eq!(flow2.delta, flow2.aggressive_buys - flow2.aggressive_sells);
    }
}
