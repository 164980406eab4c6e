//! Low-Volume-Node proximity alerts.
//!
//! LVNs are gaps in the volume profile where price tends to move quickly;
//! the playbook treats them as pullback entry levels. This detector watches
//! for price approaching any LVN seen in the recent profile history.

use tracing::{info, warn};

use crate::store::Store;

/// Alert when price is within this percent of an LVN.
pub const ALERT_THRESHOLD_PCT: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LvnSide {
    /// The LVN sits above the current price.
    Above,
    /// The LVN sits below the current price.
    Below,
}

impl std::fmt::Display for LvnSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LvnSide::Above => f.write_str("ABOVE"),
            LvnSide::Below => f.write_str("BELOW"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LvnProximity {
    pub lvn_price: f64,
    pub distance_pct: f64,
    pub distance_dollars: f64,
    pub side: LvnSide,
    pub is_near: bool,
}

/// Find the LVN closest to `price`. Returns None when the list is empty or
/// contains only non-positive levels.
pub fn nearest_lvn(price: f64, lvns: &[f64]) -> Option<LvnProximity> {
    let mut best: Option<LvnProximity> = None;

    for &lvn in lvns {
        if lvn <= 0.0 {
            continue;
        }
        let distance_pct = (price - lvn).abs() / lvn * 100.0;
        if best.map_or(true, |b| distance_pct < b.distance_pct) {
            best = Some(LvnProximity {
                lvn_price: lvn,
                distance_pct,
                distance_dollars: (price - lvn).abs(),
                side: if price < lvn { LvnSide::Above } else { LvnSide::Below },
                is_near: distance_pct <= ALERT_THRESHOLD_PCT,
            });
        }
    }

    best
}

/// All LVNs with their distances from `price`, nearest first.
pub fn lvns_with_distances(price: f64, lvns: &[f64]) -> Vec<LvnProximity> {
    let mut out: Vec<LvnProximity> = lvns
        .iter()
        .filter(|&&lvn| lvn > 0.0)
        .map(|&lvn| {
            let distance_pct = (price - lvn).abs() / lvn * 100.0;
            LvnProximity {
                lvn_price: lvn,
                distance_pct,
                distance_dollars: (price - lvn).abs(),
                side: if price < lvn { LvnSide::Above } else { LvnSide::Below },
                is_near: distance_pct <= ALERT_THRESHOLD_PCT,
            }
        })
        .collect();
    out.sort_by(|a, b| a.distance_pct.partial_cmp(&b.distance_pct).unwrap_or(std::cmp::Ordering::Equal));
    out
}

pub struct LvnAlertSystem {
    store: Store,
}

impl LvnAlertSystem {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn check(&self, symbol_id: i32) -> Option<LvnProximity> {
        let price = self.store.latest_close(symbol_id).await.ok()??;
        let lvns = self.store.recent_lvns(symbol_id, 10).await.ok()?;
        nearest_lvn(price, &lvns)
    }

    pub async fn run_all(&self) {
        let symbols = match self.store.all_symbols().await {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "lvn", error = %e, "symbol listing failed");
                return;
            }
        };
        for (symbol_id, symbol) in symbols {
            if let Some(proximity) = self.check(symbol_id).await {
                if proximity.is_near {
                    info!(
                        target: "lvn",
                        %symbol,
                        lvn = proximity.lvn_price,
                        distance_pct = format!("{:.2}", proximity.distance_pct),
                        side = %proximity.side,
                        "price approaching LVN"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: price 100.30, LVNs at 100.50 and 105.00.
    /// Expected: nearest is 100.50 (0.199% away), flagged near, sitting above
    /// the price.
    #[test]
    fn test_nearest_lvn_alerting() {
        let p = nearest_lvn(100.30, &[100.50, 105.0]).unwrap();
        assert!((p.lvn_price - 100.50).abs() < 1e-10);
        assert!(p.is_near);
        assert_eq!(p.side, LvnSide::Above);
        assert!((p.distance_dollars - 0.20).abs() < 1e-9);
    }

    /// Scenario: price well clear of every LVN.
    /// Expected: nearest is reported but not flagged near.
    #[test]
    fn test_nearest_lvn_not_near() {
        let p = nearest_lvn(100.0, &[110.0, 120.0]).unwrap();
        assert!((p.lvn_price - 110.0).abs() < 1e-10);
        assert!(!p.is_near);
        assert_eq!(p.side, LvnSide::Above);
    }

    /// Scenario: price above the closest LVN.
    /// Expected: side reads Below.
    #[test]
    fn test_lvn_below_price() {
        let p = nearest_lvn(100.0, &[99.8]).unwrap();
        assert_eq!(p.side, LvnSide::Below);
        assert!(p.is_near); // 0.2% of 99.8
    }

    /// Scenario: empty or degenerate LVN lists.
    /// Expected: None — nothing to compare against.
    #[test]
    fn test_nearest_lvn_empty() {
        assert!(nearest_lvn(100.0, &[]).is_none());
        assert!(nearest_lvn(100.0, &[0.0, -5.0]).is_none());
    }

    /// Scenario: several LVNs at varying distances.
    /// Expected: lvns_with_distances sorts nearest-first.
    #[test]
    fn test_lvns_sorted_by_distance() {
        let all = lvns_with_distances(100.0, &[95.0, 100.4, 103.0]);
        assert_eq!(all.len(), 3);
        assert!((all[0].lvn_price - 100.4).abs() < 1e-10);
        assert!((all[1].lvn_price - 103.0).abs() < 1e-10);
        assert!((all[2].lvn_price - 95.0).abs() < 1e-10);
    }
}
