//! Live position management: risk gates and sizing against broker state.

use serde_json::json;
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::error::Result;
use crate::store::{Store, SymbolCache};
use crate::trading::broker::BrokerClient;
use crate::types::Account;

/// All gates that must pass before opening a position. Returns the blocking
/// reason, or None when clear to trade.
pub fn entry_block_reason(
    account: &Account,
    open_positions: usize,
    has_position_in_symbol: bool,
    risk: &RiskConfig,
    max_positions: u32,
) -> Option<String> {
    if account.portfolio_value < risk.min_account_balance {
        return Some(format!(
            "Account balance too low: ${:.2}",
            account.portfolio_value
        ));
    }
    if account.account_blocked {
        return Some("Account is blocked".into());
    }
    if account.trading_blocked {
        return Some("Trading is blocked".into());
    }
    if open_positions >= max_positions as usize {
        return Some(format!("Max positions reached ({max_positions})"));
    }
    if has_position_in_symbol {
        return Some("Already have position in symbol".into());
    }
    let daily_pnl_pct = account.daily_pnl_pct();
    if daily_pnl_pct < -risk.max_daily_loss_pct {
        return Some(format!("Daily loss limit reached: {daily_pnl_pct:.2}%"));
    }
    None
}

/// Risk-based share count bounded by buying power. Returns 0 when the stop
/// distance is degenerate or a single share is unaffordable.
pub fn size_with_buying_power(
    portfolio_value: f64,
    risk_per_trade_pct: f64,
    entry_price: f64,
    stop_loss_price: f64,
    buying_power: f64,
) -> i64 {
    if portfolio_value <= 0.0 || entry_price <= 0.0 {
        return 0;
    }

    let risk_amount = portfolio_value * risk_per_trade_pct / 100.0;
    let mut risk_per_share = (entry_price - stop_loss_price).abs();
    if risk_per_share == 0.0 {
        risk_per_share = entry_price * 0.02;
    }

    let shares = (risk_amount / risk_per_share) as i64;
    let max_affordable = (buying_power / entry_price) as i64;
    shares.min(max_affordable).max(0)
}

pub struct PositionManager {
    store: Store,
    broker: BrokerClient,
    symbols: SymbolCache,
    risk: RiskConfig,
    risk_per_trade_pct: f64,
    max_positions: u32,
}

impl PositionManager {
    pub fn new(
        store: Store,
        broker: BrokerClient,
        risk: RiskConfig,
        risk_per_trade_pct: f64,
        max_positions: u32,
    ) -> Self {
        Self {
            store,
            broker,
            symbols: SymbolCache::new(),
            risk,
            risk_per_trade_pct,
            max_positions,
        }
    }

    /// Check every risk gate for a prospective entry.
    pub async fn can_open_position(&self, symbol: &str) -> (bool, String) {
        let account = match self.broker.get_account().await {
            Ok(a) => a,
            Err(e) => return (false, format!("Cannot get account info: {e}")),
        };

        let positions = self.broker.get_positions().await.unwrap_or_default();
        let has_symbol = match self.broker.get_position(symbol).await {
            Ok(p) => p.is_some(),
            Err(e) => {
                warn!(target: "trade", %symbol, error = %e, "position lookup failed");
                true // treat lookup failure as occupied rather than risk a duplicate
            }
        };

        match entry_block_reason(&account, positions.len(), has_symbol, &self.risk, self.max_positions)
        {
            Some(reason) => (false, reason),
            None => (true, "OK".into()),
        }
    }

    /// Share count for an entry, from live portfolio value and buying power.
    pub async fn position_size(&self, symbol: &str, entry_price: f64, stop_loss: f64) -> i64 {
        let account = match self.broker.get_account().await {
            Ok(a) => a,
            Err(e) => {
                warn!(target: "trade", %symbol, error = %e, "account fetch failed for sizing");
                return 0;
            }
        };

        let shares = size_with_buying_power(
            account.portfolio_value,
            self.risk_per_trade_pct,
            entry_price,
            stop_loss,
            account.buying_power,
        );
        info!(
            target: "trade",
            %symbol,
            shares,
            entry = entry_price,
            stop = stop_loss,
            risk_amount = account.portfolio_value * self.risk_per_trade_pct / 100.0,
            "position sized"
        );
        shares
    }

    /// Record an executed trade in the signals log.
    pub async fn log_trade(
        &mut self,
        symbol: &str,
        action: &str,
        qty: i64,
        price: f64,
        order_id: &str,
        reason: &str,
    ) -> Result<()> {
        let symbol_id = self.symbols.id(&self.store, symbol).await?;
        self.store
            .append_signal(
                symbol_id,
                action,
                json!({
                    "qty": qty,
                    "price": price,
                    "order_id": order_id,
                    "reason": reason,
                }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(portfolio: f64, equity: f64, last_equity: f64) -> Account {
        serde_json::from_value(json!({
            "portfolio_value": portfolio,
            "equity": equity,
            "last_equity": last_equity,
            "buying_power": portfolio * 2.0,
            "cash": portfolio,
            "account_blocked": false,
            "trading_blocked": false,
        }))
        .unwrap()
    }

    fn risk() -> RiskConfig {
        RiskConfig::default()
    }

    /// Scenario: healthy account, no open positions.
    /// Expected: no blocking reason.
    #[test]
    fn test_gates_pass_clean_account() {
        let a = account(100_000.0, 100_000.0, 100_000.0);
        assert!(entry_block_reason(&a, 0, false, &risk(), 3).is_none());
    }

    /// Scenario: max_positions = 1 and one position already open; a valid
    /// signal for a different symbol arrives.
    /// Expected: blocked by the max-positions gate.
    #[test]
    fn test_gate_max_positions() {
        let a = account(100_000.0, 100_000.0, 100_000.0);
        let reason = entry_block_reason(&a, 1, false, &risk(), 1).unwrap();
        assert!(reason.contains("Max positions"), "reason {reason}");
    }

    /// Scenario: existing open position in the same symbol.
    /// Expected: blocked — at most one position per symbol.
    #[test]
    fn test_gate_duplicate_symbol() {
        let a = account(100_000.0, 100_000.0, 100_000.0);
        assert!(entry_block_reason(&a, 0, true, &risk(), 3)
            .unwrap()
            .contains("Already have position"));
    }

    /// Scenario: portfolio value below the minimum account balance.
    /// Expected: blocked by the balance floor.
    #[test]
    fn test_gate_min_balance() {
        let a = account(500.0, 500.0, 500.0);
        assert!(entry_block_reason(&a, 0, false, &risk(), 3)
            .unwrap()
            .contains("balance too low"));
    }

    /// Scenario: account flagged blocked / trading blocked.
    /// Expected: blocked with the matching reason.
    #[test]
    fn test_gate_blocked_flags() {
        let mut a = account(100_000.0, 100_000.0, 100_000.0);
        a.account_blocked = true;
        assert!(entry_block_reason(&a, 0, false, &risk(), 3)
            .unwrap()
            .contains("Account is blocked"));

        let mut a = account(100_000.0, 100_000.0, 100_000.0);
        a.trading_blocked = true;
        assert!(entry_block_reason(&a, 0, false, &risk(), 3)
            .unwrap()
            .contains("Trading is blocked"));
    }

    /// Scenario: equity down 4% on the day with a 3% daily loss limit.
    /// Expected: blocked by the daily loss gate; a 2% drawdown passes.
    #[test]
    fn test_gate_daily_loss() {
        let a = account(96_000.0, 96_000.0, 100_000.0);
        assert!(entry_block_reason(&a, 0, false, &risk(), 3)
            .unwrap()
            .contains("Daily loss limit"));

        let a = account(98_000.0, 98_000.0, 100_000.0);
        assert!(entry_block_reason(&a, 0, false, &risk(), 3).is_none());
    }

    /// Scenario: 1% risk of $100k over a $3 stop, ample buying power.
    /// Expected: 333 shares.
    #[test]
    fn test_sizing_risk_based() {
        assert_eq!(
            size_with_buying_power(100_000.0, 1.0, 100.0, 97.0, 1_000_000.0),
            333
        );
    }

    /// Scenario: buying power covers only 50 shares.
    /// Expected: capped at 50 — never forced up to the risk-based count.
    #[test]
    fn test_sizing_buying_power_cap() {
        assert_eq!(size_with_buying_power(100_000.0, 1.0, 100.0, 97.0, 5_000.0), 50);
    }

    /// Scenario: stop at the entry price (zero distance).
    /// Expected: falls back to a 2% synthetic stop distance.
    #[test]
    fn test_sizing_zero_stop_distance_fallback() {
        // risk 1000, fallback distance 2 → 500 shares, buying power allows it
        assert_eq!(
            size_with_buying_power(100_000.0, 1.0, 100.0, 100.0, 100_000.0),
            500
        );
    }

    /// Scenario: buying power below the price of a single share.
    /// Expected: 0 shares — cash never goes negative.
    #[test]
    fn test_sizing_unaffordable() {
        assert_eq!(size_with_buying_power(100_000.0, 1.0, 100.0, 97.0, 40.0), 0);
        assert_eq!(size_with_buying_power(0.0, 1.0, 100.0, 97.0, 1000.0), 0);
    }
}
