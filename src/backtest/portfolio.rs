//! Backtest portfolio: position tracking, cash accounting, trade log, and
//! summary statistics.
//!
//! Positions and signal counters live in BTreeMaps so replay iteration order
//! is deterministic; two runs over the same inputs produce identical trade
//! logs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::types::{EquityPoint, MarketState, Side, TradeRecord};

#[derive(Clone, Debug)]
pub struct Position {
    pub symbol: String,
    pub symbol_id: i32,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub quantity: i64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub direction: Side,
    pub entry_reason: String,
    pub market_state: MarketState,
    pub aggression_score: i32,
    pub bars_held: i64,
    pub mae: f64,
    pub mfe: f64,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: &str,
        symbol_id: i32,
        entry_time: DateTime<Utc>,
        entry_price: f64,
        quantity: i64,
        stop_loss: f64,
        take_profit: f64,
        direction: Side,
        entry_reason: &str,
        market_state: MarketState,
        aggression_score: i32,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            symbol_id,
            entry_time,
            entry_price,
            quantity,
            stop_loss,
            take_profit,
            direction,
            entry_reason: entry_reason.to_string(),
            market_state,
            aggression_score,
            bars_held: 0,
            mae: 0.0,
            mfe: 0.0,
        }
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        match self.direction {
            Side::Buy => (current_price - self.entry_price) * self.quantity as f64,
            Side::Sell => (self.entry_price - current_price) * self.quantity as f64,
        }
    }

    /// Advance one bar: bars_held is monotonic, MAE stays ≤ 0 ≤ MFE.
    pub fn update_metrics(&mut self, current_price: f64) {
        self.bars_held += 1;
        let pnl = self.unrealized_pnl(current_price);
        if pnl < self.mae {
            self.mae = pnl;
        }
        if pnl > self.mfe {
            self.mfe = pnl;
        }
    }

    /// Stop/target evaluation against the bar close.
    pub fn should_exit(&self, current_price: f64) -> Option<&'static str> {
        match self.direction {
            Side::Buy => {
                if current_price <= self.stop_loss {
                    Some("Stop Loss")
                } else if current_price >= self.take_profit {
                    Some("Take Profit")
                } else {
                    None
                }
            }
            Side::Sell => {
                if current_price >= self.stop_loss {
                    Some("Stop Loss")
                } else if current_price <= self.take_profit {
                    Some("Take Profit")
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct SummaryStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub sharpe_ratio: f64,
}

pub struct BacktestPortfolio {
    pub initial_capital: f64,
    pub cash: f64,
    pub max_positions: usize,
    /// false in unlimited mode: position and cash gates are bypassed.
    pub enforce_limits: bool,
    pub positions: BTreeMap<String, Position>,
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<EquityPoint>,
    pub signals_generated: BTreeMap<String, u32>,
    pub signals_blocked: BTreeMap<String, u32>,
}

impl BacktestPortfolio {
    pub fn new(initial_capital: f64, max_positions: usize, enforce_limits: bool) -> Self {
        Self {
            initial_capital,
            cash: initial_capital,
            max_positions,
            enforce_limits,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            equity_curve: Vec::new(),
            signals_generated: BTreeMap::new(),
            signals_blocked: BTreeMap::new(),
        }
    }

    pub fn available_slots(&self) -> usize {
        if !self.enforce_limits {
            return usize::MAX;
        }
        self.max_positions.saturating_sub(self.positions.len())
    }

    pub fn can_enter(&self, cost: f64) -> bool {
        if !self.enforce_limits {
            return true;
        }
        self.available_slots() > 0 && cost <= self.cash
    }

    pub fn block_signal(&mut self, symbol: &str) {
        *self.signals_blocked.entry(symbol.to_string()).or_insert(0) += 1;
    }

    pub fn enter_position(&mut self, position: Position, cost: f64) -> bool {
        if self.positions.contains_key(&position.symbol) {
            return false;
        }
        if !self.can_enter(cost) {
            return false;
        }

        *self
            .signals_generated
            .entry(position.symbol.clone())
            .or_insert(0) += 1;
        debug!(
            target: "backtest",
            symbol = %position.symbol,
            qty = position.quantity,
            entry = position.entry_price,
            "entered"
        );
        self.cash -= cost;
        self.positions.insert(position.symbol.clone(), position);
        true
    }

    pub fn exit_position(
        &mut self,
        symbol: &str,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: &str,
    ) -> Option<TradeRecord> {
        let position = self.positions.remove(symbol)?;

        let pnl = position.unrealized_pnl(exit_price);
        let direction_sign = match position.direction {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        };
        let pnl_pct =
            (exit_price - position.entry_price) / position.entry_price * 100.0 * direction_sign;

        // Return the reserved cost plus realized pnl. For longs this equals
        // exit_price * quantity.
        let cost = position.entry_price * position.quantity as f64;
        self.cash += cost + pnl;

        let trade = TradeRecord {
            symbol: position.symbol.clone(),
            symbol_id: position.symbol_id,
            direction: position.direction,
            quantity: position.quantity,
            entry_time: position.entry_time,
            entry_price: position.entry_price,
            entry_reason: position.entry_reason.clone(),
            exit_time,
            exit_price,
            exit_reason: reason.to_string(),
            pnl,
            pnl_pct,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            market_state: position.market_state,
            aggression_score: position.aggression_score,
            bars_held: position.bars_held,
            duration_minutes: (exit_time - position.entry_time).num_minutes(),
            mae: position.mae,
            mfe: position.mfe,
        };
        debug!(
            target: "backtest",
            %symbol,
            pnl = format!("{:+.2}", pnl),
            %reason,
            "exited"
        );
        self.trades.push(trade.clone());
        Some(trade)
    }

    pub fn portfolio_value(&self, current_prices: &BTreeMap<String, f64>) -> f64 {
        let positions_value: f64 = self
            .positions
            .values()
            .map(|p| {
                let price = current_prices.get(&p.symbol).copied().unwrap_or(p.entry_price);
                p.entry_price * p.quantity as f64 + p.unrealized_pnl(price)
            })
            .sum();
        self.cash + positions_value
    }

    pub fn record_equity_point(
        &mut self,
        time: DateTime<Utc>,
        current_prices: &BTreeMap<String, f64>,
    ) {
        let equity = self.portfolio_value(current_prices);
        self.equity_curve.push(EquityPoint {
            time,
            equity,
            cash: self.cash,
            positions_value: equity - self.cash,
            open_positions: self.positions.len() as u32,
        });
    }

    /// Run-level summary. Sharpe is mean(per-trade pnl%) over its standard
    /// deviation, annualized by √252 (preserved as-is for reproducibility).
    pub fn summary(&self) -> SummaryStats {
        if self.trades.is_empty() {
            return SummaryStats {
                total_trades: 0,
                winning_trades: 0,
                losing_trades: 0,
                win_rate: 0.0,
                total_pnl: 0.0,
                total_pnl_pct: 0.0,
                avg_win: 0.0,
                avg_loss: 0.0,
                largest_win: 0.0,
                largest_loss: 0.0,
                sharpe_ratio: 0.0,
            };
        }

        let wins: Vec<&TradeRecord> = self.trades.iter().filter(|t| t.pnl > 0.0).collect();
        let losses: Vec<&TradeRecord> = self.trades.iter().filter(|t| t.pnl <= 0.0).collect();
        let total_pnl: f64 = self.trades.iter().map(|t| t.pnl).sum();

        let sharpe_ratio = if self.trades.len() > 1 {
            let returns: Vec<f64> = self.trades.iter().map(|t| t.pnl_pct).collect();
            let mean = returns.iter().sum::<f64>() / returns.len() as f64;
            let variance =
                returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
            let std_dev = variance.sqrt();
            if std_dev > 0.0 { mean / std_dev * (252.0_f64).sqrt() } else { 0.0 }
        } else {
            0.0
        };

        SummaryStats {
            total_trades: self.trades.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: wins.len() as f64 / self.trades.len() as f64 * 100.0,
            total_pnl,
            total_pnl_pct: total_pnl / self.initial_capital * 100.0,
            avg_win: if wins.is_empty() {
                0.0
            } else {
                wins.iter().map(|t| t.pnl).sum::<f64>() / wins.len() as f64
            },
            avg_loss: if losses.is_empty() {
                0.0
            } else {
                losses.iter().map(|t| t.pnl).sum::<f64>() / losses.len() as f64
            },
            largest_win: wins.iter().map(|t| t.pnl).fold(0.0, f64::max),
            largest_loss: losses.iter().map(|t| t.pnl).fold(0.0, f64::min),
            sharpe_ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 14, 30, 0).unwrap() + chrono::Duration::minutes(minutes)
    }

    fn long_position(symbol: &str, entry: f64, qty: i64) -> Position {
        Position::new(
            symbol,
            1,
            t(0),
            entry,
            qty,
            entry - 3.0,
            entry + 6.0,
            Side::Buy,
            "IMBALANCE_UP + Aggressive BUY (score: 80)",
            MarketState::ImbalanceUp,
            80,
        )
    }

    /// Scenario: enter a long, then exit at a higher price.
    /// Expected: cash returns as exit_price × qty; pnl and pnl_pct positive;
    /// the trade record is appended once and the position is gone.
    #[test]
    fn test_enter_exit_accounting() {
        let mut portfolio = BacktestPortfolio::new(100_000.0, 3, true);
        let position = long_position("AAPL", 100.0, 100);
        assert!(portfolio.enter_position(position, 10_000.0));
        assert!((portfolio.cash - 90_000.0).abs() < 1e-9);

        let trade = portfolio.exit_position("AAPL", 106.0, t(30), "Take Profit").unwrap();
        assert!((portfolio.cash - 100_600.0).abs() < 1e-9);
        assert!((trade.pnl - 600.0).abs() < 1e-9);
        assert!((trade.pnl_pct - 6.0).abs() < 1e-9);
        assert_eq!(trade.duration_minutes, 30);
        assert!(portfolio.positions.is_empty());
        assert_eq!(portfolio.trades.len(), 1);
    }

    /// Scenario: short position exited lower.
    /// Expected: positive pnl and pnl_pct for the short side.
    #[test]
    fn test_short_pnl_sign() {
        let mut portfolio = BacktestPortfolio::new(100_000.0, 3, true);
        let mut position = long_position("TSLA", 100.0, 50);
        position.direction = Side::Sell;
        position.stop_loss = 103.0;
        position.take_profit = 94.0;
        portfolio.enter_position(position, 5_000.0);

        let trade = portfolio.exit_position("TSLA", 94.0, t(10), "Take Profit").unwrap();
        assert!((trade.pnl - 300.0).abs() < 1e-9);
        assert!((trade.pnl_pct - 6.0).abs() < 1e-9);
    }

    /// Scenario: max_positions = 1 with one position held; a second symbol's
    /// entry is attempted and the blocked counter is bumped.
    /// Expected: entry refused, signals_blocked["MSFT"] = 1, position count
    /// stays 1.
    #[test]
    fn test_max_positions_gate_blocks() {
        let mut portfolio = BacktestPortfolio::new(100_000.0, 1, true);
        assert!(portfolio.enter_position(long_position("AAPL", 100.0, 10), 1_000.0));

        let second = long_position("MSFT", 200.0, 5);
        assert!(!portfolio.enter_position(second, 1_000.0));
        portfolio.block_signal("MSFT");

        assert_eq!(portfolio.positions.len(), 1);
        assert_eq!(portfolio.signals_blocked.get("MSFT"), Some(&1));
        assert_eq!(portfolio.signals_generated.get("MSFT"), None);
    }

    /// Scenario: duplicate entry for a symbol already held.
    /// Expected: refused even with free slots and cash.
    #[test]
    fn test_duplicate_symbol_refused() {
        let mut portfolio = BacktestPortfolio::new(100_000.0, 3, true);
        assert!(portfolio.enter_position(long_position("AAPL", 100.0, 10), 1_000.0));
        assert!(!portfolio.enter_position(long_position("AAPL", 101.0, 10), 1_010.0));
    }

    /// Scenario: cost above available cash.
    /// Expected: refused with limits on; accepted in unlimited mode.
    #[test]
    fn test_cash_gate_and_unlimited_mode() {
        let mut limited = BacktestPortfolio::new(1_000.0, 3, true);
        assert!(!limited.enter_position(long_position("AAPL", 100.0, 100), 10_000.0));

        let mut unlimited = BacktestPortfolio::new(1_000.0, 1, false);
        assert!(unlimited.enter_position(long_position("AAPL", 100.0, 100), 10_000.0));
        assert!(unlimited.enter_position(long_position("MSFT", 100.0, 100), 10_000.0));
        assert_eq!(unlimited.positions.len(), 2);
    }

    /// Scenario: long position marked through a dip to 97 then a rally to 105.
    /// Expected: MAE −300 ≤ 0 ≤ MFE 500, bars_held counts both updates.
    #[test]
    fn test_mae_mfe_tracking() {
        let mut position = long_position("AAPL", 100.0, 100);
        position.update_metrics(97.0);
        position.update_metrics(105.0);
        assert!((position.mae + 300.0).abs() < 1e-9);
        assert!((position.mfe - 500.0).abs() < 1e-9);
        assert_eq!(position.bars_held, 2);
        assert!(position.mae <= 0.0 && 0.0 <= position.mfe);
    }

    /// Scenario: close-based stop and target triggers on both sides.
    /// Expected: long exits at or below stop / at or above target; short
    /// mirrored.
    #[test]
    fn test_should_exit_close_policy() {
        let long = long_position("AAPL", 100.0, 10);
        assert_eq!(long.should_exit(97.0), Some("Stop Loss"));
        assert_eq!(long.should_exit(106.0), Some("Take Profit"));
        assert_eq!(long.should_exit(100.0), None);

        let mut short = long_position("AAPL", 100.0, 10);
        short.direction = Side::Sell;
        short.stop_loss = 103.0;
        short.take_profit = 94.0;
        assert_eq!(short.should_exit(103.0), Some("Stop Loss"));
        assert_eq!(short.should_exit(94.0), Some("Take Profit"));
        assert_eq!(short.should_exit(100.0), None);
    }

    /// Scenario: equity point with one open position marked at 105.
    /// Expected: equity = cash + reserved cost + unrealized pnl.
    #[test]
    fn test_equity_recording() {
        let mut portfolio = BacktestPortfolio::new(100_000.0, 3, true);
        portfolio.enter_position(long_position("AAPL", 100.0, 100), 10_000.0);

        let mut prices = BTreeMap::new();
        prices.insert("AAPL".to_string(), 105.0);
        portfolio.record_equity_point(t(5), &prices);

        let point = portfolio.equity_curve.last().unwrap();
        assert!((point.equity - 100_500.0).abs() < 1e-9);
        assert!((point.cash - 90_000.0).abs() < 1e-9);
        assert_eq!(point.open_positions, 1);
    }

    /// Scenario: two closed trades, +6% and −3%.
    /// Expected: summary counts, win rate 50%, pnl sums, and a finite
    /// Sharpe from the per-trade returns annualized by √252.
    #[test]
    fn test_summary_stats() {
        let mut portfolio = BacktestPortfolio::new(100_000.0, 3, true);
        portfolio.enter_position(long_position("AAPL", 100.0, 100), 10_000.0);
        portfolio.exit_position("AAPL", 106.0, t(10), "Take Profit");
        portfolio.enter_position(long_position("MSFT", 100.0, 100), 10_000.0);
        portfolio.exit_position("MSFT", 97.0, t(20), "Stop Loss");

        let stats = portfolio.summary();
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.winning_trades, 1);
        assert_eq!(stats.losing_trades, 1);
        assert!((stats.win_rate - 50.0).abs() < 1e-9);
        assert!((stats.total_pnl - 300.0).abs() < 1e-9);
        assert!((stats.avg_win - 600.0).abs() < 1e-9);
        assert!((stats.avg_loss + 300.0).abs() < 1e-9);

        // returns: +6, -3 → mean 1.5, σ 4.5 → sharpe = 1.5/4.5 * √252
        let expected = 1.5 / 4.5 * (252.0_f64).sqrt();
        assert!((stats.sharpe_ratio - expected).abs() < 1e-9);
    }

    /// Scenario: exit requested for a symbol with no open position.
    /// Expected: None, nothing recorded, cash untouched.
    #[test]
    fn test_exit_unknown_symbol() {
        let mut portfolio = BacktestPortfolio::new(100_000.0, 3, true);
        assert!(portfolio.exit_position("GHOST", 100.0, t(1), "Stop Loss").is_none());
        assert!(portfolio.trades.is_empty());
        assert!((portfolio.cash - 100_000.0).abs() < 1e-9);
    }

    /// Scenario: portfolio value queried without a price for the held
    /// symbol.
    /// Expected: the position marks at its entry price (zero unrealized).
    #[test]
    fn test_portfolio_value_price_fallback() {
        let mut portfolio = BacktestPortfolio::new(100_000.0, 3, true);
        portfolio.enter_position(long_position("AAPL", 100.0, 100), 10_000.0);
        let value = portfolio.portfolio_value(&BTreeMap::new());
        assert!((value - 100_000.0).abs() < 1e-9);
    }

    /// Scenario: summary with no trades.
    /// Expected: all zeros, no division by zero.
    #[test]
    fn test_summary_empty() {
        let portfolio = BacktestPortfolio::new(100_000.0, 3, true);
        let stats = portfolio.summary();
        assert_eq!(stats.total_trades, 0);
        assert_eq!(stats.sharpe_ratio, 0.0);
        assert_eq!(stats.win_rate, 0.0);
    }
}
