//! Deterministic replay driver.
//!
//! Iterates merged bars in timestamp order, recomputes indicators in memory
//! from rolling candle windows, evaluates the shared strategy, and manages
//! the portfolio bar by bar. The replay core is a pure function of its
//! inputs; persistence happens once, after the run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;

use crate::backtest::data::{load_and_merge, MergedBars};
use crate::backtest::indicators::{estimate_flow, window_state};
use crate::backtest::portfolio::{BacktestPortfolio, Position};
use crate::config::{DetectorConfig, StrategyConfig};
use crate::error::Result;
use crate::store::Store;
use crate::strategy::atr::average_true_range;
use crate::strategy::auction_market::AuctionMarketStrategy;
use crate::types::Candle;

/// Candle window kept per symbol for indicator computation.
const WINDOW: usize = 60;
/// History cap; bounded so long replays stay flat in memory.
const HISTORY_CAP: usize = 120;
const ATR_PERIODS: usize = 14;
const FLOW_LOOKBACK: usize = 5;
/// Equity curve snapshot cadence, in timestamps.
const EQUITY_EVERY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BacktestMode {
    /// All portfolio gates enforced.
    Portfolio,
    /// Single-symbol isolation for parameter sweeps.
    Individual,
    /// Gates disabled; measures the signal ceiling.
    Unlimited,
}

impl BacktestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BacktestMode::Portfolio => "portfolio",
            BacktestMode::Individual => "individual",
            BacktestMode::Unlimited => "unlimited",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BacktestParams {
    pub strategy: StrategyConfig,
    pub detector: DetectorConfig,
    pub mode: BacktestMode,
}

/// Replay the merged bars through the strategy and portfolio.
///
/// Per timestamp: update open-position metrics, evaluate stops/targets
/// against the bar close, then query the strategy for symbols without a
/// position and enter subject to the portfolio gates. Every 100 timestamps
/// an equity point is recorded; at end of range all open positions are
/// force-closed at the last seen close.
pub fn replay(merged: &MergedBars, params: &BacktestParams) -> BacktestPortfolio {
    let enforce = params.mode != BacktestMode::Unlimited;
    let mut portfolio = BacktestPortfolio::new(
        params.strategy.initial_capital,
        params.strategy.max_positions as usize,
        enforce,
    );
    let strategy = AuctionMarketStrategy::new(params.strategy);

    let mut history: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
    let mut last_seen: BTreeMap<String, (DateTime<Utc>, f64)> = BTreeMap::new();

    for (i, (timestamp, bars)) in merged.iter().enumerate() {
        let mut closes: BTreeMap<String, f64> = BTreeMap::new();

        for (symbol, bar) in bars {
            let series = history.entry(symbol.clone()).or_default();
            series.push(bar.candle);
            if series.len() > HISTORY_CAP {
                series.remove(0);
            }
            closes.insert(symbol.clone(), bar.candle.close);
            last_seen.insert(symbol.clone(), (*timestamp, bar.candle.close));
        }

        // Mark open positions and evaluate stops/targets on the close.
        for (symbol, close) in &closes {
            if let Some(position) = portfolio.positions.get_mut(symbol) {
                position.update_metrics(*close);
            }
        }
        let symbols_with_bars: Vec<String> = closes.keys().cloned().collect();
        for symbol in &symbols_with_bars {
            let close = closes[symbol];
            if let Some(reason) = portfolio
                .positions
                .get(symbol)
                .and_then(|p| p.should_exit(close))
            {
                portfolio.exit_position(symbol, close, *timestamp, reason);
            }
        }

        // Entries for symbols without an open position.
        for (symbol, bar) in bars {
            if portfolio.positions.contains_key(symbol) {
                continue;
            }

            let series = &history[symbol];
            let window_start = series.len().saturating_sub(WINDOW);
            let window = &series[window_start..];

            let flow = estimate_flow(window, FLOW_LOOKBACK);
            let Some((state, confidence, _metrics)) =
                window_state(window, &flow, &params.detector)
            else {
                continue;
            };
            let Some(atr) = average_true_range(window, ATR_PERIODS) else {
                continue;
            };

            let Some(signal) = strategy.evaluate_entry_signal(
                state,
                confidence,
                flow.buy_pressure,
                flow.sell_pressure,
                flow.cvd_momentum,
                bar.candle.close,
                atr,
                symbol,
            ) else {
                continue;
            };

            let risk_amount =
                params.strategy.initial_capital * params.strategy.risk_per_trade_pct / 100.0;
            let stop_distance = (signal.entry_price - signal.stop_loss).abs();
            if stop_distance == 0.0 {
                continue;
            }
            let mut quantity = (risk_amount / stop_distance) as i64;
            let mut cost = quantity as f64 * signal.entry_price;
            if enforce && cost > portfolio.cash {
                quantity = (portfolio.cash / signal.entry_price) as i64;
                cost = quantity as f64 * signal.entry_price;
            }
            if quantity <= 0 {
                portfolio.block_signal(symbol);
                continue;
            }

            let position = Position::new(
                symbol,
                bar.symbol_id,
                *timestamp,
                signal.entry_price,
                quantity,
                signal.stop_loss,
                signal.take_profit,
                signal.side,
                &signal.reason,
                signal.market_state,
                signal.aggression_score,
            );
            if !portfolio.enter_position(position, cost) {
                portfolio.block_signal(symbol);
            }
        }

        if i % EQUITY_EVERY == 0 {
            portfolio.record_equity_point(*timestamp, &closes);
        }
    }

    // Force-close whatever is still open at the last seen bar.
    let open_symbols: Vec<String> = portfolio.positions.keys().cloned().collect();
    for symbol in open_symbols {
        if let Some(&(time, close)) = last_seen.get(&symbol) {
            portfolio.exit_position(&symbol, close, time, "End of Backtest");
        }
    }

    portfolio
}

/// Load, replay, persist. Returns the run id and the exportable report.
pub async fn run_backtest(
    store: &Store,
    symbols: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    params: &BacktestParams,
) -> Result<(i64, serde_json::Value)> {
    let parameters = json!({
        "mode": params.mode.as_str(),
        "initial_capital": params.strategy.initial_capital,
        "max_positions": params.strategy.max_positions,
        "risk_per_trade_pct": params.strategy.risk_per_trade_pct,
        "min_aggression_score": params.strategy.min_aggression_score,
        "atr_stop_multiplier": params.strategy.atr_stop_multiplier,
        "atr_target_multiplier": params.strategy.atr_target_multiplier,
    });
    let run_id = store
        .create_backtest_run(
            &format!("Backtest {} to {}", start.date_naive(), end.date_naive()),
            "auction_market",
            start,
            end,
            symbols,
            parameters.clone(),
        )
        .await?;

    let merged = load_and_merge(store, symbols, start, end).await?;
    info!(target: "backtest", run_id, timestamps = merged.len(), "replaying");

    let portfolio = replay(&merged, params);
    let stats = portfolio.summary();

    store.append_trades(run_id, &portfolio.trades).await?;
    store.append_equity_points(run_id, &portfolio.equity_curve).await?;

    let total_generated: u32 = portfolio.signals_generated.values().sum();
    let total_blocked: u32 = portfolio.signals_blocked.values().sum();
    let blocked_percentage = if total_generated + total_blocked > 0 {
        total_blocked as f64 / (total_generated + total_blocked) as f64 * 100.0
    } else {
        0.0
    };

    let mut recommendations = json!({});
    if total_blocked > 0 {
        let positions_needed = params.strategy.max_positions as u64 + total_blocked as u64;
        recommendations = json!({
            "max_positions_needed": positions_needed,
            "capital_needed": params.strategy.initial_capital
                * positions_needed as f64
                / params.strategy.max_positions.max(1) as f64,
        });
    }
    let constraint_analysis = json!({
        "signals_generated": total_generated,
        "signals_blocked": total_blocked,
        "blocked_percentage": blocked_percentage,
        "recommendations": recommendations,
    });

    store
        .finish_backtest_run(
            run_id,
            stats.total_trades as i32,
            stats.win_rate,
            stats.total_pnl,
            stats.sharpe_ratio,
            total_generated as i32,
            total_blocked as i32,
            blocked_percentage,
            constraint_analysis.clone(),
        )
        .await?;

    let trades_json: Vec<serde_json::Value> = portfolio
        .trades
        .iter()
        .map(|t| {
            json!({
                "symbol": t.symbol,
                "direction": t.direction.as_str(),
                "quantity": t.quantity,
                "entry_time": t.entry_time.to_rfc3339(),
                "entry_price": t.entry_price,
                "entry_reason": t.entry_reason,
                "exit_time": t.exit_time.to_rfc3339(),
                "exit_price": t.exit_price,
                "exit_reason": t.exit_reason,
                "pnl": t.pnl,
                "pnl_pct": t.pnl_pct,
                "bars_held": t.bars_held,
                "mae": t.mae,
                "mfe": t.mfe,
            })
        })
        .collect();

    let report = json!({
        "run_id": run_id,
        "start": start.to_rfc3339(),
        "end": end.to_rfc3339(),
        "symbols": symbols,
        "parameters": parameters,
        "summary": {
            "total_trades": stats.total_trades,
            "winning_trades": stats.winning_trades,
            "losing_trades": stats.losing_trades,
            "win_rate": stats.win_rate,
            "total_pnl": stats.total_pnl,
            "total_pnl_pct": stats.total_pnl_pct,
            "avg_win": stats.avg_win,
            "avg_loss": stats.avg_loss,
            "largest_win": stats.largest_win,
            "largest_loss": stats.largest_loss,
            "sharpe_ratio": stats.sharpe_ratio,
        },
        "constraint_analysis": constraint_analysis,
        "trades": trades_json,
    });

    Ok((run_id, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::data::merge_series;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 14, 30, 0).unwrap()
    }

    fn rally_candle(i: usize) -> Candle {
        let base = 100.0 * (1.004_f64).powi(i as i32);
        let close = base * 1.004;
        Candle {
            time: t0() + chrono::Duration::minutes(i as i64),
            open: base,
            high: close,
            low: base,
            close,
            volume: 1000,
        }
    }

    fn flat_candle(i: usize, price: f64) -> Candle {
        Candle {
            time: t0() + chrono::Duration::minutes(i as i64),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1000,
        }
    }

    fn merged_for(symbols: &[&str], candles: &[Candle]) -> MergedBars {
        let mut series = BTreeMap::new();
        for (idx, symbol) in symbols.iter().enumerate() {
            series.insert(symbol.to_string(), (idx as i32 + 1, candles.to_vec()));
        }
        merge_series(&series)
    }

    fn params(mode: BacktestMode, max_positions: u32) -> BacktestParams {
        let mut strategy = StrategyConfig::default();
        strategy.max_positions = max_positions;
        BacktestParams { strategy, detector: DetectorConfig::default(), mode }
    }

    /// Scenario: a sustained rally — every bar green, closing at its high.
    /// Expected: the strategy enters long at least once and every recorded
    /// trade is a buy.
    #[test]
    fn test_rally_produces_long_trades() {
        let candles: Vec<Candle> = (0..80).map(rally_candle).collect();
        let merged = merged_for(&["AAPL"], &candles);
        let portfolio = replay(&merged, &params(BacktestMode::Portfolio, 3));

        assert!(!portfolio.trades.is_empty(), "rally should produce trades");
        assert!(portfolio
            .trades
            .iter()
            .all(|t| t.direction == crate::types::Side::Buy));
        assert!(portfolio.signals_generated.get("AAPL").copied().unwrap_or(0) >= 1);
    }

    /// Scenario: the same merged input replayed twice.
    /// Expected: byte-identical trade logs — replay is deterministic.
    #[test]
    fn test_replay_deterministic() {
        let candles: Vec<Candle> = (0..80).map(rally_candle).collect();
        let merged = merged_for(&["AAPL", "MSFT"], &candles);
        let p = params(BacktestMode::Portfolio, 2);

        let first = replay(&merged, &p);
        let second = replay(&merged, &p);
        assert_eq!(format!("{:?}", first.trades), format!("{:?}", second.trades));
        assert_eq!(
            format!("{:?}", first.equity_curve),
            format!("{:?}", second.equity_curve)
        );
    }

    /// Scenario: two symbols fire identical signals with max_positions = 1.
    /// Expected: one entry wins the slot, the other symbol's signal is
    /// counted as blocked.
    #[test]
    fn test_portfolio_gate_counts_blocked() {
        let candles: Vec<Candle> = (0..40).map(rally_candle).collect();
        let merged = merged_for(&["AAPL", "MSFT"], &candles);
        let portfolio = replay(&merged, &params(BacktestMode::Portfolio, 1));

        let blocked: u32 = portfolio.signals_blocked.values().sum();
        assert!(blocked >= 1, "second symbol should be blocked");
        assert!(portfolio.positions.is_empty(), "everything force-closed at end");
    }

    /// Scenario: the same two-symbol setup in unlimited mode.
    /// Expected: both symbols trade; nothing is blocked.
    #[test]
    fn test_unlimited_mode_trades_both() {
        let candles: Vec<Candle> = (0..40).map(rally_candle).collect();
        let merged = merged_for(&["AAPL", "MSFT"], &candles);
        let portfolio = replay(&merged, &params(BacktestMode::Unlimited, 1));

        let blocked: u32 = portfolio.signals_blocked.values().sum();
        assert_eq!(blocked, 0);
        let traded: std::collections::BTreeSet<String> =
            portfolio.trades.iter().map(|t| t.symbol.clone()).collect();
        assert!(traded.contains("AAPL") && traded.contains("MSFT"));
    }

    /// Scenario: a rally long enough to trigger an entry, then a flat tail
    /// that never touches the stop or target.
    /// Expected: the position survives to end-of-range and closes with
    /// reason "End of Backtest" at the final bar's close.
    #[test]
    fn test_end_of_range_force_close() {
        let mut candles: Vec<Candle> = (0..16).map(rally_candle).collect();
        let hold_price = candles.last().unwrap().close;
        for i in 16..22 {
            candles.push(flat_candle(i, hold_price));
        }
        let merged = merged_for(&["AAPL"], &candles);
        let portfolio = replay(&merged, &params(BacktestMode::Portfolio, 3));

        let last = portfolio.trades.last().expect("one trade");
        assert_eq!(last.exit_reason, "End of Backtest");
        assert!((last.exit_price - hold_price).abs() < 1e-9);
        assert_eq!(last.exit_time, candles.last().unwrap().time);
    }

    /// Scenario: equity snapshots along an 80-bar run.
    /// Expected: at least the snapshot at timestamp 0 exists and equity
    /// starts at the initial capital.
    #[test]
    fn test_equity_snapshots() {
        let candles: Vec<Candle> = (0..80).map(rally_candle).collect();
        let merged = merged_for(&["AAPL"], &candles);
        let portfolio = replay(&merged, &params(BacktestMode::Portfolio, 3));

        assert!(!portfolio.equity_curve.is_empty());
        let first = &portfolio.equity_curve[0];
        assert!((first.equity - 100_000.0).abs() < 1e-9);
    }
}
