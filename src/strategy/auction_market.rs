//! Auction Market Theory strategy.
//!
//! One source of truth for entry, exit, and sizing logic. The same struct
//! is evaluated by the live auto-trader and the backtest engine; it performs
//! no I/O and holds no mutable state, so identical inputs always produce
//! identical signals.
//!
//! Entry: market in IMBALANCE, aggression at or above threshold, flow
//! direction agreeing with the state, and a positive ATR.
//! Exit: ATR-scaled stop or target touch, or an opposite state+flow pair.

use crate::config::StrategyConfig;
use crate::detectors::aggressive_flow::flow_direction;
use crate::types::{EntrySignal, FlowDirection, MarketState, Side};

#[derive(Clone, Copy, Debug)]
pub struct AuctionMarketStrategy {
    params: StrategyConfig,
}

impl AuctionMarketStrategy {
    pub fn new(params: StrategyConfig) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &StrategyConfig {
        &self.params
    }

    /// Strategy-side aggression rubric. Tighter than the standalone
    /// indicator: CVD and pressure each carry up to 40 points, the pressure
    /// ratio up to 20.
    pub fn aggression_score(
        &self,
        buy_pressure: f64,
        sell_pressure: f64,
        cvd_momentum: i64,
    ) -> i32 {
        let mut score = 0;

        let momentum = cvd_momentum.abs();
        if momentum >= 1000 {
            score += 40;
        } else if momentum >= 500 {
            score += 20;
        }

        if buy_pressure >= 70.0 || sell_pressure >= 70.0 {
            score += 40;
        } else if buy_pressure >= 60.0 || sell_pressure >= 60.0 {
            score += 20;
        }

        if buy_pressure > 0.0 && sell_pressure > 0.0 {
            let ratio = (buy_pressure / sell_pressure).max(sell_pressure / buy_pressure);
            if ratio >= 2.0 {
                score += 20;
            } else if ratio >= 1.5 {
                score += 10;
            }
        }

        score.min(100)
    }

    /// Evaluate entry conditions. Returns None unless all four gates pass:
    /// imbalanced state, sufficient aggression, matching flow direction, and
    /// a positive ATR.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate_entry_signal(
        &self,
        market_state: MarketState,
        confidence: i32,
        buy_pressure: f64,
        sell_pressure: f64,
        cvd_momentum: i64,
        current_price: f64,
        atr: f64,
        symbol: &str,
    ) -> Option<EntrySignal> {
        let aggression_score = self.aggression_score(buy_pressure, sell_pressure, cvd_momentum);
        let direction = flow_direction(buy_pressure, sell_pressure, cvd_momentum);

        if !market_state.is_imbalance() {
            return None;
        }
        if aggression_score < self.params.min_aggression_score {
            return None;
        }
        if market_state == MarketState::ImbalanceUp && direction != FlowDirection::Buy {
            return None;
        }
        if market_state == MarketState::ImbalanceDown && direction != FlowDirection::Sell {
            return None;
        }
        if atr <= 0.0 {
            return None;
        }

        let side = if market_state == MarketState::ImbalanceUp { Side::Buy } else { Side::Sell };
        let stop_distance = atr * self.params.atr_stop_multiplier;
        let target_distance = atr * self.params.atr_target_multiplier;
        let (stop_loss, take_profit) = match side {
            Side::Buy => (current_price - stop_distance, current_price + target_distance),
            Side::Sell => (current_price + stop_distance, current_price - target_distance),
        };

        Some(EntrySignal {
            symbol: symbol.to_string(),
            side,
            entry_price: current_price,
            stop_loss,
            take_profit,
            atr,
            market_state,
            confidence,
            aggression_score,
            flow_direction: direction,
            buy_pressure,
            sell_pressure,
            cvd_momentum,
            reason: format!(
                "{} + Aggressive {} (score: {})",
                market_state, direction, aggression_score
            ),
        })
    }

    /// Exit evaluation for an open position. Returns the exit reason when
    /// the price crosses the stop or target on its side, or when an opposite
    /// state + flow pair appears.
    pub fn should_exit(
        &self,
        position_side: Side,
        current_price: f64,
        stop_loss: f64,
        take_profit: f64,
        market_state: MarketState,
        direction: FlowDirection,
    ) -> Option<&'static str> {
        match position_side {
            Side::Buy => {
                if current_price <= stop_loss {
                    return Some("Stop Loss");
                }
                if current_price >= take_profit {
                    return Some("Take Profit");
                }
                if market_state == MarketState::ImbalanceDown && direction == FlowDirection::Sell {
                    return Some("Opposite Signal");
                }
            }
            Side::Sell => {
                if current_price >= stop_loss {
                    return Some("Stop Loss");
                }
                if current_price <= take_profit {
                    return Some("Take Profit");
                }
                if market_state == MarketState::ImbalanceUp && direction == FlowDirection::Buy {
                    return Some("Opposite Signal");
                }
            }
        }
        None
    }

    /// Risk-based position size: floor(risk_amount / stop_distance), capped
    /// by what available cash can buy. Returns 0 when the stop distance is
    /// zero or nothing is affordable.
    pub fn position_size(
        &self,
        account_equity: f64,
        entry_price: f64,
        stop_loss: f64,
        available_cash: f64,
    ) -> i64 {
        let risk_amount = account_equity * self.params.risk_per_trade_pct / 100.0;
        let stop_distance = (entry_price - stop_loss).abs();
        if stop_distance == 0.0 || entry_price <= 0.0 {
            return 0;
        }

        let mut quantity = (risk_amount / stop_distance) as i64;
        let cost = quantity as f64 * entry_price;
        if cost > available_cash {
            quantity = (available_cash / entry_price) as i64;
        }
        quantity.max(0)
    }
}
