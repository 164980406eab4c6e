//! Automated live trading: per tick, per symbol, read the latest analytics
//! rows, evaluate the shared auction-market strategy, and place a bracket
//! order through the risk gates. Placed order ids are handed to the order
//! monitor.

use tracing::{debug, info, warn};

use crate::store::Store;
use crate::strategy::atr::{self, DEFAULT_PERIODS};
use crate::strategy::auction_market::AuctionMarketStrategy;
use crate::trading::broker::BrokerClient;
use crate::trading::position_manager::PositionManager;
use crate::types::{BrokerOrder, EntrySignal, MarketState};

pub struct AutoTrader {
    store: Store,
    broker: BrokerClient,
    strategy: AuctionMarketStrategy,
}

impl AutoTrader {
    pub fn new(store: Store, broker: BrokerClient, strategy: AuctionMarketStrategy) -> Self {
        Self { store, broker, strategy }
    }

    /// Evaluate the entry signal for one symbol from the latest store rows.
    /// Absence of any input degrades to None; nothing here raises.
    pub async fn evaluate_entry_signal(&self, symbol_id: i32, symbol: &str) -> Option<EntrySignal> {
        let current_price = self.store.latest_close(symbol_id).await.ok()??;
        let state_row = self.store.latest_market_state(symbol_id).await.ok()??;
        if state_row.state == MarketState::Unknown {
            return None;
        }

        let flow = self.store.recent_order_flow(symbol_id, 5).await.ok()?;
        let latest = flow.first()?;
        let cvd_momentum = if flow.len() >= 2 {
            latest.cumulative_delta - flow[flow.len() - 1].cumulative_delta
        } else {
            0
        };

        let atr = atr::atr_from_store(&self.store, symbol_id, DEFAULT_PERIODS).await?;

        self.strategy.evaluate_entry_signal(
            state_row.state,
            state_row.confidence,
            latest.buy_pressure,
            latest.sell_pressure,
            cvd_momentum,
            current_price,
            atr,
            symbol,
        )
    }

    /// Place the bracket order for a signal, subject to the portfolio gates.
    /// Returns the accepted order and the reference entry price on success.
    pub async fn execute(
        &self,
        manager: &mut PositionManager,
        signal: &EntrySignal,
    ) -> Option<(BrokerOrder, f64)> {
        let (can_trade, reason) = manager.can_open_position(&signal.symbol).await;
        if !can_trade {
            warn!(target: "trade", symbol = %signal.symbol, %reason, "entry blocked");
            return None;
        }

        let qty = manager
            .position_size(&signal.symbol, signal.entry_price, signal.stop_loss)
            .await;
        if qty == 0 {
            warn!(target: "trade", symbol = %signal.symbol, "position size is 0");
            return None;
        }

        info!(
            target: "trade",
            symbol = %signal.symbol,
            side = %signal.side,
            qty,
            entry = signal.entry_price,
            stop = signal.stop_loss,
            take_profit = signal.take_profit,
            reason = %signal.reason,
            "executing trade"
        );

        let order = match self
            .broker
            .place_bracket_order(
                &signal.symbol,
                qty,
                signal.side,
                signal.take_profit,
                signal.stop_loss,
            )
            .await
        {
            Ok(order) => order,
            Err(e) => {
                // Broker rejections are terminal for this attempt; the next
                // reconciliation pass clears any partial state.
                warn!(target: "trade", symbol = %signal.symbol, error = %e, "order placement failed");
                return None;
            }
        };

        if let Err(e) = manager
            .log_trade(
                &signal.symbol,
                &signal.side.as_str().to_uppercase(),
                qty,
                signal.entry_price,
                &order.id,
                &signal.reason,
            )
            .await
        {
            warn!(target: "trade", symbol = %signal.symbol, error = %e, "trade log write failed");
        }

        Some((order, signal.entry_price))
    }

    /// One auto-trading pass for one symbol: skip when a position already
    /// exists, otherwise evaluate and execute. The placed order (if any) is
    /// returned for the caller to hand to the order monitor.
    pub async fn check_and_execute(
        &self,
        manager: &mut PositionManager,
        symbol_id: i32,
        symbol: &str,
    ) -> Option<(BrokerOrder, f64)> {
        match self.broker.get_position(symbol).await {
            Ok(Some(_)) => {
                debug!(target: "trade", %symbol, "position exists, skipping");
                return None;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(target: "trade", %symbol, error = %e, "position lookup failed, skipping");
                return None;
            }
        }

        let signal = self.evaluate_entry_signal(symbol_id, symbol).await?;
        info!(target: "trade", %symbol, reason = %signal.reason, "entry signal");
        self.execute(manager, &signal).await
    }
}
