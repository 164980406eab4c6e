//! Pending-order lifecycle monitoring.
//!
//! Tracks every order this process placed and, each cycle: treats orders the
//! broker no longer lists as open as filled, cancels orders past the age
//! limit, and cancels limit orders whose reference price has slipped too
//! far. Periodic reconciliation resyncs status with the broker and drops
//! ids the broker does not recognize.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::OrderMonitorConfig;
use crate::trading::broker::BrokerClient;
use crate::types::BrokerOrder;

#[derive(Clone, Debug)]
pub struct TrackedOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: i64,
    pub status: String,
    pub order_type: String,
    /// Price when the order was placed, for the slippage check.
    pub entry_price: f64,
    pub placed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderAction {
    /// No longer open at the broker — treat as filled.
    Fill,
    Cancel(CancelReason),
    Keep,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    Timeout,
    Slippage,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Timeout => "timeout",
            CancelReason::Slippage => "slippage",
        }
    }
}

/// Decide what to do with one tracked order this cycle.
pub fn order_action(
    order: &TrackedOrder,
    still_open: bool,
    now: DateTime<Utc>,
    current_price: Option<f64>,
    cfg: &OrderMonitorConfig,
) -> OrderAction {
    if !still_open {
        return OrderAction::Fill;
    }

    let age_minutes = (now - order.placed_at).num_seconds() as f64 / 60.0;
    if age_minutes > cfg.max_order_age_minutes as f64 {
        return OrderAction::Cancel(CancelReason::Timeout);
    }

    if order.order_type == "limit" {
        if let Some(price) = current_price {
            if order.entry_price > 0.0 {
                let change_pct = (price - order.entry_price).abs() / order.entry_price * 100.0;
                if change_pct > cfg.max_slippage_pct {
                    return OrderAction::Cancel(CancelReason::Slippage);
                }
            }
        }
    }

    OrderAction::Keep
}

#[derive(Debug, Default)]
pub struct OrderCheck {
    pub filled: Vec<TrackedOrder>,
    pub cancelled: Vec<(TrackedOrder, CancelReason)>,
    pub pending: usize,
}

pub struct OrderMonitor {
    broker: BrokerClient,
    cfg: OrderMonitorConfig,
    tracked: HashMap<String, TrackedOrder>,
}

impl OrderMonitor {
    pub fn new(broker: BrokerClient, cfg: OrderMonitorConfig) -> Self {
        Self { broker, cfg, tracked: HashMap::new() }
    }

    pub fn track_order(&mut self, order: &BrokerOrder, entry_price: f64) {
        info!(
            target: "monitor",
            order_id = %order.id,
            symbol = %order.symbol,
            side = %order.side,
            qty = order.qty,
            "tracking order"
        );
        self.tracked.insert(
            order.id.clone(),
            TrackedOrder {
                order_id: order.id.clone(),
                symbol: order.symbol.clone(),
                side: order.side.clone(),
                qty: order.qty,
                status: order.status.clone(),
                order_type: order.order_type.clone(),
                entry_price,
                placed_at: Utc::now(),
            },
        );
    }

    pub fn pending_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn has_pending_order(&self, symbol: &str) -> bool {
        self.tracked.values().any(|o| o.symbol == symbol)
    }

    /// Apply the fill / timeout / slippage rules to every tracked order.
    pub async fn check_orders(&mut self, current_prices: &HashMap<String, f64>) -> OrderCheck {
        let mut result = OrderCheck::default();
        if self.tracked.is_empty() {
            return result;
        }

        let open_ids: std::collections::HashSet<String> = match self.broker.get_orders("open").await
        {
            Ok(orders) => orders.into_iter().map(|o| o.id).collect(),
            Err(e) => {
                warn!(target: "monitor", error = %e, "open-order listing failed, skipping cycle");
                result.pending = self.tracked.len();
                return result;
            }
        };

        let now = Utc::now();
        let ids: Vec<String> = self.tracked.keys().cloned().collect();
        for id in ids {
            let order = self.tracked.get(&id).cloned().expect("tracked id");
            let price = current_prices.get(&order.symbol).copied();
            match order_action(&order, open_ids.contains(&id), now, price, &self.cfg) {
                OrderAction::Fill => {
                    info!(target: "monitor", order_id = %id, symbol = %order.symbol, "order filled");
                    self.tracked.remove(&id);
                    result.filled.push(order);
                }
                OrderAction::Cancel(reason) => {
                    warn!(
                        target: "monitor",
                        order_id = %id,
                        symbol = %order.symbol,
                        reason = reason.as_str(),
                        "cancelling order"
                    );
                    if self.broker.cancel_order(&id).await {
                        self.tracked.remove(&id);
                        result.cancelled.push((order, reason));
                    }
                }
                OrderAction::Keep => {}
            }
        }

        result.pending = self.tracked.len();
        if !result.filled.is_empty() || !result.cancelled.is_empty() {
            info!(
                target: "monitor",
                filled = result.filled.len(),
                cancelled = result.cancelled.len(),
                pending = result.pending,
                "order check"
            );
        }
        result
    }

    /// Resync tracked status with the broker's full order list; drop ids the
    /// broker does not know and ids in a terminal state.
    pub async fn reconcile(&mut self) -> (usize, usize) {
        if self.tracked.is_empty() {
            return (0, 0);
        }

        let broker_orders: HashMap<String, BrokerOrder> = match self.broker.get_orders("all").await
        {
            Ok(orders) => orders.into_iter().map(|o| (o.id.clone(), o)).collect(),
            Err(e) => {
                warn!(target: "monitor", error = %e, "reconcile listing failed");
                return (0, 0);
            }
        };

        let mut synced = 0;
        let mut removed = 0;
        let ids: Vec<String> = self.tracked.keys().cloned().collect();
        for id in ids {
            match broker_orders.get(&id) {
                Some(broker_order) => {
                    let tracked = self.tracked.get_mut(&id).expect("tracked id");
                    if tracked.status != broker_order.status {
                        info!(
                            target: "monitor",
                            order_id = %id,
                            from = %tracked.status,
                            to = %broker_order.status,
                            "order status synced"
                        );
                        tracked.status = broker_order.status.clone();
                        synced += 1;
                        if matches!(
                            broker_order.status.as_str(),
                            "filled" | "cancelled" | "canceled" | "expired" | "rejected"
                        ) {
                            self.tracked.remove(&id);
                            removed += 1;
                        }
                    }
                }
                None => {
                    warn!(target: "monitor", order_id = %id, "order unknown to broker, dropping");
                    self.tracked.remove(&id);
                    removed += 1;
                }
            }
        }

        (synced, removed)
    }

    /// Emergency stop: cancel everything still tracked.
    pub async fn cancel_all_pending(&mut self) -> usize {
        let ids: Vec<String> = self.tracked.keys().cloned().collect();
        let mut cancelled = 0;
        for id in ids {
            if self.broker.cancel_order(&id).await {
                self.tracked.remove(&id);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!(target: "monitor", cancelled, "cancelled all pending orders");
        }
        cancelled
    }
}
