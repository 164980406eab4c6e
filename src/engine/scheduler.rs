//! Detection and trading scheduler.
//!
//! One 1-second ticker drives the detection passes at their cadences:
//! market-state detection every 5th tick, LVN alerts every 2nd, aggressive
//! flow every tick, auto-trading every tick when enabled. Placed orders go
//! to the order-monitor task over a channel; the monitor polls the broker at
//! its own cadence and reconciles periodically. Every pass swallows its own
//! errors — one bad cycle never stops the loop.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::Config;
use crate::detectors::aggressive_flow::AggressiveFlowIndicator;
use crate::detectors::lvn::LvnAlertSystem;
use crate::detectors::market_state::MarketStateDetector;
use crate::feeds::{route_symbol, ProviderKind};
use crate::store::Store;
use crate::strategy::auction_market::AuctionMarketStrategy;
use crate::trading::auto_trader::AutoTrader;
use crate::trading::broker::BrokerClient;
use crate::trading::order_monitor::OrderMonitor;
use crate::trading::position_manager::PositionManager;
use crate::types::BrokerOrder;

/// Monitor poll cadence; reconciliation runs every sixth cycle.
const MONITOR_POLL_SECS: u64 = 10;
const RECONCILE_EVERY: u64 = 6;

/// Main detection/trading loop.
pub async fn run_scheduler(
    store: Store,
    broker: BrokerClient,
    config: Config,
    order_tx: mpsc::Sender<(BrokerOrder, f64)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let detector = MarketStateDetector::new(store.clone(), config.detector);
    let flow = AggressiveFlowIndicator::new(store.clone());
    let lvn = LvnAlertSystem::new(store.clone());
    let trader = AutoTrader::new(
        store.clone(),
        broker.clone(),
        AuctionMarketStrategy::new(config.strategy),
    );
    let mut manager = PositionManager::new(
        store.clone(),
        broker,
        config.risk,
        config.strategy.risk_per_trade_pct,
        config.strategy.max_positions,
    );

    // Symbols ordered this tick before a fill or cancel can be observed;
    // throttled so one signal does not stack orders.
    let mut recently_ordered: HashMap<String, DateTime<Utc>> = HashMap::new();

    if config.auto_trading_enabled {
        info!(target: "engine", "scheduler started with automated trading ENABLED");
    } else {
        info!(target: "engine", "scheduler started (auto-trading disabled)");
    }

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    let mut loop_count: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(target: "engine", "scheduler shutting down");
                    return;
                }
            }
        }

        if loop_count % 5 == 0 {
            detector.run_all().await;
        }
        if loop_count % 2 == 0 {
            lvn.run_all().await;
        }
        flow.run_all().await;

        if config.auto_trading_enabled {
            let symbols = store.all_symbols().await.unwrap_or_default();
            let now = Utc::now();
            let cooldown = Duration::minutes(config.order_monitor.max_order_age_minutes);
            recently_ordered.retain(|_, t| now - *t < cooldown);

            for (symbol_id, symbol) in symbols {
                if route_symbol(&symbol) == ProviderKind::Binary {
                    continue;
                }
                if recently_ordered.contains_key(&symbol) {
                    continue;
                }
                if let Some((order, entry_price)) =
                    trader.check_and_execute(&mut manager, symbol_id, &symbol).await
                {
                    recently_ordered.insert(symbol.clone(), now);
                    if order_tx.send((order, entry_price)).await.is_err() {
                        warn!(target: "engine", "order monitor channel closed");
                    }
                }
            }
        }

        loop_count += 1;
    }
}

/// Order-monitor task: tracks orders arriving over the channel and applies
/// the fill/timeout/slippage rules on its own poll cadence.
pub async fn run_order_monitor(
    store: Store,
    broker: BrokerClient,
    config: Config,
    mut order_rx: mpsc::Receiver<(BrokerOrder, f64)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut monitor = OrderMonitor::new(broker, config.order_monitor);
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(MONITOR_POLL_SECS));
    let mut cycles: u64 = 0;

    info!(target: "monitor", "order monitor started");

    loop {
        tokio::select! {
            Some((order, entry_price)) = order_rx.recv() => {
                monitor.track_order(&order, entry_price);
            }
            _ = interval.tick() => {
                if monitor.pending_count() > 0 {
                    let mut prices: HashMap<String, f64> = HashMap::new();
                    let symbols = store.all_symbols().await.unwrap_or_default();
                    for (symbol_id, symbol) in symbols {
                        if monitor.has_pending_order(&symbol) {
                            if let Ok(Some(close)) = store.latest_close(symbol_id).await {
                                prices.insert(symbol, close);
                            }
                        }
                    }
                    monitor.check_orders(&prices).await;
                }

                cycles += 1;
                if cycles % RECONCILE_EVERY == 0 {
                    let (synced, removed) = monitor.reconcile().await;
                    if synced > 0 || removed > 0 {
                        info!(target: "monitor", synced, removed, "reconciliation");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(target: "monitor", "order monitor shutting down");
                    return;
                }
            }
        }
    }
}
