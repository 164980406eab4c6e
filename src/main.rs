mod arbitrage;
mod backtest;
mod config;
mod detectors;
mod engine;
mod error;
mod feeds;
mod profile;
mod store;
mod strategy;
mod trading;
mod types;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use arbitrage::client::BinaryClient;
use arbitrage::feed::{price_writer, ArbitrageFeed};
use arbitrage::markets::market_refresh_task;
use arbitrage::monitor::EarlyExitMonitor;
use arbitrage::strategy::ArbitrageStrategy;
use config::Config;
use engine::scheduler::{run_order_monitor, run_scheduler};
use feeds::{route_symbol, ProviderKind};
use profile::calculator::ProfileCalculator;
use store::Store;
use trading::broker::BrokerClient;
use types::BrokerOrder;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    rustls::crypto::aws_lc_rs::default_provider().install_default().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!(
        symbols = ?config.symbols,
        auto_trading = config.auto_trading_enabled,
        dry_run = config.dry_run,
        max_positions = config.strategy.max_positions,
        "auction-flow starting"
    );

    let store = match Store::connect(&config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            error!("store connection failed: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = store.ensure_schema().await {
        error!("store schema mismatch, refusing to start: {e}");
        std::process::exit(1);
    }

    // Create symbol rows up front so the detection loop sees the configured
    // set before the first record arrives.
    for symbol in &config.symbols {
        if route_symbol(symbol) != ProviderKind::Binary {
            if let Err(e) = store.upsert_symbol(symbol).await {
                error!(%symbol, "symbol bootstrap failed: {e}");
                std::process::exit(1);
            }
        }
    }

    let broker = BrokerClient::new(&config.broker);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // ── Ingestion workers ──
    handles.extend(feeds::spawn_workers(&config, store.clone(), shutdown_rx.clone()));

    // ── Volume profile calculator ──
    {
        let calculator = ProfileCalculator::new(store.clone());
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { calculator.run(rx).await }));
    }

    // ── Detection/trading scheduler + order monitor ──
    let (order_tx, order_rx) = mpsc::channel::<(BrokerOrder, f64)>(64);
    {
        let store = store.clone();
        let broker = broker.clone();
        let config = config.clone();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            run_scheduler(store, broker, config, order_tx, rx).await;
        }));
    }
    {
        let store = store.clone();
        let broker = broker.clone();
        let config = config.clone();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            run_order_monitor(store, broker, config, order_rx, rx).await;
        }));
    }

    // ── Arbitrage engine ──
    let binary_client = BinaryClient::new(&config.arbitrage.order_api_url, config.dry_run);
    let (price_tx, price_rx) = mpsc::channel(4096);
    {
        let store = store.clone();
        handles.push(tokio::spawn(async move { price_writer(store, price_rx).await }));
    }
    {
        let feed = ArbitrageFeed::new(store.clone(), config.arbitrage.clone());
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { feed.run(price_tx, rx).await }));
    }
    {
        let strategy = ArbitrageStrategy::new(store.clone(), binary_client.clone(), &config.arbitrage);
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { strategy.run(rx).await }));
    }
    {
        let monitor = EarlyExitMonitor::new(store.clone(), binary_client);
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { monitor.run(rx).await }));
    }
    {
        let store = store.clone();
        let api_url = config.arbitrage.markets_api_url.clone();
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            market_refresh_task(store, api_url, rx).await;
        }));
    }

    info!(tasks = handles.len(), "all tasks started");

    // Cooperative shutdown: flip the flag and give in-flight work a moment.
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => error!("signal handler failed: {e}"),
    }
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    for handle in &handles {
        handle.abort();
    }
    info!("auction-flow stopped");
}
