//! Ingestion: route symbols to providers and fan out one worker per
//! provider instance. Every provider produces the same normalized output
//! (ticks and 1-minute candles) and owns its own lifecycle — connect,
//! resubscribe on reconnect, cooperative shutdown.

pub mod polling;
pub mod stream;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::store::{Store, SymbolCache};
use crate::types::NormalizedRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    /// WebSocket trade stream (US equities style symbols).
    Streaming,
    /// 60-second REST polling.
    Polling,
    /// Binary-outcome market; owned by the arbitrage engine, not routed here.
    Binary,
}

/// Route a symbol to its provider.
///
/// Plain US-style tickers stream; exchange-suffixed symbols, indices, and
/// forex pairs poll; dash-separated identifiers longer than six characters
/// are binary markets.
pub fn route_symbol(symbol: &str) -> ProviderKind {
    if symbol.contains('-') && symbol.len() > 6 {
        return ProviderKind::Binary;
    }
    if !symbol.contains('.') && !symbol.starts_with('^') && symbol.len() < 6 {
        return ProviderKind::Streaming;
    }
    ProviderKind::Polling
}

/// Persist one normalized record, creating the symbol row on first sighting.
pub async fn persist_record(
    store: &Store,
    cache: &mut SymbolCache,
    record: &NormalizedRecord,
) -> Result<()> {
    match record {
        NormalizedRecord::Tick { symbol, tick } => {
            let symbol_id = cache.id(store, symbol).await?;
            store.insert_tick(symbol_id, tick).await
        }
        NormalizedRecord::Candle { symbol, candle } => {
            let symbol_id = cache.id(store, symbol).await?;
            store.upsert_candle(symbol_id, candle).await
        }
    }
}

/// Partition the configured symbols by provider and spawn one worker task
/// per provider instance. Binary symbols are left to the arbitrage engine.
pub fn spawn_workers(
    config: &Config,
    store: Store,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut streaming: Vec<String> = Vec::new();
    let mut polling: Vec<String> = Vec::new();

    for symbol in &config.symbols {
        match route_symbol(symbol) {
            ProviderKind::Streaming => streaming.push(symbol.clone()),
            ProviderKind::Polling => polling.push(symbol.clone()),
            ProviderKind::Binary => {
                warn!(target: "ingest", %symbol, "binary symbol ignored by equity ingestion");
            }
        }
    }

    let mut handles = Vec::new();

    if !streaming.is_empty() {
        info!(target: "ingest", symbols = ?streaming, "starting streaming worker");
        let worker = stream::StreamWorker::new(
            store.clone(),
            config.stream_ws_url.clone(),
            config.broker.api_key.clone(),
            config.broker.secret_key.clone(),
            streaming,
        );
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }

    if !polling.is_empty() {
        info!(target: "ingest", symbols = ?polling, "starting polling worker");
        let source = match &config.poll_api_key {
            Some(key) => polling::PollingSource::Intraday {
                api_url: config.poll_api_url.clone(),
                api_key: key.clone(),
            },
            None => polling::PollingSource::Demo,
        };
        let store = store.clone();
        let rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            polling::polling_worker(store, source, polling, rx).await;
        }));
    }

    handles
}
