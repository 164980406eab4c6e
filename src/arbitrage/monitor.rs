//! Early-exit scanner for open arbitrage positions.
//!
//! Runs every 60 seconds. A position locked below $1.00 can be unwound
//! early once the spread normalizes: selling both legs at a combined price
//! at or above $1.00 realizes the profit without waiting for resolution.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::arbitrage::client::BinaryClient;
use crate::store::Store;
use crate::types::BinaryPosition;

/// Exit rules, most aggressive first. `end_date` is the market's resolution
/// time when known.
pub fn early_exit_reason(
    current_spread: Decimal,
    end_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<&'static str> {
    if current_spread > dec!(1.02) {
        return Some("spread above 1.02");
    }
    if current_spread >= dec!(1.00) {
        return Some("spread normalized");
    }
    if let Some(end) = end_date {
        if end - now < Duration::hours(24) && current_spread >= dec!(0.99) {
            return Some("near resolution");
        }
    }
    None
}

pub struct EarlyExitMonitor {
    store: Store,
    client: BinaryClient,
}

impl EarlyExitMonitor {
    pub fn new(store: Store, client: BinaryClient) -> Self {
        Self { store, client }
    }

    async fn try_exit(&self, position: &BinaryPosition) -> crate::error::Result<()> {
        let Some(symbol_id) = self.store.symbol_id(&position.symbol).await? else {
            return Ok(());
        };
        let Some(spread) = self.store.latest_binary_spread(symbol_id).await? else {
            return Ok(());
        };

        let Some(reason) = early_exit_reason(spread, position.end_date, Utc::now()) else {
            return Ok(());
        };

        info!(
            target: "arb",
            symbol = %position.symbol,
            position_id = position.id,
            %spread,
            %reason,
            "early exit"
        );

        // Sell both legs at their current bids before releasing the position.
        if let (Some((yes_token, no_token)), Some((yes, no))) = (
            self.store.binary_market_tokens(&position.market_id).await?,
            self.store.latest_binary_quotes(symbol_id).await?,
        ) {
            let (yes_result, no_result) = tokio::join!(
                self.client.close_leg(&yes_token, position.yes_qty, yes.bid),
                self.client.close_leg(&no_token, position.no_qty, no.bid),
            );
            if let Err(e) = yes_result {
                warn!(target: "arb", position_id = position.id, error = %e, "YES leg close failed");
            }
            if let Err(e) = no_result {
                warn!(target: "arb", position_id = position.id, error = %e, "NO leg close failed");
            }
        }

        self.store.close_binary_position(position.id, reason).await
    }

    /// 60-second scan loop over open positions.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(target: "arb", "early-exit monitor shutting down");
                        return;
                    }
                }
            }

            let positions = match self.store.open_binary_positions().await {
                Ok(p) => p,
                Err(e) => {
                    warn!(target: "arb", error = %e, "position listing failed");
                    continue;
                }
            };

            for position in &positions {
                if let Err(e) = self.try_exit(position).await {
                    warn!(
                        target: "arb",
                        position_id = position.id,
                        error = %e,
                        "early-exit check failed"
                    );
                }
            }
        }
    }
}
