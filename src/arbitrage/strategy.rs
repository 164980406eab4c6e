//! Arbitrage execution: gate fresh opportunities through the risk limits
//! and place paired YES + NO orders.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::arbitrage::client::{BinaryClient, OrderSide};
use crate::config::ArbitrageConfig;
use crate::error::Result;
use crate::store::Store;
use crate::types::ArbOpportunity;

/// Dollar size for the next position: the per-position cap bounded by the
/// exposure room left. Never negative.
pub fn position_size(
    max_position_size: Decimal,
    max_total_exposure: Decimal,
    current_exposure: Decimal,
) -> Decimal {
    let available = max_total_exposure - current_exposure;
    max_position_size.min(available).max(Decimal::ZERO)
}

/// Equal-dollar share counts for both legs, rounded to 2 decimals.
pub fn leg_quantities(size: Decimal, yes_ask: Decimal, no_ask: Decimal) -> Option<(Decimal, Decimal)> {
    if size <= Decimal::ZERO || yes_ask <= Decimal::ZERO || no_ask <= Decimal::ZERO {
        return None;
    }
    Some(((size / yes_ask).round_dp(2), (size / no_ask).round_dp(2)))
}

pub struct ArbitrageStrategy {
    store: Store,
    client: BinaryClient,
    min_profit_pct: Decimal,
    max_position_size: Decimal,
    max_total_exposure: Decimal,
}

impl ArbitrageStrategy {
    pub fn new(store: Store, client: BinaryClient, cfg: &ArbitrageConfig) -> Self {
        Self {
            store,
            client,
            min_profit_pct: Decimal::from_f64_retain(cfg.min_profit_pct).unwrap_or(dec!(0.5)),
            max_position_size: Decimal::from_f64_retain(cfg.max_position_size).unwrap_or(dec!(100)),
            max_total_exposure: Decimal::from_f64_retain(cfg.max_total_exposure)
                .unwrap_or(dec!(400)),
        }
    }

    /// Execute one opportunity if every gate passes. Returns true when a
    /// position was recorded.
    pub async fn try_execute(&self, opp: &ArbOpportunity) -> Result<bool> {
        if opp.estimated_profit_pct < self.min_profit_pct {
            return Ok(false);
        }

        let exposure = self.store.open_binary_exposure().await?;
        if exposure >= self.max_total_exposure {
            warn!(
                target: "arb",
                symbol = %opp.symbol,
                %exposure,
                cap = %self.max_total_exposure,
                "max exposure reached"
            );
            return Ok(false);
        }
        if self.store.has_open_binary_position(&opp.market_id).await? {
            return Ok(false);
        }

        let size = position_size(self.max_position_size, self.max_total_exposure, exposure);
        let Some((yes_qty, no_qty)) = leg_quantities(size, opp.yes_ask, opp.no_ask) else {
            return Ok(false);
        };
        let Some((yes_token, no_token)) =
            self.store.binary_market_tokens(&opp.market_id).await?
        else {
            warn!(target: "arb", market = %opp.market_id, "token ids missing, skipping");
            return Ok(false);
        };

        info!(
            target: "arb",
            symbol = %opp.symbol,
            spread = %opp.spread,
            yes_qty = %yes_qty,
            no_qty = %no_qty,
            "executing paired orders"
        );

        // Both legs in parallel: a sequential second leg races the book.
        let (yes_result, no_result) = tokio::join!(
            self.client.place_order(&yes_token, OrderSide::Buy, opp.yes_ask, yes_qty),
            self.client.place_order(&no_token, OrderSide::Buy, opp.no_ask, no_qty),
        );

        let yes_fill = yes_result.ok().filter(|a| a.filled);
        let no_fill = no_result.ok().filter(|a| a.filled);

        match (yes_fill, no_fill) {
            (Some(yes), Some(no)) => {
                let id = self
                    .store
                    .insert_binary_position(
                        opp.symbol_id,
                        &opp.market_id,
                        yes.fill_qty,
                        no.fill_qty,
                        yes.fill_price,
                        no.fill_price,
                    )
                    .await?;
                info!(
                    target: "arb",
                    symbol = %opp.symbol,
                    position_id = id,
                    locked = %(yes.fill_qty.min(no.fill_qty)
                        - (yes.fill_qty * yes.fill_price + no.fill_qty * no.fill_price)),
                    "arbitrage position opened"
                );
                Ok(true)
            }
            (Some(yes), None) => {
                // One-sided fill is directional exposure; unwind immediately.
                warn!(target: "arb", symbol = %opp.symbol, "NO leg failed, closing YES leg");
                self.unwind_leg(opp, &yes_token, yes.fill_qty, true).await;
                Ok(false)
            }
            (None, Some(no)) => {
                warn!(target: "arb", symbol = %opp.symbol, "YES leg failed, closing NO leg");
                self.unwind_leg(opp, &no_token, no.fill_qty, false).await;
                Ok(false)
            }
            (None, None) => {
                warn!(target: "arb", symbol = %opp.symbol, "both legs failed");
                Ok(false)
            }
        }
    }

    async fn unwind_leg(&self, opp: &ArbOpportunity, token: &str, qty: Decimal, is_yes: bool) {
        let best_bid = match self.store.latest_binary_quotes(opp.symbol_id).await {
            Ok(Some((yes, no))) => {
                if is_yes {
                    yes.bid
                } else {
                    no.bid
                }
            }
            // No quote available: bid a cent under the entry ask.
            _ => (if is_yes { opp.yes_ask } else { opp.no_ask }) - dec!(0.01),
        };
        if let Err(e) = self.client.close_leg(token, qty, best_bid).await {
            warn!(target: "arb", symbol = %opp.symbol, error = %e, "leg unwind failed");
        }
    }

    /// Scan-and-execute loop: every second, act on fresh flagged rows.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(target: "arb", "strategy shutting down");
                        return;
                    }
                }
            }

            let since = chrono::Utc::now() - chrono::Duration::seconds(10);
            let opportunities = match self.store.recent_opportunities(self.min_profit_pct, since).await
            {
                Ok(o) => o,
                Err(e) => {
                    warn!(target: "arb", error = %e, "opportunity scan failed");
                    continue;
                }
            };

            for opp in &opportunities {
                if let Err(e) = self.try_execute(opp).await {
                    warn!(target: "arb", symbol = %opp.symbol, error = %e, "execution failed");
                }
            }
        }
    }
}
