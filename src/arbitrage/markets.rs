//! Active binary-market refresh.
//!
//! Periodically fetches the tradable market list from the markets REST API
//! and upserts it (question, category, end date, YES/NO token ids) so the
//! feed can build its subscription set from the store alone.

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::Result;
use crate::store::Store;
use crate::types::BinaryMarket;

const REFRESH_MINUTES: u64 = 10;

/// Parse a markets listing response into typed markets. Rows missing a
/// condition id, an end date, or either outcome token are skipped.
pub fn parse_markets(body: &serde_json::Value) -> Vec<BinaryMarket> {
    let Some(rows) = body
        .get("data")
        .and_then(|d| d.as_array())
        .or_else(|| body.as_array())
    else {
        return Vec::new();
    };

    rows.iter()
        .filter_map(|row| {
            let market_id = row
                .get("condition_id")
                .or_else(|| row.get("id"))
                .and_then(|v| v.as_str())?
                .to_string();
            let question = row
                .get("question")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let category = row
                .get("category")
                .and_then(|v| v.as_str())
                .unwrap_or("other")
                .to_string();
            let end_date: DateTime<Utc> = row
                .get("end_date_iso")
                .or_else(|| row.get("endDate"))
                .and_then(|v| v.as_str())?
                .parse::<DateTime<chrono::FixedOffset>>()
                .ok()?
                .with_timezone(&Utc);

            let tokens = row.get("tokens")?.as_array()?;
            let mut yes_token = None;
            let mut no_token = None;
            for token in tokens {
                let id = token.get("token_id").and_then(|v| v.as_str())?;
                match token.get("outcome").and_then(|v| v.as_str()) {
                    Some("Yes") => yes_token = Some(id.to_string()),
                    Some("No") => no_token = Some(id.to_string()),
                    _ => {}
                }
            }

            let symbol = row
                .get("market_slug")
                .and_then(|v| v.as_str())
                .map(|s| s.to_uppercase())
                .unwrap_or_else(|| market_id.to_uppercase());

            let active = row.get("active").and_then(|v| v.as_bool()).unwrap_or(true)
                && !row.get("closed").and_then(|v| v.as_bool()).unwrap_or(false);

            Some(BinaryMarket {
                market_id,
                symbol,
                question,
                category,
                end_date,
                yes_token_id: yes_token?,
                no_token_id: no_token?,
                active,
            })
        })
        .collect()
}

/// Fetch the current listing and upsert every market, creating symbols on
/// first sighting. Returns the number of markets stored.
pub async fn refresh_markets(store: &Store, http: &reqwest::Client, api_url: &str) -> Result<usize> {
    let url = format!("{}/markets?active=true&closed=false", api_url.trim_end_matches('/'));
    let body: serde_json::Value = http.get(&url).send().await?.json().await?;

    let markets = parse_markets(&body);
    let mut stored = 0;
    for market in &markets {
        let symbol_id = store.upsert_symbol(&market.symbol).await?;
        store.upsert_binary_market(symbol_id, market).await?;
        stored += 1;
    }
    Ok(stored)
}

/// Background refresh loop (10-minute cadence).
pub async fn market_refresh_task(store: Store, api_url: String, mut shutdown: watch::Receiver<bool>) {
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("reqwest client");

    loop {
        match refresh_markets(&store, &http, &api_url).await {
            Ok(n) => info!(target: "arb", markets = n, "market list refreshed"),
            Err(e) => warn!(target: "arb", error = %e, "market refresh failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(REFRESH_MINUTES * 60)) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
