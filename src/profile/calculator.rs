//! Periodic volume-profile calculation loop.
//!
//! On the first pass every historical 1-minute bucket is processed per
//! symbol; afterwards the last five buckets are recomputed every 60 seconds
//! so late-arriving data is folded in. Each processed bucket upserts the
//! profile rows, the metrics row, and the chained order-flow row.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::profile::flow::order_flow_from_profile;
use crate::profile::{metrics, profile_from_candles, profile_from_ticks};
use crate::store::Store;

/// Floor a timestamp to its 1-minute bucket.
pub fn bucket_floor(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp();
    Utc.timestamp_opt(secs - secs.rem_euclid(60), 0).unwrap()
}

pub struct ProfileCalculator {
    store: Store,
}

impl ProfileCalculator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Compute and persist one bucket for one symbol. Ticks take precedence;
    /// candles are the fallback. Returns false when the bucket holds no data.
    pub async fn process_bucket(
        &self,
        symbol_id: i32,
        bucket_start: DateTime<Utc>,
    ) -> Result<bool> {
        let bucket_end = bucket_start + Duration::minutes(1);

        let ticks = self
            .store
            .ticks_in_bucket(symbol_id, bucket_start, bucket_end)
            .await?;
        let profile = if !ticks.is_empty() {
            profile_from_ticks(&ticks)
        } else {
            let candles = self
                .store
                .candles_in_bucket(symbol_id, bucket_start, bucket_end)
                .await?;
            if candles.is_empty() {
                return Ok(false);
            }
            profile_from_candles(&candles)
        };

        if profile.is_empty() {
            return Ok(false);
        }

        // Profile rows first, then metrics and flow; each write is
        // transactional so readers see a whole bucket or none of it.
        self.store
            .upsert_profile_rows(symbol_id, bucket_start, &profile)
            .await?;

        if let Some(m) = metrics(bucket_start, &profile) {
            self.store.upsert_profile_metrics(symbol_id, &m).await?;
        }

        let prev_cvd = self.store.get_last_cvd(symbol_id, bucket_start).await?;
        let flow = order_flow_from_profile(bucket_start, &profile, prev_cvd);
        self.store.upsert_order_flow(symbol_id, &flow).await?;

        Ok(true)
    }

    /// Backfill every bucket across a symbol's stored candle history.
    async fn backfill_symbol(&self, symbol_id: i32, symbol: &str) -> Result<usize> {
        let Some((min_t, max_t)) = self.store.candle_time_range(symbol_id).await? else {
            return Ok(0);
        };

        let mut processed = 0;
        let mut current = bucket_floor(min_t);
        while current <= max_t {
            if self.process_bucket(symbol_id, current).await? {
                processed += 1;
            }
            current += Duration::minutes(1);
        }
        info!(target: "profile", %symbol, buckets = processed, "backfill complete");
        Ok(processed)
    }

    /// Recompute the last `n` closed buckets.
    async fn process_recent(&self, symbol_id: i32, n: i64) -> Result<()> {
        let now = Utc::now();
        for i in (1..=n).rev() {
            let bucket = bucket_floor(now - Duration::minutes(i));
            self.process_bucket(symbol_id, bucket).await?;
        }
        Ok(())
    }

    /// Main loop. First pass backfills all history; subsequent passes
    /// refresh the trailing five buckets every 60 seconds.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(target: "profile", "volume profile calculator started");
        let mut first_run = true;

        loop {
            let pass = async {
                let symbols = self.store.all_symbols().await?;
                for (symbol_id, symbol) in symbols {
                    if first_run {
                        self.backfill_symbol(symbol_id, &symbol).await?;
                    } else {
                        self.process_recent(symbol_id, 5).await?;
                    }
                }
                Ok::<_, crate::error::Error>(())
            };

            let sleep_secs = match pass.await {
                Ok(()) => {
                    first_run = false;
                    60
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(target: "profile", error = %e, "transient failure, retrying");
                    } else {
                        error!(target: "profile", error = %e, "calculation pass failed");
                    }
                    15
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(target: "profile", "calculator shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: timestamps with stray seconds and sub-seconds.
    /// Expected: bucket_floor truncates to the enclosing minute; already
    /// aligned times are unchanged.
    #[test]
    fn test_bucket_floor() {
        let t = Utc.with_ymd_and_hms(2025, 1, 15, 14, 30, 45).unwrap();
        let floored = bucket_floor(t);
        assert_eq!(floored, Utc.with_ymd_and_hms(2025, 1, 15, 14, 30, 0).unwrap());

        let aligned = Utc.with_ymd_and_hms(2025, 1, 15, 14, 30, 0).unwrap();
        assert_eq!(bucket_floor(aligned), aligned);
    }

    /// Scenario: consecutive buckets are exactly one minute apart.
    /// Expected: flooring a time in the next minute lands on the next bucket.
    #[test]
    fn test_bucket_floor_boundaries() {
        let end_of_minute = Utc.with_ymd_and_hms(2025, 1, 15, 14, 30, 59).unwrap();
        let next_minute = Utc.with_ymd_and_hms(2025, 1, 15, 14, 31, 0).unwrap();
        assert_eq!(bucket_floor(next_minute) - bucket_floor(end_of_minute), Duration::minutes(1));
    }
}
