//! Postgres time-series store.
//!
//! All persisted state lives here: candles, ticks, volume profiles, order
//! flow, market states, signals, backtest runs, and the binary-market side.
//! Per-row upserts are serialized by primary key; cross-row batches (profile
//! rows, trades, equity points) run as one transaction each so readers see
//! either the full prior state or the full new state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::error::Result;
use crate::profile::VolumeProfile;
use crate::types::{
    ArbOpportunity, BinaryMarket, BinaryPosition, BinaryPrice, Candle, EquityPoint, MarketState,
    MarketStateRow, OrderFlowRow, ProfileMetrics, Tick, TradeRecord,
};

const SCHEMA: &str = include_str!("schema.sql");

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

/// Per-task read-through symbol-id cache. Invalidated only at task restart.
#[derive(Default)]
pub struct SymbolCache {
    map: std::collections::HashMap<String, i32>,
}

impl SymbolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn id(&mut self, store: &Store, symbol: &str) -> Result<i32> {
        if let Some(&id) = self.map.get(symbol) {
            return Ok(id);
        }
        let id = store.upsert_symbol(symbol).await?;
        self.map.insert(symbol.to_string(), id);
        Ok(id)
    }
}

fn parse_level_list(value: &serde_json::Value) -> Vec<f64> {
    value
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_f64()).collect())
        .unwrap_or_default()
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply the idempotent schema. Failure here is fatal: the process must
    /// refuse to start against a store it cannot shape.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!(target: "store", "schema ensured");
        Ok(())
    }

    // ── Symbols ──

    pub async fn upsert_symbol(&self, symbol: &str) -> Result<i32> {
        sqlx::query("INSERT INTO symbols (symbol) VALUES ($1) ON CONFLICT (symbol) DO NOTHING")
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        let row = sqlx::query("SELECT id FROM symbols WHERE symbol = $1")
            .bind(symbol)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("id"))
    }

    pub async fn symbol_id(&self, symbol: &str) -> Result<Option<i32>> {
        let row = sqlx::query("SELECT id FROM symbols WHERE symbol = $1")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("id")))
    }

    pub async fn all_symbols(&self) -> Result<Vec<(i32, String)>> {
        let rows = sqlx::query("SELECT id, symbol FROM symbols ORDER BY symbol")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| (r.get("id"), r.get("symbol"))).collect())
    }

    // ── Candles & ticks ──

    pub async fn upsert_candle(&self, symbol_id: i32, candle: &Candle) -> Result<()> {
        sqlx::query(
            "INSERT INTO candles (time, symbol_id, open, high, low, close, volume)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (time, symbol_id) DO UPDATE SET
                 open = EXCLUDED.open, high = EXCLUDED.high, low = EXCLUDED.low,
                 close = EXCLUDED.close, volume = EXCLUDED.volume",
        )
        .bind(candle.time)
        .bind(symbol_id)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// First tick at the microsecond wins.
    pub async fn insert_tick(&self, symbol_id: i32, tick: &Tick) -> Result<()> {
        sqlx::query(
            "INSERT INTO ticks (time, symbol_id, price, size, venue)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (time, symbol_id, price) DO NOTHING",
        )
        .bind(tick.time)
        .bind(symbol_id)
        .bind(tick.price)
        .bind(tick.size)
        .bind(&tick.venue)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn candle_from_row(row: &sqlx::postgres::PgRow) -> Candle {
        Candle {
            time: row.get("time"),
            open: row.get("open"),
            high: row.get("high"),
            low: row.get("low"),
            close: row.get("close"),
            volume: row.get("volume"),
        }
    }

    pub async fn candles_between(
        &self,
        symbol_id: i32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT time, open, high, low, close, volume FROM candles
             WHERE symbol_id = $1 AND time >= $2 AND time <= $3
             ORDER BY time ASC",
        )
        .bind(symbol_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::candle_from_row).collect())
    }

    pub async fn candles_in_bucket(
        &self,
        symbol_id: i32,
        bucket_start: DateTime<Utc>,
        bucket_end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT time, open, high, low, close, volume FROM candles
             WHERE symbol_id = $1 AND time >= $2 AND time < $3
             ORDER BY time ASC",
        )
        .bind(symbol_id)
        .bind(bucket_start)
        .bind(bucket_end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::candle_from_row).collect())
    }

    /// Latest `limit` candles returned in ascending time order.
    pub async fn last_candles(&self, symbol_id: i32, limit: i64) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT time, open, high, low, close, volume FROM candles
             WHERE symbol_id = $1 ORDER BY time DESC LIMIT $2",
        )
        .bind(symbol_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut candles: Vec<Candle> = rows.iter().map(Self::candle_from_row).collect();
        candles.reverse();
        Ok(candles)
    }

    pub async fn candles_since(&self, symbol_id: i32, since: DateTime<Utc>) -> Result<Vec<Candle>> {
        let rows = sqlx::query(
            "SELECT time, open, high, low, close, volume FROM candles
             WHERE symbol_id = $1 AND time > $2 ORDER BY time ASC",
        )
        .bind(symbol_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::candle_from_row).collect())
    }

    pub async fn latest_close(&self, symbol_id: i32) -> Result<Option<f64>> {
        let row = sqlx::query(
            "SELECT close FROM candles WHERE symbol_id = $1 ORDER BY time DESC LIMIT 1",
        )
        .bind(symbol_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("close")))
    }

    pub async fn candle_count(&self, symbol_id: i32) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM candles WHERE symbol_id = $1")
            .bind(symbol_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn candle_time_range(
        &self,
        symbol_id: i32,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let row = sqlx::query(
            "SELECT MIN(time) AS min_t, MAX(time) AS max_t FROM candles WHERE symbol_id = $1",
        )
        .bind(symbol_id)
        .fetch_one(&self.pool)
        .await?;
        let min_t: Option<DateTime<Utc>> = row.get("min_t");
        let max_t: Option<DateTime<Utc>> = row.get("max_t");
        Ok(min_t.zip(max_t))
    }

    pub async fn ticks_in_bucket(
        &self,
        symbol_id: i32,
        bucket_start: DateTime<Utc>,
        bucket_end: DateTime<Utc>,
    ) -> Result<Vec<Tick>> {
        let rows = sqlx::query(
            "SELECT time, price, size, venue FROM ticks
             WHERE symbol_id = $1 AND time >= $2 AND time < $3
             ORDER BY time ASC",
        )
        .bind(symbol_id)
        .bind(bucket_start)
        .bind(bucket_end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| Tick {
                time: r.get("time"),
                price: r.get("price"),
                size: r.get("size"),
                venue: r.get("venue"),
            })
            .collect())
    }

    pub async fn avg_volume_since(&self, symbol_id: i32, since: DateTime<Utc>) -> Result<f64> {
        let row = sqlx::query(
            "SELECT AVG(volume)::float8 AS avg_vol FROM candles
             WHERE symbol_id = $1 AND time > $2",
        )
        .bind(symbol_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        let avg: Option<f64> = row.get("avg_vol");
        Ok(avg.unwrap_or(1.0))
    }

    pub async fn volume_since(&self, symbol_id: i32, since: DateTime<Utc>) -> Result<f64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(volume), 0)::float8 AS vol FROM candles
             WHERE symbol_id = $1 AND time > $2",
        )
        .bind(symbol_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("vol"))
    }

    // ── Volume profile & order flow ──

    /// Upsert every level of a bucket's profile in one transaction so a
    /// concurrent reader never observes a half-written recomputation.
    pub async fn upsert_profile_rows(
        &self,
        symbol_id: i32,
        bucket: DateTime<Utc>,
        profile: &VolumeProfile,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (&level, totals) in &profile.levels {
            sqlx::query(
                "INSERT INTO volume_profile
                     (bucket, symbol_id, price_level, total_volume, buy_volume, sell_volume, trade_count)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (bucket, symbol_id, price_level) DO UPDATE SET
                     total_volume = EXCLUDED.total_volume,
                     buy_volume = EXCLUDED.buy_volume,
                     sell_volume = EXCLUDED.sell_volume,
                     trade_count = EXCLUDED.trade_count",
            )
            .bind(bucket)
            .bind(symbol_id)
            .bind(crate::profile::dollars(level))
            .bind(totals.total)
            .bind(totals.buy)
            .bind(totals.sell)
            .bind(totals.count)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_profile_row(
        &self,
        symbol_id: i32,
        bucket: DateTime<Utc>,
        price_level: f64,
    ) -> Result<Option<(i64, i64, i64, i64)>> {
        let row = sqlx::query(
            "SELECT total_volume, buy_volume, sell_volume, trade_count FROM volume_profile
             WHERE bucket = $1 AND symbol_id = $2 AND price_level = $3",
        )
        .bind(bucket)
        .bind(symbol_id)
        .bind(price_level)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| {
            (
                r.get("total_volume"),
                r.get("buy_volume"),
                r.get("sell_volume"),
                r.get("trade_count"),
            )
        }))
    }

    pub async fn upsert_profile_metrics(
        &self,
        symbol_id: i32,
        metrics: &ProfileMetrics,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO profile_metrics
                 (bucket, symbol_id, poc, vah, val, total_volume, lvns, hvns)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (bucket, symbol_id) DO UPDATE SET
                 poc = EXCLUDED.poc, vah = EXCLUDED.vah, val = EXCLUDED.val,
                 total_volume = EXCLUDED.total_volume,
                 lvns = EXCLUDED.lvns, hvns = EXCLUDED.hvns",
        )
        .bind(metrics.bucket)
        .bind(symbol_id)
        .bind(metrics.poc)
        .bind(metrics.vah)
        .bind(metrics.val)
        .bind(metrics.total_volume)
        .bind(serde_json::json!(metrics.lvns))
        .bind(serde_json::json!(metrics.hvns))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_profile_metrics(&self, symbol_id: i32) -> Result<Option<ProfileMetrics>> {
        let row = sqlx::query(
            "SELECT bucket, poc, vah, val, total_volume, lvns, hvns FROM profile_metrics
             WHERE symbol_id = $1 ORDER BY bucket DESC LIMIT 1",
        )
        .bind(symbol_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ProfileMetrics {
            bucket: r.get("bucket"),
            poc: r.get("poc"),
            vah: r.get("vah"),
            val: r.get("val"),
            total_volume: r.get("total_volume"),
            lvns: parse_level_list(&r.get::<serde_json::Value, _>("lvns")),
            hvns: parse_level_list(&r.get::<serde_json::Value, _>("hvns")),
        }))
    }

    /// Union of LVNs across the latest `buckets` metric rows, deduplicated
    /// (to the cent) and sorted ascending.
    pub async fn recent_lvns(&self, symbol_id: i32, buckets: i64) -> Result<Vec<f64>> {
        let rows = sqlx::query(
            "SELECT lvns FROM profile_metrics
             WHERE symbol_id = $1 AND lvns <> '[]'::jsonb
             ORDER BY bucket DESC LIMIT $2",
        )
        .bind(symbol_id)
        .bind(buckets)
        .fetch_all(&self.pool)
        .await?;

        let mut cents: Vec<i64> = rows
            .iter()
            .flat_map(|r| parse_level_list(&r.get::<serde_json::Value, _>("lvns")))
            .map(crate::profile::cents)
            .collect();
        cents.sort_unstable();
        cents.dedup();
        Ok(cents.into_iter().map(crate::profile::dollars).collect())
    }

    pub async fn upsert_order_flow(&self, symbol_id: i32, flow: &OrderFlowRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO order_flow
                 (bucket, symbol_id, delta, cumulative_delta, aggressive_buys,
                  aggressive_sells, buy_pressure, sell_pressure)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (bucket, symbol_id) DO UPDATE SET
                 delta = EXCLUDED.delta,
                 cumulative_delta = EXCLUDED.cumulative_delta,
                 aggressive_buys = EXCLUDED.aggressive_buys,
                 aggressive_sells = EXCLUDED.aggressive_sells,
                 buy_pressure = EXCLUDED.buy_pressure,
                 sell_pressure = EXCLUDED.sell_pressure",
        )
        .bind(flow.bucket)
        .bind(symbol_id)
        .bind(flow.delta)
        .bind(flow.cumulative_delta)
        .bind(flow.aggressive_buys)
        .bind(flow.aggressive_sells)
        .bind(flow.buy_pressure)
        .bind(flow.sell_pressure)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_last_cvd(&self, symbol_id: i32, before: DateTime<Utc>) -> Result<i64> {
        let row = sqlx::query(
            "SELECT cumulative_delta FROM order_flow
             WHERE symbol_id = $1 AND bucket < $2
             ORDER BY bucket DESC LIMIT 1",
        )
        .bind(symbol_id)
        .bind(before)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("cumulative_delta")).unwrap_or(0))
    }

    fn flow_from_row(row: &sqlx::postgres::PgRow) -> OrderFlowRow {
        OrderFlowRow {
            bucket: row.get("bucket"),
            delta: row.get("delta"),
            cumulative_delta: row.get("cumulative_delta"),
            aggressive_buys: row.get("aggressive_buys"),
            aggressive_sells: row.get("aggressive_sells"),
            buy_pressure: row.get("buy_pressure"),
            sell_pressure: row.get("sell_pressure"),
        }
    }

    /// Latest `limit` flow rows, newest first.
    pub async fn recent_order_flow(&self, symbol_id: i32, limit: i64) -> Result<Vec<OrderFlowRow>> {
        let rows = sqlx::query(
            "SELECT bucket, delta, cumulative_delta, aggressive_buys, aggressive_sells,
                    buy_pressure, sell_pressure
             FROM order_flow WHERE symbol_id = $1 ORDER BY bucket DESC LIMIT $2",
        )
        .bind(symbol_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::flow_from_row).collect())
    }

    /// Flow rows since a cutoff, oldest first.
    pub async fn order_flow_window(
        &self,
        symbol_id: i32,
        since: DateTime<Utc>,
    ) -> Result<Vec<OrderFlowRow>> {
        let rows = sqlx::query(
            "SELECT bucket, delta, cumulative_delta, aggressive_buys, aggressive_sells,
                    buy_pressure, sell_pressure
             FROM order_flow WHERE symbol_id = $1 AND bucket > $2 ORDER BY bucket ASC",
        )
        .bind(symbol_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::flow_from_row).collect())
    }

    // ── Market state & signals ──

    pub async fn insert_market_state(&self, symbol_id: i32, row: &MarketStateRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO market_state
                 (time, symbol_id, state, confidence, balance_high, balance_low, poc)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(row.time)
        .bind(symbol_id)
        .bind(row.state.as_str())
        .bind(row.confidence)
        .bind(row.balance_high)
        .bind(row.balance_low)
        .bind(row.poc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_market_state(&self, symbol_id: i32) -> Result<Option<MarketStateRow>> {
        let row = sqlx::query(
            "SELECT time, state, confidence, balance_high, balance_low, poc FROM market_state
             WHERE symbol_id = $1 ORDER BY time DESC LIMIT 1",
        )
        .bind(symbol_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| MarketStateRow {
            time: r.get("time"),
            state: MarketState::parse(r.get("state")),
            confidence: r.get("confidence"),
            balance_high: r.get("balance_high"),
            balance_low: r.get("balance_low"),
            poc: r.get("poc"),
        }))
    }

    pub async fn append_signal(
        &self,
        symbol_id: i32,
        kind: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        sqlx::query("INSERT INTO signals (time, symbol_id, type, details) VALUES (now(), $1, $2, $3)")
            .bind(symbol_id)
            .bind(kind)
            .bind(details)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Backtest runs ──

    pub async fn create_backtest_run(
        &self,
        name: &str,
        strategy_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        symbols: &[String],
        parameters: serde_json::Value,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO backtest_runs
                 (name, strategy_name, start_date, end_date, symbols, parameters, status)
             VALUES ($1, $2, $3, $4, $5, $6, 'running')
             RETURNING id",
        )
        .bind(name)
        .bind(strategy_name)
        .bind(start)
        .bind(end)
        .bind(symbols)
        .bind(parameters)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn finish_backtest_run(
        &self,
        run_id: i64,
        total_trades: i32,
        win_rate: f64,
        total_pnl: f64,
        sharpe_ratio: f64,
        signals_generated: i32,
        signals_blocked: i32,
        blocked_percentage: f64,
        constraint_analysis: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE backtest_runs SET
                 status = 'completed', total_trades = $2, win_rate = $3, total_pnl = $4,
                 sharpe_ratio = $5, signals_generated = $6, signals_blocked = $7,
                 blocked_percentage = $8, constraint_analysis = $9, completed_at = now()
             WHERE id = $1",
        )
        .bind(run_id)
        .bind(total_trades)
        .bind(win_rate)
        .bind(total_pnl)
        .bind(sharpe_ratio)
        .bind(signals_generated)
        .bind(signals_blocked)
        .bind(blocked_percentage)
        .bind(constraint_analysis)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_trades(&self, run_id: i64, trades: &[TradeRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for t in trades {
            sqlx::query(
                "INSERT INTO backtest_trades
                     (run_id, symbol_id, direction, quantity, entry_time, entry_price,
                      entry_reason, exit_time, exit_price, exit_reason, pnl, pnl_pct,
                      stop_loss, take_profit, market_state, aggression_score, bars_held,
                      mae, mfe)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                         $13, $14, $15, $16, $17, $18, $19)",
            )
            .bind(run_id)
            .bind(t.symbol_id)
            .bind(t.direction.as_str())
            .bind(t.quantity)
            .bind(t.entry_time)
            .bind(t.entry_price)
            .bind(&t.entry_reason)
            .bind(t.exit_time)
            .bind(t.exit_price)
            .bind(&t.exit_reason)
            .bind(t.pnl)
            .bind(t.pnl_pct)
            .bind(t.stop_loss)
            .bind(t.take_profit)
            .bind(t.market_state.as_str())
            .bind(t.aggression_score)
            .bind(t.bars_held)
            .bind(t.mae)
            .bind(t.mfe)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn append_equity_points(&self, run_id: i64, points: &[EquityPoint]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for p in points {
            sqlx::query(
                "INSERT INTO backtest_equity
                     (run_id, time, equity, cash, positions_value, open_positions)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (run_id, time) DO UPDATE SET
                     equity = EXCLUDED.equity, cash = EXCLUDED.cash,
                     positions_value = EXCLUDED.positions_value,
                     open_positions = EXCLUDED.open_positions",
            )
            .bind(run_id)
            .bind(p.time)
            .bind(p.equity)
            .bind(p.cash)
            .bind(p.positions_value)
            .bind(p.open_positions as i32)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ── Binary markets ──

    pub async fn upsert_binary_market(&self, symbol_id: i32, market: &BinaryMarket) -> Result<()> {
        sqlx::query(
            "INSERT INTO binary_markets
                 (market_id, symbol_id, question, category, end_date,
                  yes_token_id, no_token_id, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (market_id) DO UPDATE SET
                 question = EXCLUDED.question, category = EXCLUDED.category,
                 end_date = EXCLUDED.end_date, yes_token_id = EXCLUDED.yes_token_id,
                 no_token_id = EXCLUDED.no_token_id, status = EXCLUDED.status",
        )
        .bind(&market.market_id)
        .bind(symbol_id)
        .bind(&market.question)
        .bind(&market.category)
        .bind(market.end_date)
        .bind(&market.yes_token_id)
        .bind(&market.no_token_id)
        .bind(if market.active { "active" } else { "closed" })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn active_binary_markets(&self) -> Result<Vec<BinaryMarket>> {
        let rows = sqlx::query(
            "SELECT bm.market_id, s.symbol, bm.question, bm.category, bm.end_date,
                    bm.yes_token_id, bm.no_token_id
             FROM binary_markets bm
             JOIN symbols s ON bm.symbol_id = s.id
             WHERE bm.status = 'active' AND bm.end_date > now()
             ORDER BY bm.end_date ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| BinaryMarket {
                market_id: r.get("market_id"),
                symbol: r.get("symbol"),
                question: r.get("question"),
                category: r.get("category"),
                end_date: r.get("end_date"),
                yes_token_id: r.get("yes_token_id"),
                no_token_id: r.get("no_token_id"),
                active: true,
            })
            .collect())
    }

    pub async fn upsert_binary_price(&self, symbol_id: i32, price: &BinaryPrice) -> Result<()> {
        sqlx::query(
            "INSERT INTO binary_prices
                 (timestamp, symbol_id, yes_bid, yes_ask, yes_mid,
                  no_bid, no_ask, no_mid, spread, arbitrage_opportunity, estimated_profit_pct)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (timestamp, symbol_id) DO UPDATE SET
                 yes_bid = EXCLUDED.yes_bid, yes_ask = EXCLUDED.yes_ask,
                 yes_mid = EXCLUDED.yes_mid, no_bid = EXCLUDED.no_bid,
                 no_ask = EXCLUDED.no_ask, no_mid = EXCLUDED.no_mid,
                 spread = EXCLUDED.spread,
                 arbitrage_opportunity = EXCLUDED.arbitrage_opportunity,
                 estimated_profit_pct = EXCLUDED.estimated_profit_pct",
        )
        .bind(price.timestamp)
        .bind(symbol_id)
        .bind(price.yes.bid)
        .bind(price.yes.ask)
        .bind(price.yes.mid())
        .bind(price.no.bid)
        .bind(price.no.ask)
        .bind(price.no.mid())
        .bind(price.spread)
        .bind(price.arbitrage)
        .bind(price.estimated_profit_pct)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_binary_spread(&self, symbol_id: i32) -> Result<Option<Decimal>> {
        let row = sqlx::query(
            "SELECT spread FROM binary_prices WHERE symbol_id = $1
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(symbol_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("spread")))
    }

    /// Fresh arbitrage flags at or above the profit floor, best first.
    pub async fn recent_opportunities(
        &self,
        min_profit_pct: Decimal,
        since: DateTime<Utc>,
    ) -> Result<Vec<ArbOpportunity>> {
        let rows = sqlx::query(
            "SELECT s.symbol, s.id AS symbol_id, bm.market_id, bm.question, bm.end_date,
                    bp.yes_ask, bp.no_ask, bp.spread, bp.estimated_profit_pct
             FROM binary_prices bp
             JOIN symbols s ON bp.symbol_id = s.id
             JOIN binary_markets bm ON bm.symbol_id = s.id
             WHERE bp.arbitrage_opportunity = true
               AND bm.status = 'active'
               AND bp.timestamp > $2
               AND bp.estimated_profit_pct >= $1
             ORDER BY bp.estimated_profit_pct DESC
             LIMIT 20",
        )
        .bind(min_profit_pct)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| ArbOpportunity {
                symbol: r.get("symbol"),
                symbol_id: r.get("symbol_id"),
                market_id: r.get("market_id"),
                question: r.get("question"),
                yes_ask: r.get("yes_ask"),
                no_ask: r.get("no_ask"),
                spread: r.get("spread"),
                estimated_profit_pct: r.get("estimated_profit_pct"),
                end_date: r.get("end_date"),
            })
            .collect())
    }

    pub async fn open_binary_exposure(&self) -> Result<Decimal> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(yes_qty * yes_entry_price + no_qty * no_entry_price), 0) AS exposure
             FROM binary_positions WHERE status = 'open'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("exposure"))
    }

    pub async fn has_open_binary_position(&self, market_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM binary_positions WHERE market_id = $1 AND status = 'open'",
        )
        .bind(market_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_binary_position(
        &self,
        symbol_id: i32,
        market_id: &str,
        yes_qty: Decimal,
        no_qty: Decimal,
        yes_entry: Decimal,
        no_entry: Decimal,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO binary_positions
                 (symbol_id, market_id, yes_qty, no_qty, yes_entry_price,
                  no_entry_price, entry_spread, status, opened_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'open', now())
             RETURNING id",
        )
        .bind(symbol_id)
        .bind(market_id)
        .bind(yes_qty)
        .bind(no_qty)
        .bind(yes_entry)
        .bind(no_entry)
        .bind(yes_entry + no_entry)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("id"))
    }

    pub async fn open_binary_positions(&self) -> Result<Vec<BinaryPosition>> {
        let rows = sqlx::query(
            "SELECT bp.id, s.symbol, bp.market_id, bp.yes_qty, bp.no_qty,
                    bp.yes_entry_price, bp.no_entry_price, bp.entry_spread,
                    bp.opened_at, bm.end_date
             FROM binary_positions bp
             JOIN symbols s ON bp.symbol_id = s.id
             LEFT JOIN binary_markets bm ON bp.market_id = bm.market_id
             WHERE bp.status = 'open'
             ORDER BY bp.opened_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| BinaryPosition {
                id: r.get("id"),
                symbol: r.get("symbol"),
                market_id: r.get("market_id"),
                yes_qty: r.get("yes_qty"),
                no_qty: r.get("no_qty"),
                yes_entry: r.get("yes_entry_price"),
                no_entry: r.get("no_entry_price"),
                entry_spread: r.get("entry_spread"),
                opened_at: r.get("opened_at"),
                end_date: r.get("end_date"),
            })
            .collect())
    }

    pub async fn close_binary_position(&self, position_id: i64, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE binary_positions SET status = 'closed', exit_reason = $2, closed_at = now()
             WHERE id = $1",
        )
        .bind(position_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn binary_market_tokens(&self, market_id: &str) -> Result<Option<(String, String)>> {
        let row = sqlx::query(
            "SELECT yes_token_id, no_token_id FROM binary_markets WHERE market_id = $1",
        )
        .bind(market_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| (r.get("yes_token_id"), r.get("no_token_id"))))
    }

    pub async fn latest_binary_quotes(
        &self,
        symbol_id: i32,
    ) -> Result<Option<(crate::types::BinaryQuote, crate::types::BinaryQuote)>> {
        let row = sqlx::query(
            "SELECT yes_bid, yes_ask, no_bid, no_ask FROM binary_prices
             WHERE symbol_id = $1 ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(symbol_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| {
            (
                crate::types::BinaryQuote { bid: r.get("yes_bid"), ask: r.get("yes_ask") },
                crate::types::BinaryQuote { bid: r.get("no_bid"), ask: r.get("no_ask") },
            )
        }))
    }

    pub async fn symbol_id_for_binary_market(&self, market_id: &str) -> Result<Option<i32>> {
        let row = sqlx::query("SELECT symbol_id FROM binary_markets WHERE market_id = $1")
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("symbol_id")))
    }
}
