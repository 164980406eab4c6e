use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

// ─── Market data records ───

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tick {
    pub time: DateTime<Utc>,
    pub price: f64,
    pub size: i64,
    pub venue: String,
}

/// Normalized output of every ingestion provider.
#[derive(Clone, Debug)]
pub enum NormalizedRecord {
    Candle { symbol: String, candle: Candle },
    Tick { symbol: String, tick: Tick },
}

// ─── Profile & order flow ───

#[derive(Clone, Debug, PartialEq)]
pub struct ProfileMetrics {
    pub bucket: DateTime<Utc>,
    pub poc: f64,
    pub vah: f64,
    pub val: f64,
    pub total_volume: i64,
    pub lvns: Vec<f64>,
    pub hvns: Vec<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OrderFlowRow {
    pub bucket: DateTime<Utc>,
    pub delta: i64,
    pub cumulative_delta: i64,
    pub aggressive_buys: i64,
    pub aggressive_sells: i64,
    pub buy_pressure: f64,
    pub sell_pressure: f64,
}

// ─── Market state ───

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarketState {
    Balance,
    ImbalanceUp,
    ImbalanceDown,
    Unknown,
}

impl MarketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketState::Balance => "BALANCE",
            MarketState::ImbalanceUp => "IMBALANCE_UP",
            MarketState::ImbalanceDown => "IMBALANCE_DOWN",
            MarketState::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "BALANCE" => MarketState::Balance,
            "IMBALANCE_UP" => MarketState::ImbalanceUp,
            "IMBALANCE_DOWN" => MarketState::ImbalanceDown,
            _ => MarketState::Unknown,
        }
    }

    pub fn is_imbalance(&self) -> bool {
        matches!(self, MarketState::ImbalanceUp | MarketState::ImbalanceDown)
    }
}

impl std::fmt::Display for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MarketStateRow {
    pub time: DateTime<Utc>,
    pub state: MarketState,
    pub confidence: i32,
    pub balance_high: Option<f64>,
    pub balance_low: Option<f64>,
    pub poc: Option<f64>,
}

// ─── Flow direction & aggression ───

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowDirection {
    Buy,
    Sell,
    Neutral,
}

impl FlowDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowDirection::Buy => "BUY",
            FlowDirection::Sell => "SELL",
            FlowDirection::Neutral => "NEUTRAL",
        }
    }
}

impl std::fmt::Display for FlowDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the aggressive-flow indicator.
#[derive(Clone, Debug, PartialEq)]
pub struct Aggression {
    pub score: i32,
    pub direction: FlowDirection,
    pub volume_spike: bool,
    pub volume_ratio: f64,
    pub cvd_momentum: i64,
    pub buy_pressure: f64,
    pub sell_pressure: f64,
    pub is_aggressive: bool,
}

impl Aggression {
    pub fn neutral() -> Self {
        Self {
            score: 0,
            direction: FlowDirection::Neutral,
            volume_spike: false,
            volume_ratio: 1.0,
            cvd_momentum: 0,
            buy_pressure: 50.0,
            sell_pressure: 50.0,
            is_aggressive: false,
        }
    }
}

// ─── Trading ───

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry signal emitted by the auction-market strategy.
///
/// Context fields beyond (side, entry, stop, target) exist for audit: they
/// are written into trade records and the signals log verbatim.
#[derive(Clone, Debug, PartialEq)]
pub struct EntrySignal {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub atr: f64,
    pub market_state: MarketState,
    pub confidence: i32,
    pub aggression_score: i32,
    pub flow_direction: FlowDirection,
    pub buy_pressure: f64,
    pub sell_pressure: f64,
    pub cvd_momentum: i64,
    pub reason: String,
}

// ─── Backtest records ───

/// A closed trade. Appended to the run's trade log, never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct TradeRecord {
    pub symbol: String,
    pub symbol_id: i32,
    pub direction: Side,
    pub quantity: i64,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub entry_reason: String,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_reason: String,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub market_state: MarketState,
    pub aggression_score: i32,
    pub bars_held: i64,
    pub duration_minutes: i64,
    pub mae: f64,
    pub mfe: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub equity: f64,
    pub cash: f64,
    pub positions_value: f64,
    pub open_positions: u32,
}

// ─── Arbitrage scan output ───

#[derive(Clone, Debug)]
pub struct ArbOpportunity {
    pub symbol: String,
    pub symbol_id: i32,
    pub market_id: String,
    pub question: String,
    pub yes_ask: Decimal,
    pub no_ask: Decimal,
    pub spread: Decimal,
    pub estimated_profit_pct: Decimal,
    pub end_date: DateTime<Utc>,
}

// ─── Broker wire shapes (consumed contract, §6) ───

fn f64_from_string<'de, D: Deserializer<'de>>(de: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
    }
    match NumOrStr::deserialize(de)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn i64_from_string<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(i64),
        Str(String),
    }
    match NumOrStr::deserialize(de)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Account {
    #[serde(deserialize_with = "f64_from_string")]
    pub portfolio_value: f64,
    #[serde(deserialize_with = "f64_from_string")]
    pub equity: f64,
    #[serde(deserialize_with = "f64_from_string")]
    pub last_equity: f64,
    #[serde(deserialize_with = "f64_from_string")]
    pub buying_power: f64,
    #[serde(deserialize_with = "f64_from_string")]
    pub cash: f64,
    #[serde(default)]
    pub account_blocked: bool,
    #[serde(default)]
    pub trading_blocked: bool,
}

impl Account {
    /// Day-over-day PnL percent versus the prior session's closing equity.
    pub fn daily_pnl_pct(&self) -> f64 {
        if self.last_equity > 0.0 {
            (self.equity - self.last_equity) / self.last_equity * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    #[serde(deserialize_with = "i64_from_string")]
    pub qty: i64,
    #[serde(deserialize_with = "f64_from_string")]
    pub avg_entry_price: f64,
    #[serde(deserialize_with = "f64_from_string")]
    pub current_price: f64,
    #[serde(deserialize_with = "f64_from_string")]
    pub unrealized_pl: f64,
    #[serde(deserialize_with = "f64_from_string")]
    pub unrealized_plpc: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerOrder {
    pub id: String,
    pub symbol: String,
    pub side: String,
    #[serde(deserialize_with = "i64_from_string")]
    pub qty: i64,
    #[serde(rename = "type")]
    pub order_type: String,
    pub status: String,
}

// ─── Binary markets (arbitrage engine) ───

#[derive(Clone, Debug, PartialEq)]
pub struct BinaryMarket {
    pub market_id: String,
    pub symbol: String,
    pub question: String,
    pub category: String,
    pub end_date: DateTime<Utc>,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BinaryQuote {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl BinaryQuote {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// One fused YES/NO price row, keyed by (timestamp, symbol).
#[derive(Clone, Debug, PartialEq)]
pub struct BinaryPrice {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub yes: BinaryQuote,
    pub no: BinaryQuote,
    pub spread: Decimal,
    pub arbitrage: bool,
    pub estimated_profit_pct: Decimal,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BinaryPosition {
    pub id: i64,
    pub symbol: String,
    pub market_id: String,
    pub yes_qty: Decimal,
    pub no_qty: Decimal,
    pub yes_entry: Decimal,
    pub no_entry: Decimal,
    pub entry_spread: Decimal,
    pub opened_at: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

impl BinaryPosition {
    /// Profit locked in at entry: min-qty payout at resolution minus total cost.
    pub fn locked_profit(&self) -> Decimal {
        let payout = self.yes_qty.min(self.no_qty);
        let cost = self.yes_qty * self.yes_entry + self.no_qty * self.no_entry;
        payout - cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    /// Scenario: round-trip MarketState through its string form.
    /// Expected: every variant parses back to itself; junk parses to Unknown.
    #[test]
    fn test_market_state_roundtrip() {
        for s in [
            MarketState::Balance,
            MarketState::ImbalanceUp,
            MarketState::ImbalanceDown,
            MarketState::Unknown,
        ] {
            assert_eq!(MarketState::parse(s.as_str()), s);
        }
        assert_eq!(MarketState::parse("garbage"), MarketState::Unknown);
    }

    /// Scenario: broker account JSON with string-typed numeric fields.
    /// Expected: fields parse to f64; daily PnL percent computes from equity delta.
    #[test]
    fn test_account_parses_string_numbers() {
        let json = r#"{
            "portfolio_value": "100000",
            "equity": "101000",
            "last_equity": "100000",
            "buying_power": "200000.5",
            "cash": "50000",
            "account_blocked": false,
            "trading_blocked": false
        }"#;
        let account: Account = serde_json::from_str(json).unwrap();
        assert!((account.portfolio_value - 100_000.0).abs() < 1e-10);
        assert!((account.buying_power - 200_000.5).abs() < 1e-10);
        assert!((account.daily_pnl_pct() - 1.0).abs() < 1e-10);
    }

    /// Scenario: account with zero last_equity (fresh account).
    /// Expected: daily_pnl_pct returns 0 instead of dividing by zero.
    #[test]
    fn test_account_daily_pnl_zero_last_equity() {
        let json = r#"{
            "portfolio_value": 0,
            "equity": 0,
            "last_equity": 0,
            "buying_power": 0,
            "cash": 0
        }"#;
        let account: Account = serde_json::from_str(json).unwrap();
        assert_eq!(account.daily_pnl_pct(), 0.0);
    }

    /// Scenario: position with 100 YES @ 0.49 and 100 NO @ 0.48.
    /// Expected: locked profit = 100·1.00 − (49 + 48) = 3.00.
    #[test]
    fn test_locked_profit() {
        let pos = BinaryPosition {
            id: 1,
            symbol: "PRES2028-DEM".into(),
            market_id: "0xabc".into(),
            yes_qty: dec!(100),
            no_qty: dec!(100),
            yes_entry: dec!(0.49),
            no_entry: dec!(0.48),
            entry_spread: dec!(0.97),
            opened_at: Utc::now(),
            end_date: None,
        };
        assert_eq!(pos.locked_profit(), dec!(3.00));
    }

    /// Scenario: lopsided fills, 100 YES vs 50 NO.
    /// Expected: payout uses min(yes_qty, no_qty); cost uses both legs.
    #[test]
    fn test_locked_profit_lopsided() {
        let pos = BinaryPosition {
            id: 2,
            symbol: "X".into(),
            market_id: "m".into(),
            yes_qty: dec!(100),
            no_qty: dec!(50),
            yes_entry: dec!(0.40),
            no_entry: dec!(0.50),
            entry_spread: dec!(0.90),
            opened_at: Utc::now(),
            end_date: None,
        };
        // payout 50, cost 40 + 25 = 65 → -15
        assert_eq!(pos.locked_profit(), dec!(-15.00));
    }

    /// Scenario: quote with bid 0.48 and ask 0.52.
    /// Expected: mid is 0.50 exactly (decimal arithmetic, no float drift).
    #[test]
    fn test_binary_quote_mid() {
        let q = BinaryQuote { bid: dec!(0.48), ask: dec!(0.52) };
        assert_eq!(q.mid(), dec!(0.50));
    }
}
