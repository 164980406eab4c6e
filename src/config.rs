fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

/// Strategy parameter bundle, shared by the live auto-trader and the backtester.
#[derive(Clone, Copy, Debug)]
pub struct StrategyConfig {
    pub min_aggression_score: i32,
    pub atr_stop_multiplier: f64,
    pub atr_target_multiplier: f64,
    pub risk_per_trade_pct: f64,
    pub max_positions: u32,
    pub initial_capital: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_aggression_score: 70,
            atr_stop_multiplier: 1.5,
            atr_target_multiplier: 3.0,
            risk_per_trade_pct: 1.0,
            max_positions: 3,
            initial_capital: 100_000.0,
        }
    }
}

/// Market-state detector thresholds.
#[derive(Clone, Copy, Debug)]
pub struct DetectorConfig {
    /// Percent distance from POC below which the market reads as BALANCE.
    pub poc_distance_threshold: f64,
    pub momentum_threshold: f64,
    pub cvd_pressure_threshold: f64,
    /// Candle lookback for momentum, in minutes.
    pub lookback_period: i64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poc_distance_threshold: 1.5,
            momentum_threshold: 1.5,
            cvd_pressure_threshold: 15.0,
            lookback_period: 60,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OrderMonitorConfig {
    pub max_order_age_minutes: i64,
    pub max_slippage_pct: f64,
}

impl Default for OrderMonitorConfig {
    fn default() -> Self {
        Self { max_order_age_minutes: 5, max_slippage_pct: 1.0 }
    }
}

#[derive(Clone, Debug)]
pub struct ArbitrageConfig {
    pub spread_threshold: f64,
    /// Minimum estimated profit in percent (e.g. 0.5 = 0.5%).
    pub min_profit_pct: f64,
    pub max_position_size: f64,
    pub max_total_exposure: f64,
    pub fee_rate: f64,
    pub ws_url: String,
    pub markets_api_url: String,
    pub order_api_url: String,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            spread_threshold: 0.995,
            min_profit_pct: 0.5,
            max_position_size: 100.0,
            max_total_exposure: 400.0,
            fee_rate: 0.0,
            ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".into(),
            markets_api_url: "https://gamma-api.polymarket.com".into(),
            order_api_url: "https://clob.polymarket.com".into(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RiskConfig {
    pub max_daily_loss_pct: f64,
    pub min_account_balance: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self { max_daily_loss_pct: 3.0, min_account_balance: 1000.0 }
    }
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub api_url: String,
    pub api_key: String,
    pub secret_key: String,
}

/// Top-level configuration, loaded once at startup from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub symbols: Vec<String>,
    pub auto_trading_enabled: bool,
    pub dry_run: bool,

    pub strategy: StrategyConfig,
    pub detector: DetectorConfig,
    pub order_monitor: OrderMonitorConfig,
    pub arbitrage: ArbitrageConfig,
    pub risk: RiskConfig,
    pub broker: BrokerConfig,

    // Ingestion providers
    pub stream_ws_url: String,
    pub poll_api_url: String,
    pub poll_api_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables. A missing DATABASE_URL
    /// is fatal at startup; everything else falls back to a default.
    pub fn from_env() -> crate::error::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| crate::error::Error::Config("DATABASE_URL not set".into()))?;

        let symbols: Vec<String> = env_str("SYMBOLS", "AAPL,MSFT")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url,
            symbols,
            auto_trading_enabled: env_bool("AUTO_TRADING_ENABLED", false),
            dry_run: env_bool("DRY_RUN", true),
            strategy: StrategyConfig {
                min_aggression_score: env_i64("MIN_AGGRESSION_SCORE", 70) as i32,
                atr_stop_multiplier: env_f64("ATR_STOP_MULTIPLIER", 1.5),
                atr_target_multiplier: env_f64("ATR_TARGET_MULTIPLIER", 3.0),
                risk_per_trade_pct: env_f64("RISK_PER_TRADE_PCT", 1.0),
                max_positions: env_u32("MAX_POSITIONS", 3),
                initial_capital: env_f64("INITIAL_CAPITAL", 100_000.0),
            },
            detector: DetectorConfig {
                poc_distance_threshold: env_f64("POC_DISTANCE_THRESHOLD", 1.5),
                momentum_threshold: env_f64("MOMENTUM_THRESHOLD", 1.5),
                cvd_pressure_threshold: env_f64("CVD_PRESSURE_THRESHOLD", 15.0),
                lookback_period: env_i64("LOOKBACK_PERIOD", 60),
            },
            order_monitor: OrderMonitorConfig {
                max_order_age_minutes: env_i64("MAX_ORDER_AGE_MINUTES", 5),
                max_slippage_pct: env_f64("MAX_SLIPPAGE_PCT", 1.0),
            },
            arbitrage: ArbitrageConfig {
                spread_threshold: env_f64("SPREAD_THRESHOLD", 0.995),
                min_profit_pct: env_f64("MIN_PROFIT_PCT", 0.5),
                max_position_size: env_f64("MAX_POSITION_SIZE", 100.0),
                max_total_exposure: env_f64("MAX_TOTAL_EXPOSURE", 400.0),
                fee_rate: env_f64("FEE_RATE", 0.0),
                ws_url: env_str(
                    "CLOB_WS_URL",
                    "wss://ws-subscriptions-clob.polymarket.com/ws/market",
                ),
                markets_api_url: env_str("MARKETS_API_URL", "https://gamma-api.polymarket.com"),
                order_api_url: env_str("BINARY_ORDER_API_URL", "https://clob.polymarket.com"),
            },
            risk: RiskConfig {
                max_daily_loss_pct: env_f64("MAX_DAILY_LOSS_PCT", 3.0),
                min_account_balance: env_f64("MIN_ACCOUNT_BALANCE", 1000.0),
            },
            broker: BrokerConfig {
                api_url: env_str("BROKER_API_URL", "https://paper-api.alpaca.markets"),
                api_key: env_str("BROKER_API_KEY", ""),
                secret_key: env_str("BROKER_SECRET_KEY", ""),
            },
            stream_ws_url: env_str("STREAM_WS_URL", "wss://stream.data.alpaca.markets/v2/iex"),
            poll_api_url: env_str("POLL_API_URL", "https://www.alphavantage.co"),
            poll_api_key: std::env::var("POLL_API_KEY").ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: defaults with no environment overrides.
    /// Expected: every bundle carries the documented default values.
    #[test]
    fn test_defaults() {
        let s = StrategyConfig::default();
        assert_eq!(s.min_aggression_score, 70);
        assert!((s.atr_stop_multiplier - 1.5).abs() < 1e-10);
        assert!((s.atr_target_multiplier - 3.0).abs() < 1e-10);
        assert_eq!(s.max_positions, 3);

        let d = DetectorConfig::default();
        assert!((d.poc_distance_threshold - 1.5).abs() < 1e-10);
        assert!((d.cvd_pressure_threshold - 15.0).abs() < 1e-10);
        assert_eq!(d.lookback_period, 60);

        let m = OrderMonitorConfig::default();
        assert_eq!(m.max_order_age_minutes, 5);
        assert!((m.max_slippage_pct - 1.0).abs() < 1e-10);

        let a = ArbitrageConfig::default();
        assert!((a.spread_threshold - 0.995).abs() < 1e-10);
        assert!((a.fee_rate - 0.0).abs() < 1e-10);

        let r = RiskConfig::default();
        assert!((r.max_daily_loss_pct - 3.0).abs() < 1e-10);
        assert!((r.min_account_balance - 1000.0).abs() < 1e-10);
    }

    /// Scenario: env_bool sees "1", "true", "TRUE", "0", and absence.
    /// Expected: truthy forms parse true, "0" parses false, absence uses default.
    #[test]
    fn test_env_bool_forms() {
        std::env::set_var("AF_TEST_BOOL", "1");
        assert!(env_bool("AF_TEST_BOOL", false));
        std::env::set_var("AF_TEST_BOOL", "TRUE");
        assert!(env_bool("AF_TEST_BOOL", false));
        std::env::set_var("AF_TEST_BOOL", "0");
        assert!(!env_bool("AF_TEST_BOOL", true));
        std::env::remove_var("AF_TEST_BOOL");
        assert!(env_bool("AF_TEST_BOOL", true));
    }

    /// Scenario: numeric env var holds garbage.
    /// Expected: parser falls back to the default rather than failing startup.
    #[test]
    fn test_env_f64_garbage_falls_back() {
        std::env::set_var("AF_TEST_F64", "not-a-number");
        assert!((env_f64("AF_TEST_F64", 2.5) - 2.5).abs() < 1e-10);
        std::env::remove_var("AF_TEST_F64");
    }
}
