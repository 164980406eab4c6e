//! Backtest CLI.
//!
//! Replays stored candle history through the shared strategy and portfolio,
//! persists the run, and prints a summary report.
//!
//! Exit codes: 0 success, 1 usage error, 2 runtime error.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::Parser;
use tracing::error;

use auction_flow::backtest::engine::{run_backtest, BacktestMode, BacktestParams};
use auction_flow::config::{Config, StrategyConfig};
use auction_flow::store::Store;

#[derive(Parser, Debug)]
#[command(name = "backtest", about = "Auction-market strategy backtest engine")]
struct Cli {
    /// Comma-separated list of symbols (e.g. AAPL,MSFT,GOOGL)
    #[arg(long)]
    symbols: Option<String>,

    /// Test all symbols known to the store
    #[arg(long)]
    all_symbols: bool,

    /// Run a single-symbol isolation test
    #[arg(long)]
    individual: Option<String>,

    /// Disable position and cash limits (signal-ceiling measurement)
    #[arg(long)]
    unlimited: bool,

    /// Start date (YYYY-MM-DD)
    #[arg(long)]
    start: Option<String>,

    /// End date (YYYY-MM-DD)
    #[arg(long)]
    end: Option<String>,

    /// Alternative to --start/--end: look back N years from now
    #[arg(long)]
    years: Option<f64>,

    #[arg(long, default_value_t = 100_000.0)]
    initial_capital: f64,

    #[arg(long, default_value_t = 3)]
    max_positions: u32,

    /// Risk per trade, percent of capital
    #[arg(long, default_value_t = 1.0)]
    risk_per_trade: f64,

    /// Export the full report as JSON
    #[arg(long)]
    export: Option<std::path::PathBuf>,
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(DateTime::from_naive_utc_and_offset(date.and_hms_opt(0, 0, 0)?, Utc))
}

fn usage_error(msg: &str) -> ! {
    eprintln!("error: {msg}");
    eprintln!("usage: backtest --symbols CSV | --all-symbols | --individual SYM [--unlimited]");
    eprintln!("                --start YYYY-MM-DD --end YYYY-MM-DD | --years N");
    eprintln!("                [--initial-capital N] [--max-positions N] [--risk-per-trade PCT]");
    eprintln!("                [--export PATH]");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Date range
    let (start, end) = match (&cli.start, &cli.end, cli.years) {
        (Some(start), Some(end), _) => {
            let Some(start) = parse_date(start) else { usage_error("invalid --start date") };
            let Some(end) = parse_date(end) else { usage_error("invalid --end date") };
            if start >= end {
                usage_error("--start must precede --end");
            }
            (start, end)
        }
        (None, None, Some(years)) => {
            let end = Utc::now();
            let start = end - Duration::days((years * 365.25) as i64);
            (start, end)
        }
        _ => usage_error("specify --years or both --start and --end"),
    };

    // Mode and symbol selection (symbols may need the store for --all-symbols)
    let mode = if cli.individual.is_some() {
        BacktestMode::Individual
    } else if cli.unlimited {
        BacktestMode::Unlimited
    } else {
        BacktestMode::Portfolio
    };
    if cli.individual.is_none() && !cli.all_symbols && cli.symbols.is_none() {
        usage_error("specify --symbols, --individual, or --all-symbols");
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(2);
        }
    };
    let store = match Store::connect(&config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            error!("store connection failed: {e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = store.ensure_schema().await {
        error!("store schema mismatch: {e}");
        std::process::exit(2);
    }

    let symbols: Vec<String> = if let Some(symbol) = &cli.individual {
        vec![symbol.clone()]
    } else if cli.all_symbols {
        match store.all_symbols().await {
            Ok(rows) => rows.into_iter().map(|(_, s)| s).collect(),
            Err(e) => {
                error!("symbol listing failed: {e}");
                std::process::exit(2);
            }
        }
    } else {
        cli.symbols
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    };
    if symbols.is_empty() {
        usage_error("no symbols selected");
    }

    let params = BacktestParams {
        strategy: StrategyConfig {
            initial_capital: cli.initial_capital,
            max_positions: cli.max_positions,
            risk_per_trade_pct: cli.risk_per_trade,
            ..config.strategy
        },
        detector: config.detector,
        mode,
    };

    let (run_id, report) = match run_backtest(&store, &symbols, start, end, &params).await {
        Ok(result) => result,
        Err(e) => {
            error!("backtest failed: {e}");
            std::process::exit(2);
        }
    };

    print_summary(run_id, &report);

    if let Some(path) = &cli.export {
        match serde_json::to_string_pretty(&report) {
            Ok(body) => {
                if let Err(e) = std::fs::write(path, body) {
                    error!("export failed: {e}");
                    std::process::exit(2);
                }
                println!("Results exported to {}", path.display());
            }
            Err(e) => {
                error!("export serialization failed: {e}");
                std::process::exit(2);
            }
        }
    }
}

fn print_summary(run_id: i64, report: &serde_json::Value) {
    let summary = &report["summary"];
    let constraints = &report["constraint_analysis"];

    println!("─── BACKTEST RESULTS (run {run_id}) ───────────────────────────");
    println!("  Mode             {}", report["parameters"]["mode"].as_str().unwrap_or("?"));
    println!("  Period           {} → {}",
        report["start"].as_str().unwrap_or("?"),
        report["end"].as_str().unwrap_or("?"));
    println!("  Total Trades     {}", summary["total_trades"]);
    println!(
        "  Win Rate         {:.1}% ({}/{})",
        summary["win_rate"].as_f64().unwrap_or(0.0),
        summary["winning_trades"],
        summary["total_trades"]
    );
    println!("  Total PnL        ${:+.2}", summary["total_pnl"].as_f64().unwrap_or(0.0));
    println!("  PnL %            {:+.2}%", summary["total_pnl_pct"].as_f64().unwrap_or(0.0));
    println!("  Avg Win          ${:.2}", summary["avg_win"].as_f64().unwrap_or(0.0));
    println!("  Avg Loss         ${:.2}", summary["avg_loss"].as_f64().unwrap_or(0.0));
    println!("  Largest Win      ${:.2}", summary["largest_win"].as_f64().unwrap_or(0.0));
    println!("  Largest Loss     ${:.2}", summary["largest_loss"].as_f64().unwrap_or(0.0));
    println!("  Sharpe Ratio     {:.2}", summary["sharpe_ratio"].as_f64().unwrap_or(0.0));
    println!(
        "  Signals          {} generated, {} blocked ({:.1}%)",
        constraints["signals_generated"],
        constraints["signals_blocked"],
        constraints["blocked_percentage"].as_f64().unwrap_or(0.0)
    );
}
