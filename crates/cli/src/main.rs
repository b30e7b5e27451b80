use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{BookArgs, CandlesArgs, InitDbArgs, SnapshotArgs, TradesArgs, WatchArgs};

#[derive(Parser, Debug)]
#[command(name = "market-data")]
#[command(about = "Cache-first market data for Hyperliquid", long_about = None)]
struct Cli {
    /// Config file path (defaults to config/Config.toml plus MDP_* env overrides)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Optional log file path (logs to file instead of stderr)
    #[arg(long, global = true)]
    log_file: Option<String>,

    /// Keep candles in memory even when the database is enabled
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch candles for a range, serving from cache where possible
    Candles(CandlesArgs),
    /// Latest ticker for a symbol
    Ticker(SnapshotArgs),
    /// Order book snapshot for a symbol
    Book(BookArgs),
    /// Recent trades for a symbol
    Trades(TradesArgs),
    /// Repeatedly request a snapshot and report channel routing
    Watch(WatchArgs),
    /// Create the candle table in PostgreSQL
    InitDb(InitDbArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    let options = commands::GlobalOptions {
        config: cli.config,
        memory: cli.memory,
    };

    match cli.command {
        Commands::Candles(args) => commands::run_candles(&options, args).await,
        Commands::Ticker(args) => commands::run_ticker(&options, args).await,
        Commands::Book(args) => commands::run_book(&options, args).await,
        Commands::Trades(args) => commands::run_trades(&options, args).await,
        Commands::Watch(args) => commands::run_watch(&options, args).await,
        Commands::InitDb(args) => commands::run_init_db(&options, args).await,
    }
}

/// Logs go to stderr so stdout stays clean JSON.
fn init_logging(log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_data_core::Timeframe;

    #[test]
    fn test_candles_arguments_parse() {
        let cli = Cli::try_parse_from([
            "market-data",
            "--memory",
            "candles",
            "--symbol",
            "BTC",
            "--interval",
            "5m",
            "--start",
            "2025-01-01T00:00:00Z",
            "--priority",
            "critical",
        ])
        .unwrap();

        assert!(cli.memory);
        let Commands::Candles(args) = cli.command else {
            panic!("expected candles command");
        };
        assert_eq!(args.symbol, "BTC");
        assert_eq!(args.interval, Timeframe::FiveMinutes);
        assert!(args.end.is_none());
        assert!(args.request.options().priority.is_critical());
    }

    #[test]
    fn test_unknown_interval_rejected() {
        let result = Cli::try_parse_from([
            "market-data",
            "candles",
            "--symbol",
            "BTC",
            "--interval",
            "7m",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "market-data",
            "watch",
            "--symbol",
            "ETH",
            "--kind",
            "book",
            "--count",
            "5",
            "--config",
            "config/Config.toml",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("config/Config.toml")));
        let Commands::Watch(args) = cli.command else {
            panic!("expected watch command");
        };
        assert_eq!(args.count, 5);
        assert_eq!(args.kind, commands::WatchKind::Book);
    }
}
