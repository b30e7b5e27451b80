//! Candles CLI command.
//!
//! Requests a range through the provider, prints the response metadata and
//! optionally writes the candles to CSV.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use market_data_core::{time_utils, Timeframe};
use market_data_store::CsvStorage;
use serde_json::json;

use super::{build_provider, print_json, GlobalOptions, RequestArgs};

/// Arguments for the candles command.
#[derive(Args, Debug, Clone)]
pub struct CandlesArgs {
    /// Symbol/coin to fetch (e.g., "BTC", "ETH")
    #[arg(long)]
    pub symbol: String,

    /// Candle interval (1m, 5m, 15m, 1h, 4h, 1d, etc.)
    #[arg(long, default_value = "1m")]
    pub interval: Timeframe,

    /// Start time in ISO 8601 format (defaults to `count` candles before end)
    #[arg(long)]
    pub start: Option<String>,

    /// End time in ISO 8601 format (defaults to now)
    #[arg(long)]
    pub end: Option<String>,

    /// Number of candles when no start is given
    #[arg(long, default_value_t = 100)]
    pub count: usize,

    /// Output CSV file path
    #[arg(short, long)]
    pub output: Option<String>,

    /// Print only the response metadata
    #[arg(long)]
    pub summary: bool,

    #[command(flatten)]
    pub request: RequestArgs,
}

impl CandlesArgs {
    /// # Errors
    /// Returns an error if a timestamp is not valid ISO 8601.
    pub fn resolve_range(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let end = match &self.end {
            Some(s) => parse_time(s, "end")?,
            None => now,
        };
        let start = match &self.start {
            Some(s) => parse_time(s, "start")?,
            None => {
                let back = i64::try_from(self.count.max(1) - 1).context("count too large")?;
                time_utils::step(time_utils::align_to_boundary(end, self.interval), self.interval, -back)
            }
        };
        Ok((start, end))
    }
}

fn parse_time(value: &str, which: &str) -> Result<DateTime<Utc>> {
    value
        .parse()
        .with_context(|| format!("Invalid {which} time. Use ISO 8601 format (e.g., 2025-01-01T00:00:00Z)"))
}

/// Runs the candles command.
///
/// # Errors
/// Returns an error if the provider cannot be built, the request fails or the
/// CSV file cannot be written.
pub async fn run_candles(options: &GlobalOptions, args: CandlesArgs) -> Result<()> {
    let (start, end) = args.resolve_range(Utc::now())?;
    let provider = build_provider(options).await?;

    tracing::info!(
        symbol = %args.symbol,
        interval = %args.interval,
        %start,
        %end,
        "Requesting candles"
    );

    let response = provider
        .get_candles(&args.symbol, args.interval, start, end, args.request.options())
        .await
        .with_context(|| format!("No candles for {} {}", args.symbol, args.interval))?;

    if let Some(path) = &args.output {
        CsvStorage::write_candles(path, &response.data)?;
        tracing::info!(count = response.data.len(), path = %path, "Wrote candles to CSV");
    }

    if args.summary || args.output.is_some() {
        print_json(&json!({
            "symbol": args.symbol,
            "interval": args.interval,
            "count": response.data.len(),
            "metadata": response.metadata,
        }))?;
    } else {
        print_json(&response)?;
    }

    provider.shutdown().await;
    Ok(())
}
