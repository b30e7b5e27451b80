//! Watch CLI command.
//!
//! Issues the same snapshot request on an interval so the router can promote
//! the key to streaming, then prints provider statistics.

use anyhow::Result;
use clap::{Args, ValueEnum};
use market_data_provider::{ResponseMetadata, SmartDataProvider};
use serde_json::{json, Value};
use std::time::Duration;

use super::{build_provider, print_json, GlobalOptions, RequestArgs};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Ticker,
    Book,
    Trades,
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    /// Symbol/coin (e.g., "BTC", "ETH")
    #[arg(long)]
    pub symbol: String,

    /// Snapshot type to request
    #[arg(long, value_enum, default_value = "ticker")]
    pub kind: WatchKind,

    /// Delay between requests in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub interval_ms: u64,

    /// Number of requests
    #[arg(long, default_value_t = 30)]
    pub count: usize,

    #[command(flatten)]
    pub request: RequestArgs,
}

/// Runs the watch command.
///
/// # Errors
/// Returns an error if the provider cannot be built.
pub async fn run_watch(options: &GlobalOptions, args: WatchArgs) -> Result<()> {
    let provider = build_provider(options).await?;
    let handles = provider.spawn_background();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));

    tracing::info!(symbol = %args.symbol, kind = ?args.kind, count = args.count, "Watching");

    for iteration in 0..args.count {
        ticker.tick().await;
        match request(&provider, &args).await {
            Ok(line) => println!("{}", with_iteration(line, iteration)),
            Err(e) => tracing::warn!(iteration, error = %e, "Request failed"),
        }
    }

    print_json(&provider.stats())?;
    provider.shutdown().await;
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn request(provider: &SmartDataProvider, args: &WatchArgs) -> Result<Value> {
    let options = args.request.options();
    let line = match args.kind {
        WatchKind::Ticker => {
            let r = provider.get_ticker(&args.symbol, options).await?;
            summarize(&r.metadata, json!({ "price": r.data.price }))
        }
        WatchKind::Book => {
            let r = provider.get_order_book(&args.symbol, options).await?;
            summarize(&r.metadata, json!({ "mid": r.data.mid_price(), "spread_bps": r.data.spread_bps() }))
        }
        WatchKind::Trades => {
            let r = provider.get_trades(&args.symbol, options).await?;
            summarize(&r.metadata, json!({ "prints": r.data.trades.len() }))
        }
    };
    Ok(line)
}

fn summarize(meta: &ResponseMetadata, data: Value) -> Value {
    json!({
        "channel": meta.channel.map(|c| c.channel),
        "reason": meta.channel.map(|c| c.reason),
        "cache_hit": meta.cache_hit,
        "source": meta.source,
        "stale": meta.stale,
        "degraded": meta.degraded,
        "latency_ms": u64::try_from(meta.latency.as_millis()).unwrap_or(u64::MAX),
        "data": data,
    })
}

fn with_iteration(mut line: Value, iteration: usize) -> Value {
    if let Value::Object(map) = &mut line {
        map.insert("iteration".to_string(), json!(iteration));
    }
    line
}
