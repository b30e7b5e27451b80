use anyhow::{Context, Result};
use clap::Args;

use super::{build_provider, print_json, GlobalOptions, RequestArgs};

#[derive(Args, Debug, Clone)]
pub struct SnapshotArgs {
    /// Symbol/coin (e.g., "BTC", "ETH")
    #[arg(long)]
    pub symbol: String,

    #[command(flatten)]
    pub request: RequestArgs,
}

#[derive(Args, Debug, Clone)]
pub struct BookArgs {
    #[command(flatten)]
    pub snapshot: SnapshotArgs,

    /// Levels to print per side
    #[arg(long, default_value_t = 10)]
    pub depth: usize,
}

#[derive(Args, Debug, Clone)]
pub struct TradesArgs {
    #[command(flatten)]
    pub snapshot: SnapshotArgs,

    /// Most recent prints to show
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

/// # Errors
/// Returns an error if no ticker could be served.
pub async fn run_ticker(options: &GlobalOptions, args: SnapshotArgs) -> Result<()> {
    let provider = build_provider(options).await?;
    let response = provider
        .get_ticker(&args.symbol, args.request.options())
        .await
        .with_context(|| format!("No ticker for {}", args.symbol))?;
    print_json(&response)?;
    provider.shutdown().await;
    Ok(())
}

/// # Errors
/// Returns an error if no order book could be served.
pub async fn run_book(options: &GlobalOptions, args: BookArgs) -> Result<()> {
    let provider = build_provider(options).await?;
    let mut response = provider
        .get_order_book(&args.snapshot.symbol, args.snapshot.request.options())
        .await
        .with_context(|| format!("No order book for {}", args.snapshot.symbol))?;

    response.data.bids.truncate(args.depth);
    response.data.asks.truncate(args.depth);
    if let Some(spread) = response.data.spread_bps() {
        tracing::info!(symbol = %args.snapshot.symbol, spread_bps = %spread, "Order book spread");
    }
    print_json(&response)?;
    provider.shutdown().await;
    Ok(())
}

/// # Errors
/// Returns an error if no trade tape could be served.
pub async fn run_trades(options: &GlobalOptions, args: TradesArgs) -> Result<()> {
    let provider = build_provider(options).await?;
    let mut response = provider
        .get_trades(&args.snapshot.symbol, args.snapshot.request.options())
        .await
        .with_context(|| format!("No trades for {}", args.snapshot.symbol))?;

    let excess = response.data.trades.len().saturating_sub(args.limit);
    response.data.trades.drain(..excess);
    print_json(&response)?;
    provider.shutdown().await;
    Ok(())
}
