pub mod candles;
pub mod init_db;
pub mod snapshot;
pub mod watch;

pub use candles::{run_candles, CandlesArgs};
pub use init_db::{run_init_db, InitDbArgs};
pub use snapshot::{run_book, run_ticker, run_trades, BookArgs, SnapshotArgs, TradesArgs};
pub use watch::{run_watch, WatchArgs, WatchKind};

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use market_data_core::{AppConfig, ConfigLoader, RequestPriority, UpstreamProvider};
use market_data_hyperliquid::HyperliquidClient;
use market_data_provider::{RequestOptions, SmartDataProvider};
use market_data_store::{CandleBackend, InMemoryCandleBackend, PgCandleBackend};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub memory: bool,
}

impl GlobalOptions {
    /// # Errors
    /// Returns an error if the configuration cannot be loaded.
    pub fn load_config(&self) -> Result<AppConfig> {
        match &self.config {
            Some(path) => ConfigLoader::load_from(path),
            None => ConfigLoader::load(),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
    Critical,
}

impl From<PriorityArg> for RequestPriority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Self::Low,
            PriorityArg::Normal => Self::Normal,
            PriorityArg::High => Self::High,
            PriorityArg::Critical => Self::Critical,
        }
    }
}

/// Per-request scheduling options.
#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
    /// Request priority
    #[arg(long, value_enum, default_value = "normal")]
    pub priority: PriorityArg,

    /// Overall deadline in milliseconds (defaults to the configured timeout)
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl RequestArgs {
    #[must_use]
    pub fn options(&self) -> RequestOptions {
        let options = RequestOptions::new(self.priority.into());
        match self.timeout_ms {
            Some(ms) => options.with_timeout(Duration::from_millis(ms)),
            None => options,
        }
    }
}

/// Builds a provider over Hyperliquid with the configured candle backend.
///
/// # Errors
/// Returns an error if configuration, the upstream client or the database
/// connection fails.
pub async fn build_provider(options: &GlobalOptions) -> Result<SmartDataProvider> {
    let config = options.load_config()?;

    let upstream: Arc<dyn UpstreamProvider> = Arc::new(
        HyperliquidClient::from_config(&config.upstream)
            .context("Failed to create Hyperliquid client")?,
    );

    let backend: Arc<dyn CandleBackend> = if config.database.enabled && !options.memory {
        let pg = PgCandleBackend::connect(&config.database.url, config.database.max_connections)
            .await
            .context("Failed to open candle database")?;
        pg.ensure_table().await?;
        Arc::new(pg)
    } else {
        tracing::info!("Using in-memory candle store");
        Arc::new(InMemoryCandleBackend::new())
    };

    Ok(SmartDataProvider::new(config, upstream, backend))
}

/// Pretty-prints `value` as JSON on stdout.
///
/// # Errors
/// Returns an error if serialization fails.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
