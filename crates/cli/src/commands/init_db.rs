use anyhow::{Context, Result};
use clap::Args;
use market_data_store::PgCandleBackend;

use super::GlobalOptions;

/// Arguments for the init-db command.
#[derive(Args, Debug, Clone)]
pub struct InitDbArgs {
    /// Database connection URL (falls back to `database.url` from config)
    #[arg(long, env = "DATABASE_URL")]
    pub db_url: Option<String>,
}

/// Creates the candle table.
///
/// # Errors
/// Returns an error if the database connection or DDL fails.
pub async fn run_init_db(options: &GlobalOptions, args: InitDbArgs) -> Result<()> {
    let config = options.load_config()?;
    let url = args.db_url.unwrap_or(config.database.url);

    let backend = PgCandleBackend::connect(&url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    backend.ensure_table().await?;

    tracing::info!("Candle table ready");
    Ok(())
}
