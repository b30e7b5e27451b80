//! PostgreSQL candle backend.
//!
//! One table keyed by (symbol, timeframe, open_time). Batches are written in a
//! single transaction so concurrent range scans never observe half a batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_data_core::{CandleRecord, DataError, Result, Timeframe};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use tracing::{debug, info};

use crate::backend::CandleBackend;

#[derive(Debug, Clone, FromRow)]
struct CandleRow {
    symbol: String,
    timeframe: String,
    open_time: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

impl TryFrom<CandleRow> for CandleRecord {
    type Error = DataError;

    fn try_from(row: CandleRow) -> Result<Self> {
        let timeframe = row
            .timeframe
            .parse::<Timeframe>()
            .map_err(|e| DataError::storage(e.to_string()))?;
        Ok(Self {
            symbol: row.symbol,
            timeframe,
            open_time: row.open_time,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        })
    }
}

fn storage_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> DataError {
    move |e| DataError::storage(format!("{context}: {e}"))
}

#[derive(Debug, Clone)]
pub struct PgCandleBackend {
    pool: PgPool,
}

impl PgCandleBackend {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool to `database_url`.
    ///
    /// # Errors
    /// Returns an error if the database connection cannot be established.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(storage_err("Failed to connect to database"))?;
        info!(max_connections, "Connected candle store to PostgreSQL");
        Ok(Self { pool })
    }

    /// Creates the candle table if it does not exist.
    ///
    /// # Errors
    /// Returns an error if the DDL statement fails.
    pub async fn ensure_table(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS candles (
                symbol      TEXT        NOT NULL,
                timeframe   TEXT        NOT NULL,
                open_time   TIMESTAMPTZ NOT NULL,
                open        NUMERIC     NOT NULL,
                high        NUMERIC     NOT NULL,
                low         NUMERIC     NOT NULL,
                close       NUMERIC     NOT NULL,
                volume      NUMERIC     NOT NULL,
                fetched_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (symbol, timeframe, open_time)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to create candles table"))?;
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CandleBackend for PgCandleBackend {
    async fn scan_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CandleRecord>> {
        let rows = sqlx::query_as::<_, CandleRow>(
            r"
            SELECT symbol, timeframe, open_time, open, high, low, close, volume
            FROM candles
            WHERE symbol = $1 AND timeframe = $2
              AND open_time >= $3 AND open_time <= $4
            ORDER BY open_time ASC
            ",
        )
        .bind(symbol)
        .bind(timeframe.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("Failed to scan candles"))?;

        rows.into_iter().map(CandleRecord::try_from).collect()
    }

    /// Upserts a batch inside one transaction.
    ///
    /// Rows whose values are unchanged are not rewritten, so the returned
    /// count only includes rows that actually changed.
    async fn upsert_batch(&self, records: &[CandleRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage_err("Failed to begin transaction"))?;
        let mut written = 0u64;

        for chunk in records.chunks(100) {
            for record in chunk {
                let result = sqlx::query(
                    r"
                    INSERT INTO candles (symbol, timeframe, open_time, open, high, low, close, volume)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (symbol, timeframe, open_time) DO UPDATE SET
                        open = EXCLUDED.open,
                        high = EXCLUDED.high,
                        low = EXCLUDED.low,
                        close = EXCLUDED.close,
                        volume = EXCLUDED.volume,
                        fetched_at = NOW()
                    WHERE (candles.open, candles.high, candles.low, candles.close, candles.volume)
                        IS DISTINCT FROM
                        (EXCLUDED.open, EXCLUDED.high, EXCLUDED.low, EXCLUDED.close, EXCLUDED.volume)
                    ",
                )
                .bind(&record.symbol)
                .bind(record.timeframe.as_str())
                .bind(record.open_time)
                .bind(record.open)
                .bind(record.high)
                .bind(record.low)
                .bind(record.close)
                .bind(record.volume)
                .execute(&mut *tx)
                .await
                .map_err(storage_err("Failed to upsert candle"))?;

                written += result.rows_affected();
            }
        }

        tx.commit()
            .await
            .map_err(storage_err("Failed to commit transaction"))?;
        debug!(rows = written, batch = records.len(), "Upserted candle batch");
        Ok(written)
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
