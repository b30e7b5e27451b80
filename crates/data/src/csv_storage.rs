use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::{Reader, Writer};
use market_data_core::{CandleRecord, Timeframe};
use rust_decimal::Decimal;
use std::fs::File;
use std::path::Path;

const HEADER: [&str; 8] = [
    "open_time", "symbol", "timeframe", "open", "high", "low", "close", "volume",
];

pub struct CsvStorage;

impl CsvStorage {
    /// Writes candles to a CSV file, oldest first.
    ///
    /// Format: open_time,symbol,timeframe,open,high,low,close,volume
    ///
    /// # Errors
    /// Returns error if file cannot be created or writing fails
    pub fn write_candles(path: impl AsRef<Path>, records: &[CandleRecord]) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create CSV file: {}", path.display()))?;
        let mut writer = Writer::from_writer(file);

        writer.write_record(HEADER)?;

        let mut sorted: Vec<&CandleRecord> = records.iter().collect();
        sorted.sort_by_key(|r| r.open_time);

        for record in sorted {
            writer.write_record(&[
                record.open_time.to_rfc3339(),
                record.symbol.clone(),
                record.timeframe.to_string(),
                record.open.to_string(),
                record.high.to_string(),
                record.low.to_string(),
                record.close.to_string(),
                record.volume.to_string(),
            ])?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Reads candles written by [`CsvStorage::write_candles`].
    ///
    /// # Errors
    /// Returns error if the file cannot be opened or a row is malformed
    pub fn read_candles(path: impl AsRef<Path>) -> Result<Vec<CandleRecord>> {
        let path = path.as_ref();
        let mut reader = Reader::from_path(path)
            .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

        let mut records = Vec::new();
        for (line, row) in reader.records().enumerate() {
            let row = row.with_context(|| format!("Malformed CSV row {}", line + 2))?;
            let field = |i: usize| row.get(i).unwrap_or_default();
            let decimal = |i: usize| -> Result<Decimal> {
                field(i)
                    .parse()
                    .with_context(|| format!("Invalid {} on row {}", HEADER[i], line + 2))
            };
            records.push(CandleRecord {
                open_time: DateTime::parse_from_rfc3339(field(0))
                    .with_context(|| format!("Invalid open_time on row {}", line + 2))?
                    .with_timezone(&Utc),
                symbol: field(1).to_string(),
                timeframe: field(2).parse::<Timeframe>()?,
                open: decimal(3)?,
                high: decimal(4)?,
                low: decimal(5)?,
                close: decimal(6)?,
                volume: decimal(7)?,
            });
        }
        Ok(records)
    }
}
