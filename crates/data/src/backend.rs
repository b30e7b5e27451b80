//! Durable candle storage contract and the in-process implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_data_core::{CandleRecord, Result, Timeframe};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Key-value store over (symbol, timeframe, open_time).
///
/// Implementations must apply a batch atomically: a concurrent scan sees
/// either none or all of it.
#[async_trait]
pub trait CandleBackend: Send + Sync {
    /// Records with `start <= open_time <= end`, ascending.
    async fn scan_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CandleRecord>>;

    /// Inserts or replaces records by key. Returns rows written.
    async fn upsert_batch(&self, records: &[CandleRecord]) -> Result<u64>;

    fn name(&self) -> &'static str;
}

type Series = BTreeMap<DateTime<Utc>, CandleRecord>;

#[derive(Default)]
pub struct InMemoryCandleBackend {
    series: RwLock<HashMap<(String, Timeframe), Series>>,
}

impl InMemoryCandleBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.series.read().values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CandleBackend for InMemoryCandleBackend {
    async fn scan_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CandleRecord>> {
        if start > end {
            return Ok(Vec::new());
        }
        let guard = self.series.read();
        Ok(guard
            .get(&(symbol.to_string(), timeframe))
            .map(|series| series.range(start..=end).map(|(_, r)| r.clone()).collect())
            .unwrap_or_default())
    }

    async fn upsert_batch(&self, records: &[CandleRecord]) -> Result<u64> {
        let mut guard = self.series.write();
        for record in records {
            guard
                .entry((record.symbol.clone(), record.timeframe))
                .or_default()
                .insert(record.open_time, record.clone());
        }
        Ok(records.len() as u64)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
