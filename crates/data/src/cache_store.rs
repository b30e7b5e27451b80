//! Two-tier cache: a TTL memory tier for realtime snapshots and a durable tier
//! for candles.

use chrono::{DateTime, Utc};
use market_data_core::{
    time_utils, CacheConfig, CandleRecord, CandleSpan, DataError, DataType, Result, Snapshot,
    TimeRange, Timeframe, TradePrint, TradeTape,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::backend::CandleBackend;
use crate::memory_cache::{CacheStats, CachedValue, MemoryCache};

type SeriesKey = (String, Timeframe);
type SnapshotKey = (DataType, String);

/// A fetched candle that disagreed with an already-closed stored candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityViolation {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub detail: String,
}

impl From<&IntegrityViolation> for DataError {
    fn from(v: &IntegrityViolation) -> Self {
        Self::DataIntegrity {
            symbol: v.symbol.clone(),
            timeframe: v.timeframe,
            open_time: v.open_time,
            detail: v.detail.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PutOutcome {
    /// Records inserted or updated (new candles and forming-candle updates).
    pub written: usize,
    /// Records identical to what was already stored.
    pub unchanged: usize,
    /// Records dropped because `open_time` was not on a bucket boundary.
    pub rejected_unaligned: usize,
    pub violations: Vec<IntegrityViolation>,
}

impl PutOutcome {
    fn absorb(&mut self, other: Self) {
        self.written += other.written;
        self.unchanged += other.unchanged;
        self.rejected_unaligned += other.rejected_unaligned;
        self.violations.extend(other.violations);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStoreStats {
    pub backend: &'static str,
    pub snapshots: CacheStats,
    pub integrity_violations: u64,
}

pub struct CacheStore {
    backend: Arc<dyn CandleBackend>,
    snapshots: MemoryCache<SnapshotKey, Snapshot>,
    config: CacheConfig,
    write_locks: Mutex<HashMap<SeriesKey, Arc<tokio::sync::Mutex<()>>>>,
    integrity_violations: AtomicU64,
}

impl CacheStore {
    #[must_use]
    pub fn new(backend: Arc<dyn CandleBackend>, config: CacheConfig) -> Self {
        Self {
            backend,
            snapshots: MemoryCache::new(config.memory_budget),
            config,
            write_locks: Mutex::new(HashMap::new()),
            integrity_violations: AtomicU64::new(0),
        }
    }

    fn series_lock(&self, key: &SeriesKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock();
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    // ========================================================================
    // Durable tier
    // ========================================================================

    /// Idempotent upsert keyed by (symbol, timeframe, open_time).
    ///
    /// Writes for one series are serialized. A record that differs from an
    /// already-closed stored candle is logged and reported as a violation;
    /// the stored value is kept and the rest of the batch proceeds.
    ///
    /// # Errors
    /// Returns [`DataError::Storage`] if the backend fails.
    pub async fn put_batch(&self, records: &[CandleRecord]) -> Result<PutOutcome> {
        let mut grouped: BTreeMap<SeriesKey, BTreeMap<DateTime<Utc>, &CandleRecord>> =
            BTreeMap::new();
        let mut outcome = PutOutcome::default();

        for record in records {
            if !record.is_aligned() {
                warn!(
                    symbol = %record.symbol,
                    timeframe = %record.timeframe,
                    open_time = %record.open_time,
                    "Dropping candle with unaligned open time"
                );
                outcome.rejected_unaligned += 1;
                continue;
            }
            // later duplicates in the same batch win
            grouped
                .entry((record.symbol.clone(), record.timeframe))
                .or_default()
                .insert(record.open_time, record);
        }

        for (key, batch) in grouped {
            outcome.absorb(self.put_series(&key, batch).await?);
        }
        Ok(outcome)
    }

    async fn put_series(
        &self,
        key: &SeriesKey,
        batch: BTreeMap<DateTime<Utc>, &CandleRecord>,
    ) -> Result<PutOutcome> {
        let (Some(&first), Some(&last)) = (batch.keys().next(), batch.keys().next_back()) else {
            return Ok(PutOutcome::default());
        };

        let lock = self.series_lock(key);
        let result = {
            let _guard = lock.lock().await;
            self.write_series(key, batch, first, last).await
        };
        self.release_series_lock(key, lock);
        result
    }

    /// Drops the series lock once no other writer holds or waits on it.
    /// Clones are only handed out under the map lock, so a count of two
    /// (map plus ours) means nobody else can reach it.
    fn release_series_lock(&self, key: &SeriesKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.write_locks.lock();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    async fn write_series(
        &self,
        key: &SeriesKey,
        batch: BTreeMap<DateTime<Utc>, &CandleRecord>,
        first: DateTime<Utc>,
        last: DateTime<Utc>,
    ) -> Result<PutOutcome> {
        let existing: HashMap<DateTime<Utc>, CandleRecord> = self
            .backend
            .scan_range(&key.0, key.1, first, last)
            .await?
            .into_iter()
            .map(|r| (r.open_time, r))
            .collect();

        let now = Utc::now();
        let mut outcome = PutOutcome::default();
        let mut to_write = Vec::with_capacity(batch.len());

        for (open_time, incoming) in batch {
            match existing.get(&open_time) {
                None => to_write.push(incoming.clone()),
                Some(stored) => match stored.value_mismatch(incoming) {
                    None => outcome.unchanged += 1,
                    Some(detail) if stored.is_closed_at(now) => {
                        error!(
                            symbol = %key.0,
                            timeframe = %key.1,
                            open_time = %open_time,
                            detail = %detail,
                            "Integrity violation: fetched values disagree with closed candle"
                        );
                        self.integrity_violations.fetch_add(1, Ordering::Relaxed);
                        outcome.violations.push(IntegrityViolation {
                            symbol: key.0.clone(),
                            timeframe: key.1,
                            open_time,
                            detail,
                        });
                    }
                    Some(_) => to_write.push(incoming.clone()),
                },
            }
        }

        if !to_write.is_empty() {
            self.backend.upsert_batch(&to_write).await?;
        }
        outcome.written = to_write.len();
        debug!(
            symbol = %key.0,
            timeframe = %key.1,
            written = outcome.written,
            unchanged = outcome.unchanged,
            violations = outcome.violations.len(),
            "Stored candle batch"
        );
        Ok(outcome)
    }

    /// Every stored candle in `range`, including the forming one.
    ///
    /// # Errors
    /// Returns [`DataError::Storage`] if the backend fails.
    pub async fn get_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: &TimeRange,
    ) -> Result<Vec<CandleRecord>> {
        self.backend
            .scan_range(symbol, timeframe, range.start(), range.end())
            .await
    }

    /// Sorted open times of closed, aligned candles between `start` and `end`.
    ///
    /// The forming candle is excluded so it is always treated as missing and
    /// refetched.
    ///
    /// # Errors
    /// Returns [`DataError::Storage`] if the backend fails.
    pub async fn closed_open_times(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let now = Utc::now();
        let mut times: Vec<DateTime<Utc>> = self
            .backend
            .scan_range(symbol, timeframe, start, end)
            .await?
            .into_iter()
            .filter(|r| r.is_aligned() && r.is_closed_at(now))
            .map(|r| r.open_time)
            .collect();
        times.sort_unstable();
        times.dedup();
        Ok(times)
    }

    /// # Errors
    /// Returns [`DataError::Storage`] if the backend fails.
    pub async fn has_any_in_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: &TimeRange,
    ) -> Result<bool> {
        Ok(self.count_in_range(symbol, timeframe, range).await? > 0)
    }

    /// # Errors
    /// Returns [`DataError::Storage`] if the backend fails.
    pub async fn count_in_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: &TimeRange,
    ) -> Result<usize> {
        Ok(self
            .closed_open_times(symbol, timeframe, range.start(), range.end())
            .await?
            .len())
    }

    /// Longest uninterrupted run of closed candles starting exactly at
    /// `start` and not extending past `end`.
    ///
    /// # Errors
    /// Returns [`DataError::Storage`] if the backend fails.
    pub async fn find_continuous_run_from(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<CandleSpan>> {
        let times = self.closed_open_times(symbol, timeframe, start, end).await?;
        Ok(time_utils::continuous_run_from(&times, start, timeframe))
    }

    // ========================================================================
    // Memory tier
    // ========================================================================

    /// Fresh snapshot for `(data_type, symbol)`, if within its TTL.
    pub fn get_snapshot(&self, data_type: DataType, symbol: &str) -> Option<CachedValue<Snapshot>> {
        self.snapshots.get(&(data_type, symbol.to_string()))
    }

    /// Resident snapshot regardless of TTL, flagged stale when expired.
    pub fn get_stale_snapshot(
        &self,
        data_type: DataType,
        symbol: &str,
    ) -> Option<CachedValue<Snapshot>> {
        self.snapshots.get_stale(&(data_type, symbol.to_string()))
    }

    /// Caches a snapshot. Trade tapes are merged into the resident tape.
    pub fn put_snapshot(&self, snapshot: Snapshot) -> Snapshot {
        match snapshot {
            Snapshot::Trades(tape) => Snapshot::Trades(self.append_trades(&tape.symbol, tape.trades)),
            other => {
                let data_type = other.data_type();
                let key = (data_type, other.symbol().to_string());
                self.snapshots
                    .insert(key, other.clone(), self.config.ttl_for(data_type));
                other
            }
        }
    }

    /// Appends prints to the cached tape for `symbol`, keeping the newest
    /// `trade_tape_len`.
    pub fn append_trades(&self, symbol: &str, prints: Vec<TradePrint>) -> TradeTape {
        let cap = self.config.trade_tape_len.max(1);
        let merged = self.snapshots.upsert_with(
            (DataType::Trades, symbol.to_string()),
            self.config.ttl_for(DataType::Trades),
            |previous| {
                let mut tape = match previous {
                    Some(Snapshot::Trades(tape)) => tape.clone(),
                    _ => TradeTape::new(symbol),
                };
                tape.extend_capped(prints, cap);
                Snapshot::Trades(tape)
            },
        );
        match merged {
            Snapshot::Trades(tape) => tape,
            _ => TradeTape::new(symbol),
        }
    }

    pub fn purge_expired_snapshots(&self) -> usize {
        self.snapshots.purge_expired()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStoreStats {
        CacheStoreStats {
            backend: self.backend.name(),
            snapshots: self.snapshots.stats(),
            integrity_violations: self.integrity_violations.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}
