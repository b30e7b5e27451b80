//! Splits oversized candle requests into upstream-sized chunks and runs them.
//!
//! Chunk boundaries always fall on bucket boundaries. Chunks run with bounded
//! concurrency under the poll channel's rate limiter; each chunk is retried on
//! its own so one failure never restarts the batch.

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use market_data_core::{
    time_utils, CandleRecord, CandleSpan, DataError, Result, SplitterConfig, Timeframe,
    UpstreamProvider,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::merger::{merge_chunks, FetchedChunk, MergeOutcome};
use crate::rate_limiter::ChannelRateLimiter;

/// One upstream call: up to `count` candles ending at `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRequest {
    pub index: usize,
    pub span: CandleSpan,
    pub to: DateTime<Utc>,
    pub count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestSplitter {
    limit: usize,
}

impl RequestSplitter {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { limit: limit.max(1) }
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Splits `span` into `ceil(count / limit)` aligned chunks, oldest first.
    #[must_use]
    pub fn split(&self, span: CandleSpan, timeframe: Timeframe) -> Vec<ChunkRequest> {
        let total = span.count(timeframe);
        let mut chunks = Vec::with_capacity(total.div_ceil(self.limit));
        let mut offset = 0usize;

        while offset < total {
            let count = self.limit.min(total - offset);
            let first = time_utils::step(span.first, timeframe, offset as i64);
            let last = time_utils::step(first, timeframe, count as i64 - 1);
            chunks.push(ChunkRequest {
                index: chunks.len(),
                span: CandleSpan { first, last },
                to: last,
                count,
            });
            offset += count;
        }
        chunks
    }
}

/// Result of fetching one or more spans.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub records: Vec<CandleRecord>,
    pub gaps: Vec<CandleSpan>,
    pub chunk_count: usize,
    pub failed_chunks: usize,
    pub duplicates_removed: usize,
    pub merged_chunks: usize,
    #[serde(skip)]
    pub last_error: Option<DataError>,
}

impl FetchReport {
    /// Merges collected chunks per planned span. Chunk counters are left at
    /// what was collected; callers that know the plan size overwrite them.
    #[must_use]
    pub fn from_chunks(
        plan: &[CandleSpan],
        timeframe: Timeframe,
        chunks: Vec<(usize, FetchedChunk)>,
    ) -> Self {
        let mut per_span: Vec<Vec<FetchedChunk>> = vec![Vec::new(); plan.len()];
        let collected = chunks.len();
        for (span_index, chunk) in chunks {
            if let Some(bucket) = per_span.get_mut(span_index) {
                bucket.push(chunk);
            }
        }

        let mut report = Self {
            chunk_count: collected,
            ..Self::default()
        };
        for (span, chunks) in plan.iter().zip(per_span) {
            report.absorb(merge_chunks(*span, timeframe, chunks));
        }
        report.records.sort_by_key(|r| r.open_time);
        report
    }

    fn absorb(&mut self, merged: MergeOutcome) {
        self.records.extend(merged.records);
        self.gaps.extend(merged.gaps);
        self.duplicates_removed += merged.duplicates_removed;
        self.merged_chunks += merged.merged_chunks;
    }

    /// True when every planned chunk failed.
    #[must_use]
    pub fn is_total_failure(&self) -> bool {
        self.chunk_count > 0 && self.failed_chunks == self.chunk_count
    }
}

/// Shared buffer of chunks fetched so far, keyed by plan span index.
#[derive(Clone, Default)]
pub struct ChunkCollector {
    chunks: Arc<Mutex<Vec<(usize, FetchedChunk)>>>,
}

impl ChunkCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, span_index: usize, chunk: FetchedChunk) {
        self.chunks.lock().push((span_index, chunk));
    }

    /// Removes and returns everything collected so far.
    #[must_use]
    pub fn take(&self) -> Vec<(usize, FetchedChunk)> {
        std::mem::take(&mut *self.chunks.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct BatchFetcher {
    upstream: Arc<dyn UpstreamProvider>,
    limiter: Arc<ChannelRateLimiter>,
    splitter: RequestSplitter,
    config: SplitterConfig,
}

impl BatchFetcher {
    #[must_use]
    pub fn new(
        upstream: Arc<dyn UpstreamProvider>,
        limiter: Arc<ChannelRateLimiter>,
        config: SplitterConfig,
    ) -> Self {
        let splitter = RequestSplitter::new(upstream.max_candles_per_call());
        Self {
            upstream,
            limiter,
            splitter,
            config,
        }
    }

    #[must_use]
    pub fn splitter(&self) -> RequestSplitter {
        self.splitter
    }

    /// Number of upstream calls a full fetch of `plan` issues.
    #[must_use]
    pub fn planned_chunk_count(&self, plan: &[CandleSpan], timeframe: Timeframe) -> usize {
        plan.iter()
            .map(|span| self.splitter.split(*span, timeframe).len())
            .sum()
    }

    fn plan_chunks(&self, plan: &[CandleSpan], timeframe: Timeframe) -> Vec<(usize, ChunkRequest)> {
        plan.iter()
            .enumerate()
            .flat_map(|(i, span)| {
                self.splitter
                    .split(*span, timeframe)
                    .into_iter()
                    .map(move |chunk| (i, chunk))
            })
            .collect()
    }

    /// Fetches every span in `plan`, chunked and merged.
    ///
    /// Each successful chunk is pushed into `collector` as soon as it
    /// arrives, so a caller that abandons this future on timeout can still
    /// merge what was fetched with [`FetchReport::from_chunks`].
    pub async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        plan: &[CandleSpan],
        collector: &ChunkCollector,
    ) -> FetchReport {
        let planned = self.plan_chunks(plan, timeframe);
        let chunk_count = planned.len();

        info!(
            symbol,
            timeframe = %timeframe,
            spans = plan.len(),
            chunks = chunk_count,
            "Fetching candles in chunks"
        );

        let mut failed_chunks = 0usize;
        let mut last_error = None;
        let mut results = stream::iter(planned)
            .map(|(span_index, chunk)| async move {
                (span_index, self.fetch_chunk(symbol, timeframe, chunk).await)
            })
            .buffer_unordered(self.config.max_concurrency.max(1));

        while let Some((span_index, result)) = results.next().await {
            match result {
                Ok(chunk) => collector.push(span_index, chunk),
                Err(e) => {
                    failed_chunks += 1;
                    last_error = Some(e);
                }
            }
        }

        let mut report = FetchReport::from_chunks(plan, timeframe, collector.take());
        report.chunk_count = chunk_count;
        report.failed_chunks = failed_chunks;
        report.last_error = last_error;

        if !report.gaps.is_empty() {
            warn!(
                symbol,
                timeframe = %timeframe,
                gaps = report.gaps.len(),
                failed_chunks = report.failed_chunks,
                "Fetched candles still have gaps"
            );
        }
        report
    }

    /// Single call for the most recent `limit` buckets of `span`, no retries.
    pub async fn fetch_direct(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        span: CandleSpan,
    ) -> FetchReport {
        let count = span.count(timeframe).min(self.splitter.limit());
        let mut report = FetchReport {
            chunk_count: 1,
            ..FetchReport::default()
        };

        self.limiter.acquire().await;
        match self
            .upstream
            .fetch_candles(symbol, timeframe, span.last, count)
            .await
        {
            Ok(records) => {
                let chunk = FetchedChunk {
                    index: 0,
                    fetched_at: Instant::now(),
                    records,
                };
                report.absorb(merge_chunks(span, timeframe, vec![chunk]));
            }
            Err(e) => {
                warn!(symbol, timeframe = %timeframe, error = %e, "Direct candle fetch failed");
                report.failed_chunks = 1;
                report.gaps = vec![span];
                report.last_error = Some(e);
            }
        }
        report
    }

    async fn fetch_chunk(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        chunk: ChunkRequest,
    ) -> Result<FetchedChunk> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.initial_backoff();
        let mut attempt = 1;

        loop {
            self.limiter.acquire().await;
            match self
                .upstream
                .fetch_candles(symbol, timeframe, chunk.to, chunk.count)
                .await
            {
                Ok(records) => {
                    debug!(
                        symbol,
                        chunk = chunk.index,
                        records = records.len(),
                        attempt,
                        "Chunk fetched"
                    );
                    return Ok(FetchedChunk {
                        index: chunk.index,
                        fetched_at: Instant::now(),
                        records,
                    });
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        symbol,
                        chunk = chunk.index,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Chunk fetch failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_backoff().max(Duration::from_millis(1)));
                    attempt += 1;
                }
                Err(e) => {
                    warn!(symbol, chunk = chunk.index, attempt, error = %e, "Chunk fetch gave up");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn minute(m: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::minutes(m)
    }

    #[test]
    fn test_chunks_are_aligned_and_contiguous() {
        let span = CandleSpan { first: minute(0), last: minute(536) };
        let chunks = RequestSplitter::new(200).split(span, Timeframe::OneMinute);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].span, CandleSpan { first: minute(0), last: minute(199) });
        assert_eq!(chunks[1].span, CandleSpan { first: minute(200), last: minute(399) });
        assert_eq!(chunks[2].span, CandleSpan { first: minute(400), last: minute(536) });
        assert!(chunks.iter().all(|c| c.to == c.span.last));
    }

    #[test]
    fn test_exact_multiple_and_single_bucket() {
        let span = CandleSpan { first: minute(0), last: minute(399) };
        assert_eq!(RequestSplitter::new(200).split(span, Timeframe::OneMinute).len(), 2);
        let single = RequestSplitter::new(200).split(CandleSpan::single(minute(5)), Timeframe::OneMinute);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].count, 1);
    }

    #[test]
    fn test_daily_chunks_stay_on_midnight() {
        let day0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let span = CandleSpan { first: day0, last: day0 + ChronoDuration::days(9) };
        let chunks = RequestSplitter::new(3).split(span, Timeframe::OneDay);
        assert_eq!(chunks.len(), 4);
        assert!(chunks
            .iter()
            .all(|c| time_utils::is_aligned(c.span.first, Timeframe::OneDay)
                && time_utils::is_aligned(c.to, Timeframe::OneDay)));
        assert_eq!(chunks[3].count, 1);
    }
}
