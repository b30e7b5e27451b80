//! Public entry point: cache-first candle and snapshot access with metadata.
//!
//! Every operation resolves to data plus [`ResponseMetadata`]. Channel and
//! storage failures are absorbed into degradation flags; callers only see
//! [`DataError::DataUnavailable`] once every tier is exhausted, or
//! [`DataError::InvalidRange`] for a malformed request.

use chrono::{DateTime, Utc};
use market_data_core::{
    stream_queue, time_utils, AppConfig, CandleKey, CandleRecord, CandleSpan, DataError, DataType,
    OrderBookSnapshot, RequestPriority, Result, Snapshot, StreamReceiver, StreamSink, Ticker,
    TimeRange, Timeframe, TradeTape, UpstreamProvider,
};
use market_data_store::{CacheStore, CacheStoreStats, CandleBackend};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metadata::{CacheHit, DataResponse, ResponseMetadata, SourceTier};
use crate::overlap::OverlapAnalyzer;
use crate::pump::StreamPump;
use crate::rate_limiter::{ChannelRateLimiter, RateLimiterConfig, RateLimiterStats};
use crate::router::{Channel, ChannelRouter, RouteSnapshot};
use crate::scheduler::{PriorityScheduler, SchedulerStats};
use crate::splitter::{BatchFetcher, ChunkCollector, FetchReport};

/// Per-request priority and deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub priority: RequestPriority,
    /// Overrides the configured default timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    #[must_use]
    pub fn new(priority: RequestPriority) -> Self {
        Self {
            priority,
            timeout: None,
        }
    }

    #[must_use]
    pub fn critical() -> Self {
        Self::new(RequestPriority::Critical)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub cache: CacheStoreStats,
    pub poll_limiter: RateLimiterStats,
    pub stream_limiter: RateLimiterStats,
    pub scheduler: SchedulerStats,
    pub routes: Vec<RouteSnapshot>,
    pub stream_events_dropped: u64,
}

pub struct SmartDataProvider {
    config: AppConfig,
    upstream: Arc<dyn UpstreamProvider>,
    store: Arc<CacheStore>,
    analyzer: OverlapAnalyzer,
    fetcher: BatchFetcher,
    router: Arc<ChannelRouter>,
    scheduler: PriorityScheduler,
    poll_limiter: Arc<ChannelRateLimiter>,
    stream_limiter: Arc<ChannelRateLimiter>,
    sink: StreamSink,
    receiver: Mutex<Option<StreamReceiver>>,
    stop: Arc<AtomicBool>,
}

impl SmartDataProvider {
    #[must_use]
    pub fn new(
        config: AppConfig,
        upstream: Arc<dyn UpstreamProvider>,
        backend: Arc<dyn CandleBackend>,
    ) -> Self {
        let store = Arc::new(CacheStore::new(backend, config.cache.clone()));
        let analyzer =
            OverlapAnalyzer::new(Arc::clone(&store)).with_policy(config.splitter.fragment_policy);

        let poll_limiter = Arc::new(ChannelRateLimiter::new(
            "poll",
            RateLimiterConfig::per_second(config.upstream.poll_requests_per_second),
        ));
        let stream_limiter = Arc::new(ChannelRateLimiter::new(
            "stream",
            RateLimiterConfig::per_second(config.upstream.stream_requests_per_second),
        ));

        let (sink, receiver) = stream_queue(config.cache.stream_queue_capacity);
        let router = Arc::new(ChannelRouter::new(
            config.router.clone(),
            Arc::clone(&upstream),
            sink.clone(),
            Arc::clone(&stream_limiter),
        ));
        let fetcher = BatchFetcher::new(
            Arc::clone(&upstream),
            Arc::clone(&poll_limiter),
            config.splitter.clone(),
        );
        let scheduler = PriorityScheduler::new(&config.scheduler);

        info!(
            upstream = upstream.name(),
            per_call_limit = fetcher.splitter().limit(),
            workers = config.scheduler.worker_count,
            "Smart data provider created"
        );

        Self {
            config,
            upstream,
            store,
            analyzer,
            fetcher,
            router,
            scheduler,
            poll_limiter,
            stream_limiter,
            sink,
            receiver: Mutex::new(Some(receiver)),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    // ========================================================================
    // Candles
    // ========================================================================

    /// Candles for `[start, end]`, served from cache where possible.
    ///
    /// `end` is clamped to now and both ends are floored to `timeframe`.
    ///
    /// # Errors
    ///
    /// [`DataError::InvalidRange`] if the aligned range is empty or reversed;
    /// [`DataError::DataUnavailable`] if nothing could be served and the
    /// upstream fetch failed or timed out.
    pub async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: RequestOptions,
    ) -> Result<DataResponse<Vec<CandleRecord>>> {
        let started = Instant::now();
        let mut meta = ResponseMetadata::new(options.priority);

        let range = TimeRange::aligned(start, end.min(Utc::now()), timeframe)?;
        let span = range.to_span(timeframe);
        let expected = range.candle_count(timeframe);

        let (plan, cached_before) = match self
            .analyzer
            .analyze(symbol, timeframe, &range, expected)
            .await
        {
            Ok(overlap) => {
                meta.overlap = Some(overlap.status);
                (overlap.fetch_plan, overlap.cached_count)
            }
            Err(e) if e.is_caller_error() => return Err(e),
            Err(e) => {
                warn!(symbol, timeframe = %timeframe, error = %e, "Overlap analysis failed, fetching whole range");
                meta.degraded = true;
                (vec![span], 0)
            }
        };

        let mut fetched = Vec::new();
        let mut fetch_failure: Option<String> = None;
        let mut write_failed = false;

        if !plan.is_empty() {
            let report = self
                .fetch_plan(symbol, timeframe, &plan, options, &mut meta)
                .await;
            meta.split_count = report.chunk_count;
            meta.merge_count = report.merged_chunks;
            if report.failed_chunks > 0 {
                meta.degraded = true;
                fetch_failure = report.last_error.as_ref().map(ToString::to_string);
            }
            if meta.timed_out {
                fetch_failure.get_or_insert_with(|| "request timed out".to_string());
            }

            if !report.records.is_empty() {
                match self.store.put_batch(&report.records).await {
                    Ok(outcome) => meta.integrity_violations = outcome.violations,
                    Err(e) => {
                        warn!(symbol, error = %e, "Write-through failed; serving fetched data");
                        meta.degraded = true;
                        write_failed = true;
                    }
                }
            }
            fetched = report.records;
        }

        let data = match self.store.get_range(symbol, timeframe, &range).await {
            Ok(stored) if write_failed => overlay_fetched(stored, &fetched),
            Ok(stored) if !stored.is_empty() || fetched.is_empty() => stored,
            Ok(_) => fetched.clone(),
            Err(e) => {
                warn!(symbol, error = %e, "Cache read failed; serving fetched data");
                meta.degraded = true;
                fetched.clone()
            }
        };

        let present: Vec<DateTime<Utc>> = data.iter().map(|r| r.open_time).collect();
        meta.gaps = time_utils::missing_spans(&present, span, timeframe);

        (meta.cache_hit, meta.source) = if plan.is_empty() {
            (CacheHit::Hit, SourceTier::DurableStore)
        } else if cached_before == 0 {
            (CacheHit::Miss, SourceTier::Poll)
        } else if fetched.is_empty() {
            (CacheHit::Partial, SourceTier::DurableStore)
        } else {
            (CacheHit::Partial, SourceTier::Mixed)
        };
        meta.latency = started.elapsed();

        if data.is_empty() {
            if let Some(reason) = fetch_failure {
                return Err(DataError::unavailable(symbol, DataType::Candles, reason));
            }
        }

        debug!(
            symbol,
            timeframe = %timeframe,
            records = data.len(),
            cache_hit = ?meta.cache_hit,
            gaps = meta.gaps.len(),
            latency_ms = meta.latency.as_millis() as u64,
            "Candles served"
        );
        Ok(DataResponse {
            data,
            metadata: meta,
        })
    }

    /// Runs the fetch plan under the caller's deadline. On expiry, whatever
    /// chunks already arrived are merged and returned.
    async fn fetch_plan(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        plan: &[CandleSpan],
        options: RequestOptions,
        meta: &mut ResponseMetadata,
    ) -> FetchReport {
        if options.priority.is_critical() {
            let deadline = self.critical_deadline(options);
            let (Some(first), Some(last)) = (plan.first(), plan.last()) else {
                return FetchReport::default();
            };
            let span = CandleSpan {
                first: first.first,
                last: last.last,
            };
            let direct = self
                .scheduler
                .run(options.priority, self.fetcher.fetch_direct(symbol, timeframe, span));
            return match tokio::time::timeout(deadline, direct).await {
                Ok(report) => report,
                Err(_) => {
                    warn!(symbol, timeframe = %timeframe, "Critical candle fetch timed out");
                    meta.timed_out = true;
                    FetchReport {
                        chunk_count: 1,
                        failed_chunks: 1,
                        gaps: vec![span],
                        ..FetchReport::default()
                    }
                }
            };
        }

        let deadline = options
            .timeout
            .unwrap_or_else(|| self.config.facade.default_timeout());
        let collector = ChunkCollector::new();
        let batch = self.scheduler.run(
            options.priority,
            self.fetcher.fetch(symbol, timeframe, plan, &collector),
        );
        match tokio::time::timeout(deadline, batch).await {
            Ok(report) => report,
            Err(_) => {
                let mut partial = FetchReport::from_chunks(plan, timeframe, collector.take());
                partial.chunk_count = self.fetcher.planned_chunk_count(plan, timeframe);
                warn!(
                    symbol,
                    timeframe = %timeframe,
                    records = partial.records.len(),
                    chunks = partial.chunk_count,
                    "Candle fetch timed out, returning partial data"
                );
                meta.timed_out = true;
                partial
            }
        }
    }

    fn critical_deadline(&self, options: RequestOptions) -> Duration {
        let critical = self.config.facade.critical_timeout();
        options.timeout.map_or(critical, |t| t.min(critical))
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// # Errors
    /// [`DataError::DataUnavailable`] when no fresh, polled or stale ticker exists.
    pub async fn get_ticker(
        &self,
        symbol: &str,
        options: RequestOptions,
    ) -> Result<DataResponse<Ticker>> {
        let response = self.get_snapshot(DataType::Ticker, symbol, options).await?;
        narrow(response, symbol, DataType::Ticker, |s| match s {
            Snapshot::Ticker(t) => Some(t),
            _ => None,
        })
    }

    /// # Errors
    /// [`DataError::DataUnavailable`] when no fresh, polled or stale book exists.
    pub async fn get_order_book(
        &self,
        symbol: &str,
        options: RequestOptions,
    ) -> Result<DataResponse<OrderBookSnapshot>> {
        let response = self.get_snapshot(DataType::OrderBook, symbol, options).await?;
        narrow(response, symbol, DataType::OrderBook, |s| match s {
            Snapshot::OrderBook(b) => Some(b),
            _ => None,
        })
    }

    /// Recent trade tape, newest prints last.
    ///
    /// # Errors
    /// [`DataError::DataUnavailable`] when no fresh, polled or stale tape exists.
    pub async fn get_trades(
        &self,
        symbol: &str,
        options: RequestOptions,
    ) -> Result<DataResponse<TradeTape>> {
        let response = self.get_snapshot(DataType::Trades, symbol, options).await?;
        narrow(response, symbol, DataType::Trades, |s| match s {
            Snapshot::Trades(t) => Some(t),
            _ => None,
        })
    }

    async fn get_snapshot(
        &self,
        data_type: DataType,
        symbol: &str,
        options: RequestOptions,
    ) -> Result<DataResponse<Snapshot>> {
        let started = Instant::now();
        let mut meta = ResponseMetadata::new(options.priority);

        let decision = self.router.route(symbol, data_type);
        meta.channel = Some(decision);
        meta.degraded = decision.fallback_active;

        if let Some(cached) = self.store.get_snapshot(data_type, symbol) {
            meta.cache_hit = CacheHit::Hit;
            meta.source = if decision.channel == Channel::Stream {
                SourceTier::Stream
            } else {
                SourceTier::MemoryCache
            };
            meta.latency = started.elapsed();
            return Ok(DataResponse {
                data: cached.payload,
                metadata: meta,
            });
        }

        let (deadline, attempts) = if options.priority.is_critical() {
            (self.critical_deadline(options), 1)
        } else {
            (
                options
                    .timeout
                    .unwrap_or_else(|| self.config.facade.default_timeout()),
                self.config.facade.snapshot_retry_attempts.max(1),
            )
        };
        let poll = self
            .scheduler
            .run(options.priority, self.poll_snapshot(data_type, symbol, attempts));

        let failure = match tokio::time::timeout(deadline, poll).await {
            Ok(Ok(snapshot)) => {
                let data = self.store.put_snapshot(snapshot);
                meta.cache_hit = CacheHit::Miss;
                meta.source = SourceTier::Poll;
                meta.latency = started.elapsed();
                return Ok(DataResponse {
                    data,
                    metadata: meta,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => {
                meta.timed_out = true;
                "request timed out".to_string()
            }
        };

        meta.degraded = true;
        if let Some(stale) = self.store.get_stale_snapshot(data_type, symbol) {
            warn!(
                symbol,
                data_type = data_type.as_str(),
                age_ms = stale.age.as_millis() as u64,
                reason = %failure,
                "Serving stale snapshot"
            );
            meta.cache_hit = CacheHit::Hit;
            meta.source = SourceTier::MemoryCache;
            meta.stale = true;
            meta.latency = started.elapsed();
            return Ok(DataResponse {
                data: stale.payload,
                metadata: meta,
            });
        }

        warn!(symbol, data_type = data_type.as_str(), reason = %failure, "Snapshot unavailable");
        Err(DataError::unavailable(symbol, data_type, failure))
    }

    async fn poll_snapshot(
        &self,
        data_type: DataType,
        symbol: &str,
        attempts: u32,
    ) -> Result<Snapshot> {
        let symbols = [symbol.to_string()];
        let mut backoff = self.config.splitter.initial_backoff();
        let mut attempt = 1;

        loop {
            self.poll_limiter.acquire().await;
            let result = self
                .upstream
                .fetch_snapshot(data_type, &symbols)
                .await
                .and_then(|snapshots| {
                    snapshots
                        .into_iter()
                        .find(|s| s.data_type() == data_type && s.symbol() == symbol)
                        .ok_or_else(|| {
                            DataError::upstream(format!(
                                "no {} snapshot returned for {symbol}",
                                data_type.as_str()
                            ))
                        })
                });

            match result {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(symbol, data_type = data_type.as_str(), attempt, error = %e, "Snapshot poll failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.splitter.max_backoff());
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Starts the stream pump and router maintenance. Only the first call
    /// spawns the pump.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.router.spawn_maintenance(Arc::clone(&self.stop))];
        if let Some(receiver) = self.receiver.lock().take() {
            let pump = StreamPump::new(Arc::clone(&self.store), Arc::clone(&self.router), receiver);
            handles.push(tokio::spawn(pump.run()));
        }
        handles
    }

    /// Stops background tasks and releases held subscriptions.
    pub async fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.router.shutdown().await;
        self.sink.close();
        info!("Smart data provider shut down");
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[must_use]
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    #[must_use]
    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.router
    }

    #[must_use]
    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            cache: self.store.stats(),
            poll_limiter: self.poll_limiter.stats(),
            stream_limiter: self.stream_limiter.stats(),
            scheduler: self.scheduler.stats(),
            routes: self.router.snapshot(),
            stream_events_dropped: self.sink.dropped(),
        }
    }
}

/// Fills gaps in `stored` with `fetched` records. Stored values win on
/// conflicting keys.
fn overlay_fetched(stored: Vec<CandleRecord>, fetched: &[CandleRecord]) -> Vec<CandleRecord> {
    let mut merged: BTreeMap<CandleKey, CandleRecord> =
        fetched.iter().map(|r| (r.key(), r.clone())).collect();
    merged.extend(stored.into_iter().map(|r| (r.key(), r)));
    let mut records: Vec<CandleRecord> = merged.into_values().collect();
    records.sort_by_key(|r| r.open_time);
    records
}

fn narrow<T>(
    response: DataResponse<Snapshot>,
    symbol: &str,
    data_type: DataType,
    pick: impl FnOnce(Snapshot) -> Option<T>,
) -> Result<DataResponse<T>> {
    let DataResponse { data, metadata } = response;
    pick(data)
        .map(|data| DataResponse { data, metadata })
        .ok_or_else(|| DataError::unavailable(symbol, data_type, "upstream returned a different payload"))
}
