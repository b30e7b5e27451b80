//! Scripted upstream used by the provider integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use market_data_core::{
    time_utils, AppConfig, CandleRecord, DataError, DataType, OrderBookSnapshot, PriceLevel,
    Result, RouterConfig, Snapshot, StreamEvent, StreamSink, SubscriptionHandle, Ticker,
    Timeframe, TradePrint, TradeSide, TradeTape, UpstreamProvider,
};
use market_data_store::{CandleBackend, InMemoryCandleBackend};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// One recorded `fetch_candles` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandleCall {
    pub to: DateTime<Utc>,
    pub count: usize,
}

struct Subscription {
    data_type: DataType,
    symbols: Vec<String>,
    sink: StreamSink,
}

/// Synthesizes deterministic candles for any bucket up to now and canned
/// snapshots, with switches for failure injection.
pub struct MockUpstream {
    limit: usize,
    candle_calls: Mutex<Vec<CandleCall>>,
    /// Number of upcoming candle calls that fail transiently.
    failing_candle_calls: AtomicU32,
    candle_delay: Mutex<Option<Duration>>,
    snapshot_calls: AtomicU32,
    snapshots_fail: AtomicBool,
    ticker_price: Mutex<Decimal>,
    subscribe_calls: AtomicU32,
    unsubscribe_calls: AtomicU32,
    subscribe_fails: AtomicBool,
    next_handle: AtomicU64,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
}

impl MockUpstream {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            candle_calls: Mutex::new(Vec::new()),
            failing_candle_calls: AtomicU32::new(0),
            candle_delay: Mutex::new(None),
            snapshot_calls: AtomicU32::new(0),
            snapshots_fail: AtomicBool::new(false),
            ticker_price: Mutex::new(dec!(50000)),
            subscribe_calls: AtomicU32::new(0),
            unsubscribe_calls: AtomicU32::new(0),
            subscribe_fails: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    pub fn fail_next_candle_calls(&self, n: u32) {
        self.failing_candle_calls.store(n, Ordering::SeqCst);
    }

    pub fn set_candle_delay(&self, delay: Duration) {
        *self.candle_delay.lock() = Some(delay);
    }

    pub fn set_snapshots_fail(&self, fail: bool) {
        self.snapshots_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_ticker_price(&self, price: Decimal) {
        *self.ticker_price.lock() = price;
    }

    pub fn set_subscribe_fails(&self, fail: bool) {
        self.subscribe_fails.store(fail, Ordering::SeqCst);
    }

    /// Pushes `snapshot` into every live subscription carrying its key.
    pub fn emit(&self, snapshot: &Snapshot) -> usize {
        let subs = self.subscriptions.lock();
        let mut delivered = 0;
        for sub in subs.values() {
            if sub.data_type == snapshot.data_type()
                && sub.symbols.iter().any(|s| s == snapshot.symbol())
            {
                sub.sink.push(StreamEvent::Snapshot(snapshot.clone()));
                delivered += 1;
            }
        }
        delivered
    }

    /// Drops every live subscription, reporting a disconnect for each.
    pub fn drop_connections(&self, reason: &str) {
        let drained: Vec<Subscription> = self.subscriptions.lock().drain().map(|(_, s)| s).collect();
        for sub in drained {
            sub.sink.push(StreamEvent::Disconnected {
                data_type: sub.data_type,
                symbols: sub.symbols,
                reason: reason.to_string(),
            });
        }
    }

    // ------------------------------------------------------------------
    // Counters
    // ------------------------------------------------------------------

    pub fn candle_calls(&self) -> Vec<CandleCall> {
        self.candle_calls.lock().clone()
    }

    pub fn snapshot_calls(&self) -> u32 {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> u32 {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    pub fn live_subscriptions(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

/// Deterministic candle for `open_time`; close tracks the bucket index.
pub fn synthetic_candle(symbol: &str, timeframe: Timeframe, open_time: DateTime<Utc>) -> CandleRecord {
    let index = open_time.timestamp() / timeframe.as_secs();
    let base = Decimal::from(100 + index.rem_euclid(500));
    CandleRecord {
        symbol: symbol.to_string(),
        timeframe,
        open_time,
        open: base,
        high: base + dec!(2),
        low: base - dec!(1),
        close: base + dec!(1),
        volume: dec!(10),
    }
}

#[async_trait]
impl UpstreamProvider for MockUpstream {
    fn max_candles_per_call(&self) -> usize {
        self.limit
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        to: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<CandleRecord>> {
        self.candle_calls.lock().push(CandleCall { to, count });
        let delay = *self.candle_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_candle_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(DataError::transient("scripted candle failure"));
        }

        let current = time_utils::align_to_boundary(Utc::now(), timeframe);
        let last = time_utils::align_to_boundary(to, timeframe).min(current);
        let count = count.min(self.limit);
        let first = time_utils::step(last, timeframe, 1 - count as i64);
        Ok(time_utils::expected_sequence(first, last, timeframe)
            .map(|t| synthetic_candle(symbol, timeframe, t))
            .collect())
    }

    async fn fetch_snapshot(&self, data_type: DataType, symbols: &[String]) -> Result<Vec<Snapshot>> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        if self.snapshots_fail.load(Ordering::SeqCst) {
            return Err(DataError::transient("scripted snapshot failure"));
        }
        let price = *self.ticker_price.lock();
        let now = Utc::now();
        Ok(symbols
            .iter()
            .map(|symbol| match data_type {
                DataType::OrderBook => Snapshot::OrderBook(OrderBookSnapshot {
                    symbol: symbol.clone(),
                    bids: vec![PriceLevel { price: price - dec!(1), size: dec!(2) }],
                    asks: vec![PriceLevel { price: price + dec!(1), size: dec!(3) }],
                    timestamp: now,
                }),
                DataType::Trades => Snapshot::Trades(TradeTape {
                    symbol: symbol.clone(),
                    trades: (1..=3)
                        .map(|id| TradePrint {
                            symbol: symbol.clone(),
                            trade_id: id,
                            price,
                            size: dec!(0.5),
                            side: TradeSide::Buy,
                            timestamp: now + ChronoDuration::milliseconds(id as i64),
                        })
                        .collect(),
                }),
                _ => Snapshot::Ticker(Ticker {
                    symbol: symbol.clone(),
                    price,
                    best_bid: Some(price - dec!(1)),
                    best_ask: Some(price + dec!(1)),
                    timestamp: now,
                }),
            })
            .collect())
    }

    async fn subscribe(
        &self,
        data_type: DataType,
        symbols: &[String],
        sink: StreamSink,
    ) -> Result<SubscriptionHandle> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.subscribe_fails.load(Ordering::SeqCst) {
            return Err(DataError::transient("scripted subscribe failure"));
        }
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().insert(
            id,
            Subscription {
                data_type,
                symbols: symbols.to_vec(),
                sink,
            },
        );
        Ok(SubscriptionHandle(id))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().remove(&handle.0);
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Config with generous rate limits and fast backoff so tests never wait on
/// real time.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.upstream.poll_requests_per_second = 1000;
    config.upstream.stream_requests_per_second = 1000;
    config.splitter = config.splitter.with_backoff(1, 4);
    config.router = fast_router();
    config
}

pub fn fast_router() -> RouterConfig {
    RouterConfig::default()
        .with_thresholds(6.0, 1.0)
        .with_backoff(10, 40)
        .with_max_reconnect_attempts(2)
        .with_probe_interval_ms(5_000)
        .with_idle_grace_ms(60_000)
}

/// Yields until `cond` holds.
pub async fn until(cond: impl Fn() -> bool) {
    while !cond() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Start of the minute `minutes_ago` minutes before now.
pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    time_utils::align_to_boundary(Utc::now(), Timeframe::OneMinute) - ChronoDuration::minutes(minutes)
}

// =============================================================================
// Durable backend with failure injection
// =============================================================================

/// In-memory backend whose writes can be switched to fail.
#[derive(Default)]
pub struct SwitchableBackend {
    inner: InMemoryCandleBackend,
    fail_writes: AtomicBool,
}

impl SwitchableBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CandleBackend for SwitchableBackend {
    async fn scan_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CandleRecord>> {
        self.inner.scan_range(symbol, timeframe, start, end).await
    }

    async fn upsert_batch(&self, records: &[CandleRecord]) -> Result<u64> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DataError::storage("disk full"));
        }
        self.inner.upsert_batch(records).await
    }

    fn name(&self) -> &'static str {
        "switchable"
    }
}
