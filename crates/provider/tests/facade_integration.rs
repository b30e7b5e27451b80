//! End-to-end tests for the smart data provider facade.
//!
//! These tests drive `SmartDataProvider` against a scripted upstream and an
//! in-memory durable backend:
//! - Cold, warm and partially cached candle requests
//! - Request splitting, CRITICAL bypass and timeouts
//! - Snapshot polling, memory hits and stale fallback
//! - Streaming delivery through the pump and recovery after a disconnect

mod common;

use chrono::Duration as ChronoDuration;
use common::{minutes_ago, synthetic_candle, test_config, until, MockUpstream, SwitchableBackend};
use market_data_core::{
    AppConfig, DataError, DataType, RequestPriority, Snapshot, Ticker, Timeframe, UpstreamProvider,
};
use market_data_provider::{
    CacheHit, Channel, DecisionReason, OverlapStatus, RequestOptions, SmartDataProvider,
    SourceTier, SubscriptionState,
};
use market_data_store::{CandleBackend, InMemoryCandleBackend};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Helper Functions
// =============================================================================

fn provider_with(config: AppConfig, limit: usize) -> (SmartDataProvider, Arc<MockUpstream>) {
    let upstream = Arc::new(MockUpstream::new(limit));
    let provider = SmartDataProvider::new(
        config,
        Arc::clone(&upstream) as Arc<dyn UpstreamProvider>,
        Arc::new(InMemoryCandleBackend::new()),
    );
    (provider, upstream)
}

fn provider(limit: usize) -> (SmartDataProvider, Arc<MockUpstream>) {
    provider_with(test_config(), limit)
}

fn normal() -> RequestOptions {
    RequestOptions::new(RequestPriority::Normal)
}

// =============================================================================
// Candles
// =============================================================================

#[tokio::test]
async fn test_cold_request_fetches_then_serves_from_cache() {
    let (provider, upstream) = provider(5000);
    let (start, end) = (minutes_ago(120), minutes_ago(60));

    let cold = provider
        .get_candles("BTC", Timeframe::OneMinute, start, end, normal())
        .await
        .unwrap();
    assert_eq!(cold.data.len(), 61);
    assert_eq!(cold.metadata.cache_hit, CacheHit::Miss);
    assert_eq!(cold.metadata.source, SourceTier::Poll);
    assert_eq!(cold.metadata.overlap, Some(OverlapStatus::NoOverlap));
    assert_eq!(cold.metadata.split_count, 1);
    assert!(cold.metadata.is_clean());

    let warm = provider
        .get_candles("BTC", Timeframe::OneMinute, start, end, normal())
        .await
        .unwrap();
    assert_eq!(warm.data, cold.data);
    assert_eq!(warm.metadata.cache_hit, CacheHit::Hit);
    assert_eq!(warm.metadata.source, SourceTier::DurableStore);
    assert_eq!(warm.metadata.overlap, Some(OverlapStatus::CompleteOverlap));
    assert_eq!(upstream.candle_calls().len(), 1);
}

#[tokio::test]
async fn test_large_range_split_into_chunks_and_merged() {
    let (provider, upstream) = provider(200);
    let (start, end) = (minutes_ago(600), minutes_ago(64));

    let response = provider
        .get_candles("ETH", Timeframe::OneMinute, start, end, normal())
        .await
        .unwrap();

    assert_eq!(response.data.len(), 537);
    assert!(response.data.windows(2).all(|w| w[0].open_time < w[1].open_time));
    assert!(response.metadata.gaps.is_empty());
    assert_eq!(response.metadata.split_count, 3);
    assert_eq!(response.metadata.merge_count, 3);

    let mut counts: Vec<usize> = upstream.candle_calls().iter().map(|c| c.count).collect();
    counts.sort_unstable();
    assert_eq!(counts, vec![137, 200, 200]);
}

#[tokio::test]
async fn test_extending_cached_range_fetches_only_the_tail() {
    let (provider, upstream) = provider(5000);
    let start = minutes_ago(200);

    provider
        .get_candles("BTC", Timeframe::OneMinute, start, start + ChronoDuration::minutes(30), normal())
        .await
        .unwrap();

    let end = start + ChronoDuration::minutes(60);
    let response = provider
        .get_candles("BTC", Timeframe::OneMinute, start, end, normal())
        .await
        .unwrap();

    assert_eq!(response.data.len(), 61);
    assert_eq!(response.metadata.overlap, Some(OverlapStatus::PartialStart));
    assert_eq!(response.metadata.cache_hit, CacheHit::Partial);
    assert_eq!(response.metadata.source, SourceTier::Mixed);

    let calls = upstream.candle_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].to, end);
    assert_eq!(calls[1].count, 30);
}

#[tokio::test]
async fn test_failed_write_through_still_serves_fetched_candles() {
    let upstream = Arc::new(MockUpstream::new(5000));
    let backend = Arc::new(SwitchableBackend::new());
    let provider = SmartDataProvider::new(
        test_config(),
        Arc::clone(&upstream) as Arc<dyn UpstreamProvider>,
        Arc::clone(&backend) as Arc<dyn CandleBackend>,
    );
    let start = minutes_ago(120);
    let end = start + ChronoDuration::minutes(59);

    let seeded: Vec<_> = (0..10)
        .map(|m| synthetic_candle("BTC", Timeframe::OneMinute, start + ChronoDuration::minutes(m)))
        .collect();
    provider.store().put_batch(&seeded).await.unwrap();
    backend.set_fail_writes(true);

    let response = provider
        .get_candles("BTC", Timeframe::OneMinute, start, end, normal())
        .await
        .unwrap();

    assert_eq!(response.data.len(), 60);
    assert!(response.data.windows(2).all(|w| w[0].open_time < w[1].open_time));
    assert_eq!(response.data[..10], seeded[..]);
    assert!(response.metadata.gaps.is_empty());
    assert!(response.metadata.degraded);
    assert_eq!(response.metadata.cache_hit, CacheHit::Partial);
    assert_eq!(response.metadata.source, SourceTier::Mixed);
    assert_eq!(upstream.candle_calls().len(), 1);
}

#[tokio::test]
async fn test_unaligned_caller_range_is_floored() {
    let (provider, _upstream) = provider(5000);
    let start = minutes_ago(90) + ChronoDuration::seconds(17);
    let end = minutes_ago(80) + ChronoDuration::seconds(42);

    let response = provider
        .get_candles("BTC", Timeframe::OneMinute, start, end, normal())
        .await
        .unwrap();

    assert_eq!(response.data.len(), 11);
    assert_eq!(response.data[0].open_time, minutes_ago(90));
}

#[tokio::test]
async fn test_fragmented_cache_refetches_and_reports_integrity_violations() {
    let (provider, _upstream) = provider(5000);
    let t0 = minutes_ago(300);

    let mut tampered = vec![
        synthetic_candle("BTC", Timeframe::OneMinute, t0),
        synthetic_candle("BTC", Timeframe::OneMinute, t0 + ChronoDuration::minutes(2)),
    ];
    for record in &mut tampered {
        record.close = dec!(1);
    }
    provider.store().put_batch(&tampered).await.unwrap();

    let response = provider
        .get_candles("BTC", Timeframe::OneMinute, t0, t0 + ChronoDuration::minutes(5), normal())
        .await
        .unwrap();

    assert_eq!(response.metadata.overlap, Some(OverlapStatus::PartialMiddleFragment));
    assert_eq!(response.metadata.integrity_violations.len(), 2);
    assert_eq!(response.data.len(), 6);
    assert_eq!(response.data[0].close, dec!(1));
    assert_ne!(response.data[1].close, dec!(1));
}

#[tokio::test]
async fn test_critical_request_makes_single_direct_call() {
    let (provider, upstream) = provider(200);
    let (start, end) = (minutes_ago(600), minutes_ago(64));

    let response = provider
        .get_candles("BTC", Timeframe::OneMinute, start, end, RequestOptions::critical())
        .await
        .unwrap();

    let calls = upstream.candle_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].to, end);
    assert_eq!(calls[0].count, 200);

    assert_eq!(response.data.len(), 200);
    assert_eq!(response.data.last().map(|r| r.open_time), Some(end));
    assert_eq!(response.metadata.split_count, 1);
    assert_eq!(response.metadata.gaps.len(), 1);
    assert_eq!(response.metadata.priority, RequestPriority::Critical);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_returns_partial_candles() {
    let mut config = test_config();
    config.splitter = config.splitter.with_max_concurrency(1);
    let (provider, upstream) = provider_with(config, 100);
    upstream.set_candle_delay(Duration::from_millis(50));

    let (start, end) = (minutes_ago(400), minutes_ago(101));
    let response = provider
        .get_candles(
            "BTC",
            Timeframe::OneMinute,
            start,
            end,
            normal().with_timeout(Duration::from_millis(120)),
        )
        .await
        .unwrap();

    assert!(response.metadata.timed_out);
    assert_eq!(response.data.len(), 200);
    assert_eq!(response.data[0].open_time, start);
    assert_eq!(response.metadata.gaps.len(), 1);
    assert_eq!(response.metadata.gaps[0].last, end);
    assert_eq!(response.metadata.split_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_chunk_failure_is_retried() {
    let (provider, upstream) = provider(5000);
    upstream.fail_next_candle_calls(1);

    let response = provider
        .get_candles("BTC", Timeframe::OneMinute, minutes_ago(120), minutes_ago(60), normal())
        .await
        .unwrap();

    assert_eq!(response.data.len(), 61);
    assert!(response.metadata.gaps.is_empty());
    assert!(!response.metadata.degraded);
    assert_eq!(upstream.candle_calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_after_retries_exhausted() {
    let (provider, upstream) = provider(5000);
    upstream.fail_next_candle_calls(u32::MAX);

    let err = provider
        .get_candles("BTC", Timeframe::OneMinute, minutes_ago(120), minutes_ago(60), normal())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DataError::DataUnavailable { data_type: DataType::Candles, .. }
    ));
    assert_eq!(
        upstream.candle_calls().len(),
        provider.config().splitter.max_attempts as usize
    );
}

#[tokio::test]
async fn test_invalid_ranges_rejected() {
    let (provider, upstream) = provider(5000);
    let t = minutes_ago(10);

    let same_bucket = provider
        .get_candles("BTC", Timeframe::OneMinute, t, t + ChronoDuration::seconds(30), normal())
        .await
        .unwrap_err();
    assert!(matches!(same_bucket, DataError::InvalidRange(_)));

    let future = minutes_ago(-60);
    let reversed = provider
        .get_candles("BTC", Timeframe::OneMinute, future, future + ChronoDuration::hours(1), normal())
        .await
        .unwrap_err();
    assert!(reversed.is_caller_error());
    assert!(upstream.candle_calls().is_empty());
}

// =============================================================================
// Snapshots
// =============================================================================

#[tokio::test]
async fn test_ticker_polled_once_then_served_from_memory() {
    let (provider, upstream) = provider(5000);

    let first = provider.get_ticker("BTC", normal()).await.unwrap();
    assert_eq!(first.data.price, dec!(50000));
    assert_eq!(first.metadata.cache_hit, CacheHit::Miss);
    assert_eq!(first.metadata.source, SourceTier::Poll);
    let decision = first.metadata.channel.unwrap();
    assert_eq!(decision.channel, Channel::Poll);
    assert_eq!(decision.reason, DecisionReason::LowFrequency);

    let second = provider.get_ticker("BTC", normal()).await.unwrap();
    assert_eq!(second.metadata.cache_hit, CacheHit::Hit);
    assert_eq!(second.metadata.source, SourceTier::MemoryCache);
    assert_eq!(upstream.snapshot_calls(), 1);
}

#[tokio::test]
async fn test_order_book_and_trades() {
    let (provider, _upstream) = provider(5000);

    let book = provider.get_order_book("ETH", normal()).await.unwrap();
    assert_eq!(book.data.best_bid().map(|l| l.price), Some(dec!(49999)));
    assert_eq!(book.data.mid_price(), Some(dec!(50000)));

    let trades = provider.get_trades("ETH", normal()).await.unwrap();
    assert_eq!(trades.data.trades.len(), 3);
    assert!(trades.data.trades.iter().all(|t| t.symbol == "ETH"));
}

#[tokio::test(start_paused = true)]
async fn test_stale_ticker_served_when_poll_fails() {
    let (provider, upstream) = provider(5000);
    provider.get_ticker("BTC", normal()).await.unwrap();

    tokio::time::advance(Duration::from_secs(3)).await;
    upstream.set_snapshots_fail(true);

    let response = provider.get_ticker("BTC", normal()).await.unwrap();
    assert!(response.metadata.stale);
    assert!(response.metadata.degraded);
    assert_eq!(response.metadata.source, SourceTier::MemoryCache);
    assert_eq!(response.data.price, dec!(50000));
    assert_eq!(
        upstream.snapshot_calls(),
        1 + provider.config().facade.snapshot_retry_attempts
    );
}

#[tokio::test(start_paused = true)]
async fn test_ticker_unavailable_without_any_cached_value() {
    let (provider, upstream) = provider(5000);
    upstream.set_snapshots_fail(true);

    let err = provider.get_ticker("SOL", normal()).await.unwrap_err();
    assert!(matches!(
        err,
        DataError::DataUnavailable { data_type: DataType::Ticker, ref symbol, .. } if symbol == "SOL"
    ));
}

#[tokio::test]
async fn test_critical_ticker_polls_without_retry() {
    let (provider, upstream) = provider(5000);
    upstream.set_snapshots_fail(true);

    let err = provider
        .get_ticker("BTC", RequestOptions::critical())
        .await
        .unwrap_err();
    assert!(matches!(err, DataError::DataUnavailable { .. }));
    assert_eq!(upstream.snapshot_calls(), 1);
}

// =============================================================================
// Streaming
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_busy_ticker_moves_to_stream_and_recovers_after_disconnect() {
    let (provider, upstream) = provider(5000);
    let handles = provider.spawn_background();

    for _ in 0..6 {
        provider.get_ticker("BTC", normal()).await.unwrap();
    }
    until(|| upstream.live_subscriptions() == 1).await;

    let pushed = Snapshot::Ticker(Ticker {
        symbol: "BTC".into(),
        price: dec!(51000),
        best_bid: None,
        best_ask: None,
        timestamp: chrono::Utc::now(),
    });
    assert_eq!(upstream.emit(&pushed), 1);
    until(|| {
        provider
            .store()
            .get_snapshot(DataType::Ticker, "BTC")
            .is_some_and(|c| c.payload == pushed)
    })
    .await;

    let streamed = provider.get_ticker("BTC", normal()).await.unwrap();
    assert_eq!(streamed.data.price, dec!(51000));
    assert_eq!(streamed.metadata.source, SourceTier::Stream);
    assert_eq!(streamed.metadata.channel.map(|d| d.reason), Some(DecisionReason::StreamActive));

    upstream.drop_connections("socket closed");
    until(|| {
        matches!(
            provider.router().state_of("BTC", DataType::Ticker),
            SubscriptionState::DegradedPolling { .. }
        )
    })
    .await;
    let degraded = provider.get_ticker("BTC", normal()).await.unwrap();
    assert!(degraded.metadata.degraded);

    until(|| upstream.live_subscriptions() == 1).await;
    assert_eq!(upstream.subscribe_calls(), 2);

    provider.shutdown().await;
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(upstream.live_subscriptions(), 0);
}
