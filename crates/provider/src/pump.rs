//! Drains pushed stream events into the cache.

use market_data_core::{StreamEvent, StreamReceiver};
use market_data_store::CacheStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::router::ChannelRouter;

pub struct StreamPump {
    store: Arc<CacheStore>,
    router: Arc<ChannelRouter>,
    receiver: StreamReceiver,
}

impl StreamPump {
    #[must_use]
    pub fn new(store: Arc<CacheStore>, router: Arc<ChannelRouter>, receiver: StreamReceiver) -> Self {
        Self {
            store,
            router,
            receiver,
        }
    }

    /// Consumes events until the queue is closed and drained.
    pub async fn run(self) {
        info!("Stream pump started");
        let mut handled = 0u64;
        while let Some(event) = self.receiver.recv().await {
            self.handle(event).await;
            handled += 1;
        }
        info!(handled, dropped = self.receiver.dropped(), "Stream pump stopped");
    }

    pub async fn handle(&self, event: StreamEvent) {
        match event {
            StreamEvent::Snapshot(snapshot) => {
                debug!(symbol = snapshot.symbol(), data_type = %snapshot.data_type(), "Stream snapshot");
                self.store.put_snapshot(snapshot);
            }
            StreamEvent::Candle(candle) => {
                let symbol = candle.symbol.clone();
                match self.store.put_batch(std::slice::from_ref(&candle)).await {
                    Ok(outcome) if !outcome.violations.is_empty() => {
                        warn!(symbol = %symbol, violations = outcome.violations.len(), "Streamed candle conflicts with stored value");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(symbol = %symbol, error = %e, "Failed to persist streamed candle"),
                }
            }
            StreamEvent::Disconnected {
                data_type,
                symbols,
                reason,
            } => {
                self.router.report_stream_failure(data_type, &symbols, &reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use market_data_core::{
        stream_queue, CacheConfig, DataType, RouterConfig, Snapshot, Ticker, TradePrint,
        TradeSide, TradeTape,
    };
    use market_data_store::InMemoryCandleBackend;
    use rust_decimal_macros::dec;

    use crate::rate_limiter::{ChannelRateLimiter, RateLimiterConfig};

    struct NoUpstream;

    #[async_trait::async_trait]
    impl market_data_core::UpstreamProvider for NoUpstream {
        fn max_candles_per_call(&self) -> usize {
            100
        }
        async fn fetch_candles(
            &self,
            _symbol: &str,
            _timeframe: market_data_core::Timeframe,
            _to: chrono::DateTime<Utc>,
            _count: usize,
        ) -> market_data_core::Result<Vec<market_data_core::CandleRecord>> {
            Ok(Vec::new())
        }
        async fn fetch_snapshot(
            &self,
            _data_type: DataType,
            _symbols: &[String],
        ) -> market_data_core::Result<Vec<Snapshot>> {
            Ok(Vec::new())
        }
        async fn subscribe(
            &self,
            _data_type: DataType,
            _symbols: &[String],
            _sink: market_data_core::StreamSink,
        ) -> market_data_core::Result<market_data_core::SubscriptionHandle> {
            Err(market_data_core::DataError::transient("offline"))
        }
        async fn unsubscribe(
            &self,
            _handle: market_data_core::SubscriptionHandle,
        ) -> market_data_core::Result<()> {
            Ok(())
        }
        fn name(&self) -> &str {
            "none"
        }
    }

    fn pump() -> (StreamPump, market_data_core::StreamSink, Arc<CacheStore>) {
        let store = Arc::new(CacheStore::new(
            Arc::new(InMemoryCandleBackend::new()),
            CacheConfig::default().with_trade_tape_len(3),
        ));
        let (sink, receiver) = stream_queue(16);
        let router = Arc::new(ChannelRouter::new(
            RouterConfig::default(),
            Arc::new(NoUpstream),
            sink.clone(),
            Arc::new(ChannelRateLimiter::new("stream", RateLimiterConfig::per_second(5))),
        ));
        (StreamPump::new(Arc::clone(&store), router, receiver), sink, store)
    }

    fn print(id: u64) -> TradePrint {
        TradePrint {
            symbol: "BTC".into(),
            trade_id: id,
            price: dec!(50000),
            size: dec!(0.1),
            side: TradeSide::Buy,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_snapshots_land_in_memory_cache() {
        let (pump, sink, store) = pump();
        sink.push(StreamEvent::Snapshot(Snapshot::Ticker(Ticker {
            symbol: "BTC".into(),
            price: dec!(50010),
            best_bid: None,
            best_ask: None,
            timestamp: Utc::now(),
        })));
        sink.close();
        pump.run().await;

        let cached = store.get_snapshot(DataType::Ticker, "BTC").unwrap();
        assert!(matches!(cached.payload, Snapshot::Ticker(t) if t.price == dec!(50010)));
    }

    #[tokio::test]
    async fn test_streamed_trades_extend_capped_tape() {
        let (pump, _sink, store) = pump();
        for batch in [vec![print(1), print(2)], vec![print(2), print(3), print(4)]] {
            let mut tape = TradeTape::new("BTC");
            tape.trades = batch;
            pump.handle(StreamEvent::Snapshot(Snapshot::Trades(tape))).await;
        }

        let Some(Snapshot::Trades(tape)) = store.get_snapshot(DataType::Trades, "BTC").map(|c| c.payload) else {
            panic!("expected trade tape");
        };
        let ids: Vec<u64> = tape.trades.iter().map(|t| t.trade_id).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&4));
    }
}
