use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::CandleRecord;
use crate::snapshot::{DataType, Snapshot};
use crate::stream::StreamSink;
use crate::timeframe::Timeframe;

/// Opaque id of a live upstream subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub u64);

/// The rate-limited external data source.
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Hard cap on candles returned by one `fetch_candles` call.
    fn max_candles_per_call(&self) -> usize;

    /// Returns up to `count` candles ending at the bucket containing `to`,
    /// oldest first.
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        to: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<CandleRecord>>;

    async fn fetch_snapshot(&self, data_type: DataType, symbols: &[String]) -> Result<Vec<Snapshot>>;

    /// Starts pushing `data_type` updates for `symbols` into `sink`.
    async fn subscribe(
        &self,
        data_type: DataType,
        symbols: &[String],
        sink: StreamSink,
    ) -> Result<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;

    fn name(&self) -> &str;
}
