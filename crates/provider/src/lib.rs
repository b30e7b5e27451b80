//! Smart data provider.
//!
//! Cache-first access to candles and realtime snapshots:
//! - Overlap analysis decides which candle spans still need fetching
//! - Oversized fetches are split into upstream-sized chunks and merged
//! - A per-key router chooses between the push stream and polling, with
//!   reconnect, probe and disable fallback tiers
//! - A priority scheduler keeps CRITICAL work off the shared worker pool

pub mod facade;
pub mod frequency;
pub mod merger;
pub mod metadata;
pub mod overlap;
pub mod pump;
pub mod rate_limiter;
pub mod router;
pub mod scheduler;
pub mod splitter;

pub use facade::{ProviderStats, RequestOptions, SmartDataProvider};
pub use frequency::FrequencyEstimator;
pub use merger::{merge_chunks, FetchedChunk, MergeOutcome};
pub use metadata::{CacheHit, DataResponse, ResponseMetadata, SourceTier};
pub use overlap::{classify, OverlapAnalyzer, OverlapResult, OverlapStatus};
pub use pump::StreamPump;
pub use rate_limiter::{ChannelRateLimiter, RateLimiterConfig, RateLimiterStats};
pub use router::{
    Channel, ChannelDecision, ChannelRouter, DecisionReason, RouteSnapshot, StateEvent,
    SubscriptionState,
};
pub use scheduler::{PriorityScheduler, SchedulerStats};
pub use splitter::{BatchFetcher, ChunkCollector, ChunkRequest, FetchReport, RequestSplitter};
