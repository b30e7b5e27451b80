use market_data_core::{CandleSpan, RequestPriority};
use market_data_store::IntegrityViolation;
use serde::Serialize;
use std::time::Duration;

use crate::overlap::OverlapStatus;
use crate::router::ChannelDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheHit {
    Hit,
    Partial,
    Miss,
}

/// Where the returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    MemoryCache,
    DurableStore,
    Stream,
    Poll,
    /// Cached data combined with freshly fetched data.
    Mixed,
}

/// Freshness and provenance attached to every facade response.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub cache_hit: CacheHit,
    pub source: SourceTier,
    #[serde(serialize_with = "serialize_millis")]
    pub latency: Duration,
    pub split_count: usize,
    pub merge_count: usize,
    pub overlap: Option<OverlapStatus>,
    pub gaps: Vec<CandleSpan>,
    pub integrity_violations: Vec<IntegrityViolation>,
    pub channel: Option<ChannelDecision>,
    /// Served from an entry past its TTL.
    pub stale: bool,
    /// A channel or store failed, or routing is disabled; data may be incomplete.
    pub degraded: bool,
    pub timed_out: bool,
    pub priority: RequestPriority,
}

impl ResponseMetadata {
    #[must_use]
    pub fn new(priority: RequestPriority) -> Self {
        Self {
            cache_hit: CacheHit::Miss,
            source: SourceTier::Poll,
            latency: Duration::ZERO,
            split_count: 0,
            merge_count: 0,
            overlap: None,
            gaps: Vec::new(),
            integrity_violations: Vec::new(),
            channel: None,
            stale: false,
            degraded: false,
            timed_out: false,
            priority,
        }
    }

    /// Complete data, fresh, from a healthy channel.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.gaps.is_empty() && !self.stale && !self.degraded && !self.timed_out
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
    pub metadata: ResponseMetadata,
}
