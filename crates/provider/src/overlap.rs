//! Classifies a requested candle range against what the cache already holds.
//!
//! Only closed candles count as present. Both the request and the stored open
//! times must be bucket-aligned; unaligned requests are rejected rather than
//! adjusted.

use chrono::{DateTime, Utc};
use market_data_core::{
    time_utils, CandleSpan, DataError, FragmentPolicy, Result, TimeRange, Timeframe,
};
use market_data_store::CacheStore;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverlapStatus {
    NoOverlap,
    CompleteOverlap,
    PartialStart,
    PartialMiddleFragment,
    PartialMiddleContinuous,
}

impl fmt::Display for OverlapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoOverlap => "NO_OVERLAP",
            Self::CompleteOverlap => "COMPLETE_OVERLAP",
            Self::PartialStart => "PARTIAL_START",
            Self::PartialMiddleFragment => "PARTIAL_MIDDLE_FRAGMENT",
            Self::PartialMiddleContinuous => "PARTIAL_MIDDLE_CONTINUOUS",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlapResult {
    pub status: OverlapStatus,
    /// The located contiguous block of cached candles, if any.
    pub existing: Option<CandleSpan>,
    /// Ordered, non-overlapping spans still missing.
    pub missing: Vec<CandleSpan>,
    /// Spans recommended for upstream fetching.
    pub fetch_plan: Vec<CandleSpan>,
    pub needs_fetch: bool,
    pub cached_count: usize,
    pub expected_count: usize,
}

/// Classifies sorted, aligned `present` open times against `range`.
///
/// `present` must only contain times inside `range`.
#[must_use]
pub fn classify(
    present: &[DateTime<Utc>],
    range: &TimeRange,
    timeframe: Timeframe,
    expected_count: usize,
    policy: FragmentPolicy,
) -> OverlapResult {
    let span = range.to_span(timeframe);

    let Some(&first_present) = present.first() else {
        return OverlapResult {
            status: OverlapStatus::NoOverlap,
            existing: None,
            missing: vec![span],
            fetch_plan: vec![span],
            needs_fetch: true,
            cached_count: 0,
            expected_count,
        };
    };

    let gaps = time_utils::missing_spans(present, span, timeframe);
    let first_block = time_utils::continuous_run_from(present, first_present, timeframe);
    let single_run = first_block.is_some_and(|run| run.last >= present[present.len() - 1]);

    let result = |status, existing, missing: Vec<CandleSpan>, fetch_plan: Vec<CandleSpan>| {
        OverlapResult {
            status,
            existing,
            needs_fetch: !fetch_plan.is_empty(),
            missing,
            fetch_plan,
            cached_count: present.len(),
            expected_count,
        }
    };

    if single_run && present.len() >= expected_count {
        return result(OverlapStatus::CompleteOverlap, first_block, Vec::new(), Vec::new());
    }

    if gaps.len() >= 2 {
        let plan = match policy {
            FragmentPolicy::FullRefetch => vec![span],
            FragmentPolicy::StitchGaps => gaps.clone(),
        };
        return result(OverlapStatus::PartialMiddleFragment, first_block, gaps, plan);
    }

    if first_present == span.first {
        // the run from the start stops before the end; refetch everything after it
        let run_last = first_block.map_or(span.first, |run| run.last);
        let missing = vec![CandleSpan {
            first: time_utils::step(run_last, timeframe, 1),
            last: span.last,
        }];
        return result(OverlapStatus::PartialStart, first_block, missing.clone(), missing);
    }

    // start absent, one gap: the leading block runs to the end
    let missing = vec![CandleSpan {
        first: span.first,
        last: time_utils::step(first_present, timeframe, -1),
    }];
    result(
        OverlapStatus::PartialMiddleContinuous,
        first_block,
        missing.clone(),
        missing,
    )
}

/// Reads the cache and classifies a request.
pub struct OverlapAnalyzer {
    store: Arc<CacheStore>,
    policy: FragmentPolicy,
}

impl OverlapAnalyzer {
    #[must_use]
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            store,
            policy: FragmentPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: FragmentPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn policy(&self) -> FragmentPolicy {
        self.policy
    }

    /// # Errors
    ///
    /// Returns [`DataError::InvalidRange`] if the range is not aligned to
    /// `timeframe` or `expected_count` is zero or exceeds the buckets in range,
    /// and [`DataError::Storage`] if the cache cannot be read.
    pub async fn analyze(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: &TimeRange,
        expected_count: usize,
    ) -> Result<OverlapResult> {
        if !range.is_aligned(timeframe) {
            return Err(DataError::invalid_range(format!(
                "{range} is not aligned to {timeframe} boundaries"
            )));
        }
        let buckets = range.candle_count(timeframe);
        if expected_count == 0 || expected_count > buckets {
            return Err(DataError::invalid_range(format!(
                "expected_count {expected_count} must be between 1 and {buckets} for {range}"
            )));
        }

        let present = self
            .store
            .closed_open_times(symbol, timeframe, range.start(), range.end())
            .await?;
        let result = classify(&present, range, timeframe, expected_count, self.policy);

        debug!(
            symbol,
            timeframe = %timeframe,
            status = %result.status,
            cached = result.cached_count,
            expected = expected_count,
            gaps = result.missing.len(),
            "Overlap analyzed"
        );
        Ok(result)
    }
}
