use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::{DataError, Result};
use crate::time_utils;
use crate::timeframe::Timeframe;

/// Requested time range, inclusive at both ends.
///
/// A range covers every bucket whose open time `t` satisfies
/// `start <= t <= end`. `start < end` is enforced at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    /// Creates a range without touching alignment.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::InvalidRange`] if `start >= end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(DataError::invalid_range(format!(
                "start {start} must be before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Floors both ends to `timeframe` and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::InvalidRange`] if the aligned ends collapse onto
    /// the same bucket or are reversed.
    pub fn aligned(start: DateTime<Utc>, end: DateTime<Utc>, timeframe: Timeframe) -> Result<Self> {
        Self::new(
            time_utils::align_to_boundary(start, timeframe),
            time_utils::align_to_boundary(end, timeframe),
        )
    }

    #[must_use]
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> DateTime<Utc> {
        self.end
    }

    #[must_use]
    pub fn is_aligned(&self, timeframe: Timeframe) -> bool {
        time_utils::is_aligned(self.start, timeframe) && time_utils::is_aligned(self.end, timeframe)
    }

    /// Number of buckets covered once both ends are aligned.
    #[must_use]
    pub fn candle_count(&self, timeframe: Timeframe) -> usize {
        time_utils::candle_count(self.start, self.end, timeframe)
    }

    #[must_use]
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time <= self.end
    }

    /// Aligned span of buckets covered by this range.
    #[must_use]
    pub fn to_span(&self, timeframe: Timeframe) -> CandleSpan {
        CandleSpan {
            first: time_utils::align_to_boundary(self.start, timeframe),
            last: time_utils::align_to_boundary(self.end, timeframe),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} .. {}]", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Inclusive run of aligned buckets `first..=last`.
///
/// Unlike [`TimeRange`] a span may cover a single bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CandleSpan {
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

impl CandleSpan {
    /// # Errors
    ///
    /// Returns [`DataError::InvalidRange`] if `first > last`.
    pub fn new(first: DateTime<Utc>, last: DateTime<Utc>) -> Result<Self> {
        if first > last {
            return Err(DataError::invalid_range(format!(
                "span start {first} is after span end {last}"
            )));
        }
        Ok(Self { first, last })
    }

    #[must_use]
    pub const fn single(at: DateTime<Utc>) -> Self {
        Self { first: at, last: at }
    }

    #[must_use]
    pub fn count(&self, timeframe: Timeframe) -> usize {
        time_utils::candle_count(self.first, self.last, timeframe)
    }

    #[must_use]
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.first <= time && time <= self.last
    }
}

impl fmt::Display for CandleSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first.to_rfc3339())
        } else {
            write!(f, "{}..={}", self.first.to_rfc3339(), self.last.to_rfc3339())
        }
    }
}
