//! Bucket alignment and expected-sequence helpers.
//!
//! Every comparison between requested ranges and stored candles goes through
//! these functions, so both sides agree on bucket boundaries. Counting always
//! aligns first; there is no public way to count over raw timestamps.

use chrono::{DateTime, Duration, Utc};

use crate::range::CandleSpan;
use crate::timeframe::Timeframe;

/// Floors `time` to the start of its bucket.
#[must_use]
pub fn align_to_boundary(time: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    let millis = time.timestamp_millis();
    let floored = millis - millis.rem_euclid(timeframe.as_millis());
    DateTime::from_timestamp_millis(floored).unwrap_or(time)
}

#[must_use]
pub fn is_aligned(time: DateTime<Utc>, timeframe: Timeframe) -> bool {
    align_to_boundary(time, timeframe) == time
}

/// Moves `time` by `n` buckets (negative goes backwards).
#[must_use]
pub fn step(time: DateTime<Utc>, timeframe: Timeframe, n: i64) -> DateTime<Utc> {
    time + Duration::milliseconds(timeframe.as_millis().saturating_mul(n))
}

/// Iterator over aligned bucket starts between two bounds, inclusive.
///
/// Cloning yields an independent iterator starting where the original was,
/// so a fresh clone taken before iteration restarts the sequence.
#[derive(Debug, Clone)]
pub struct ExpectedSequence {
    next: DateTime<Utc>,
    last: DateTime<Utc>,
    timeframe: Timeframe,
}

impl Iterator for ExpectedSequence {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.last {
            return None;
        }
        let current = self.next;
        self.next = step(current, self.timeframe, 1);
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = count_aligned(self.next, self.last, self.timeframe);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ExpectedSequence {}

/// Aligned bucket starts from `start` to `end`, both floored first.
#[must_use]
pub fn expected_sequence(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    timeframe: Timeframe,
) -> ExpectedSequence {
    ExpectedSequence {
        next: align_to_boundary(start, timeframe),
        last: align_to_boundary(end, timeframe),
        timeframe,
    }
}

/// Number of buckets between `start` and `end` inclusive, after aligning both.
#[must_use]
pub fn candle_count(start: DateTime<Utc>, end: DateTime<Utc>, timeframe: Timeframe) -> usize {
    count_aligned(
        align_to_boundary(start, timeframe),
        align_to_boundary(end, timeframe),
        timeframe,
    )
}

fn count_aligned(first: DateTime<Utc>, last: DateTime<Utc>, timeframe: Timeframe) -> usize {
    if first > last {
        return 0;
    }
    let span = last.timestamp_millis() - first.timestamp_millis();
    usize::try_from(span / timeframe.as_millis() + 1).unwrap_or(usize::MAX)
}

/// Longest uninterrupted run in `sorted` beginning exactly at `start`.
///
/// `sorted` must be ascending and aligned. Returns `None` when `start` itself
/// is absent.
#[must_use]
pub fn continuous_run_from(
    sorted: &[DateTime<Utc>],
    start: DateTime<Utc>,
    timeframe: Timeframe,
) -> Option<CandleSpan> {
    let begin = sorted.binary_search(&start).ok()?;
    let mut last = start;
    for &time in &sorted[begin + 1..] {
        if time == last {
            continue;
        }
        if time != step(last, timeframe, 1) {
            break;
        }
        last = time;
    }
    Some(CandleSpan { first: start, last })
}

/// Ordered, non-overlapping spans of `span` with no entry in `sorted_present`.
///
/// `sorted_present` must be ascending and aligned; entries outside `span` are
/// ignored.
#[must_use]
pub fn missing_spans(
    sorted_present: &[DateTime<Utc>],
    span: CandleSpan,
    timeframe: Timeframe,
) -> Vec<CandleSpan> {
    let mut gaps = Vec::new();
    let mut cursor = span.first;

    for &time in sorted_present {
        if time < cursor {
            continue;
        }
        if time > span.last {
            break;
        }
        if time > cursor {
            gaps.push(CandleSpan {
                first: cursor,
                last: step(time, timeframe, -1),
            });
        }
        cursor = step(time, timeframe, 1);
    }

    if cursor <= span.last {
        gaps.push(CandleSpan {
            first: cursor,
            last: span.last,
        });
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn minute(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, m, 0).unwrap()
    }

    #[test]
    fn test_align_floors_to_bucket() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 13, 47, 29).unwrap();
        assert_eq!(
            align_to_boundary(t, Timeframe::FifteenMinutes),
            Utc.with_ymd_and_hms(2024, 3, 1, 13, 45, 0).unwrap()
        );
        assert_eq!(
            align_to_boundary(t, Timeframe::OneDay),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
        assert!(!is_aligned(t, Timeframe::OneMinute));
        assert!(is_aligned(minute(5), Timeframe::FiveMinutes));
    }

    #[test]
    fn test_align_before_epoch() {
        let t = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 30).unwrap();
        assert_eq!(
            align_to_boundary(t, Timeframe::OneMinute),
            Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 0).unwrap()
        );
    }

    #[test]
    fn test_sub_millisecond_is_unaligned() {
        let t = minute(3) + Duration::nanoseconds(10);
        assert!(!is_aligned(t, Timeframe::OneMinute));
    }

    #[test]
    fn test_expected_sequence_is_restartable() {
        let seq = expected_sequence(minute(10), minute(14), Timeframe::OneMinute);
        assert_eq!(seq.len(), 5);
        let first: Vec<_> = seq.clone().collect();
        let second: Vec<_> = seq.collect();
        assert_eq!(first, second);
        assert_eq!(first.first(), Some(&minute(10)));
        assert_eq!(first.last(), Some(&minute(14)));
    }

    #[test]
    fn test_candle_count_aligns_internally() {
        let start = minute(10) + Duration::seconds(59);
        let end = minute(12) + Duration::seconds(1);
        assert_eq!(candle_count(start, end, Timeframe::OneMinute), 3);
        assert_eq!(candle_count(minute(12), minute(10), Timeframe::OneMinute), 0);
    }

    #[test]
    fn test_continuous_run_from() {
        let present = vec![minute(10), minute(11), minute(13)];
        let run = continuous_run_from(&present, minute(10), Timeframe::OneMinute).unwrap();
        assert_eq!(run.last, minute(11));
        assert!(continuous_run_from(&present, minute(12), Timeframe::OneMinute).is_none());
    }

    #[test]
    fn test_missing_spans() {
        let present = vec![minute(10), minute(11), minute(13)];
        let span = CandleSpan { first: minute(10), last: minute(16) };
        let gaps = missing_spans(&present, span, Timeframe::OneMinute);
        assert_eq!(
            gaps,
            vec![
                CandleSpan::single(minute(12)),
                CandleSpan { first: minute(14), last: minute(16) },
            ]
        );
        assert!(missing_spans(&[minute(10)], CandleSpan::single(minute(10)), Timeframe::OneMinute).is_empty());
    }
}
