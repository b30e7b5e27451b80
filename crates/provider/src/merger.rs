use market_data_core::{time_utils, CandleKey, CandleRecord, CandleSpan, Timeframe};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Records returned by one chunk call.
#[derive(Debug, Clone)]
pub struct FetchedChunk {
    pub index: usize,
    pub fetched_at: Instant,
    pub records: Vec<CandleRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    /// Ascending, one record per open time.
    pub records: Vec<CandleRecord>,
    /// Spans of the request with no record after merging.
    pub gaps: Vec<CandleSpan>,
    pub duplicates_removed: usize,
    /// Records outside the span, unaligned, or for another timeframe.
    pub discarded: usize,
    pub merged_chunks: usize,
}

/// Merges chunk results for `span`.
///
/// Duplicates resolve to the most recently fetched value. The merged
/// sequence is checked against the expected buckets of `span`.
#[must_use]
pub fn merge_chunks(span: CandleSpan, timeframe: Timeframe, mut chunks: Vec<FetchedChunk>) -> MergeOutcome {
    chunks.sort_by_key(|c| (c.fetched_at, c.index));

    let mut merged: BTreeMap<CandleKey, CandleRecord> = BTreeMap::new();
    let mut outcome = MergeOutcome {
        merged_chunks: chunks.len(),
        ..MergeOutcome::default()
    };

    for record in chunks.into_iter().flat_map(|c| c.records) {
        if record.timeframe != timeframe || !record.is_aligned() || !span.contains(record.open_time) {
            outcome.discarded += 1;
            continue;
        }
        if merged.insert(record.key(), record).is_some() {
            outcome.duplicates_removed += 1;
        }
    }

    let mut records: Vec<CandleRecord> = merged.into_values().collect();
    records.sort_by(|a, b| a.open_time.cmp(&b.open_time).then_with(|| a.symbol.cmp(&b.symbol)));

    let mut present: Vec<_> = records.iter().map(|r| r.open_time).collect();
    present.dedup();
    outcome.gaps = time_utils::missing_spans(&present, span, timeframe);
    outcome.records = records;
    outcome
}
