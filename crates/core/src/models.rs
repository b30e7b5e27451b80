use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::time_utils;
use crate::timeframe::Timeframe;

/// Storage key of a candle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
}

/// One OHLCV bucket.
///
/// Immutable once `open_time + timeframe <= now`; before that it is the
/// forming candle and may still change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleRecord {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl CandleRecord {
    #[must_use]
    pub fn key(&self) -> CandleKey {
        CandleKey {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            open_time: self.open_time,
        }
    }

    #[must_use]
    pub fn close_time(&self) -> DateTime<Utc> {
        time_utils::step(self.open_time, self.timeframe, 1)
    }

    #[must_use]
    pub fn is_closed_at(&self, now: DateTime<Utc>) -> bool {
        self.close_time() <= now
    }

    #[must_use]
    pub fn is_aligned(&self) -> bool {
        time_utils::is_aligned(self.open_time, self.timeframe)
    }

    /// Describes which OHLCV fields differ from `other`, if any.
    #[must_use]
    pub fn value_mismatch(&self, other: &Self) -> Option<String> {
        let fields = [
            ("open", self.open, other.open),
            ("high", self.high, other.high),
            ("low", self.low, other.low),
            ("close", self.close, other.close),
            ("volume", self.volume, other.volume),
        ];
        let diffs: Vec<String> = fields
            .iter()
            .filter(|(_, a, b)| a != b)
            .map(|(name, a, b)| format!("{name} {a} != {b}"))
            .collect();
        if diffs.is_empty() {
            None
        } else {
            Some(diffs.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn candle() -> CandleRecord {
        CandleRecord {
            symbol: "BTC".to_string(),
            timeframe: Timeframe::OneMinute,
            open_time: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            open: dec!(100),
            high: dec!(110),
            low: dec!(95),
            close: dec!(105),
            volume: dec!(12.5),
        }
    }

    #[test]
    fn test_closed_boundary() {
        let c = candle();
        assert!(!c.is_closed_at(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 59).unwrap()));
        assert!(c.is_closed_at(Utc.with_ymd_and_hms(2024, 3, 1, 10, 1, 0).unwrap()));
    }

    #[test]
    fn test_value_mismatch() {
        let a = candle();
        let mut b = candle();
        assert!(a.value_mismatch(&b).is_none());
        b.close = dec!(106);
        b.volume = dec!(13);
        let detail = a.value_mismatch(&b).unwrap();
        assert!(detail.contains("close 105 != 106"));
        assert!(detail.contains("volume"));
        assert!(!detail.contains("open"));
    }
}
