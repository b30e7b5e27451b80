use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Fixed bucket width of a candle series.
///
/// Buckets are aligned to the Unix epoch in UTC, so daily candles open at
/// midnight UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "8h")]
    EightHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1d")]
    OneDay,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown timeframe '{0}', expected one of 1m, 3m, 5m, 15m, 30m, 1h, 2h, 4h, 8h, 12h, 1d")]
pub struct ParseTimeframeError(pub String);

impl Timeframe {
    pub const ALL: [Self; 11] = [
        Self::OneMinute,
        Self::ThreeMinutes,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
        Self::TwoHours,
        Self::FourHours,
        Self::EightHours,
        Self::TwelveHours,
        Self::OneDay,
    ];

    /// Bucket width in seconds.
    #[must_use]
    pub const fn as_secs(self) -> i64 {
        match self {
            Self::OneMinute => 60,
            Self::ThreeMinutes => 3 * 60,
            Self::FiveMinutes => 5 * 60,
            Self::FifteenMinutes => 15 * 60,
            Self::ThirtyMinutes => 30 * 60,
            Self::OneHour => 3600,
            Self::TwoHours => 2 * 3600,
            Self::FourHours => 4 * 3600,
            Self::EightHours => 8 * 3600,
            Self::TwelveHours => 12 * 3600,
            Self::OneDay => 86_400,
        }
    }

    /// Bucket width in milliseconds.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.as_secs() * 1000
    }

    #[must_use]
    pub fn duration(self) -> Duration {
        Duration::seconds(self.as_secs())
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::TwoHours => "2h",
            Self::FourHours => "4h",
            Self::EightHours => "8h",
            Self::TwelveHours => "12h",
            Self::OneDay => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = ParseTimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| ParseTimeframeError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
        assert_eq!("1H".parse::<Timeframe>().unwrap(), Timeframe::OneHour);
    }

    #[test]
    fn test_parse_unknown() {
        let err = "7m".parse::<Timeframe>().unwrap_err();
        assert!(err.to_string().contains("7m"));
    }

    #[test]
    fn test_widths() {
        assert_eq!(Timeframe::OneMinute.as_millis(), 60_000);
        assert_eq!(Timeframe::OneDay.duration(), Duration::days(1));
        assert_eq!(Timeframe::FourHours.as_secs(), 14_400);
    }

    #[test]
    fn test_serde_uses_short_names() {
        let json = serde_json::to_string(&Timeframe::FifteenMinutes).unwrap();
        assert_eq!(json, "\"15m\"");
        let back: Timeframe = serde_json::from_str("\"12h\"").unwrap();
        assert_eq!(back, Timeframe::TwelveHours);
    }
}
