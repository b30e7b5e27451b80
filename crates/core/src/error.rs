//! Error taxonomy for the market data provider.
//!
//! Only [`DataError::InvalidRange`] and [`DataError::DataUnavailable`] ever
//! reach callers of the facade. Channel, storage and upstream failures are
//! absorbed inside the provider and surface as response metadata instead.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::snapshot::DataType;
use crate::timeframe::Timeframe;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors produced by the provider and its collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DataError {
    /// Caller misuse: reversed, empty or unaligned range. Never retried.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Network, timeout or rate-limit failure on a channel.
    #[error("transient channel error: {0}")]
    TransientChannel(String),

    /// Fetched values disagree with an already-closed candle.
    #[error("data integrity error for {symbol} {timeframe} at {open_time}: {detail}")]
    DataIntegrity {
        /// Symbol of the conflicting candle.
        symbol: String,
        /// Timeframe of the conflicting candle.
        timeframe: Timeframe,
        /// Bucket start of the conflicting candle.
        open_time: DateTime<Utc>,
        /// Which values differ.
        detail: String,
    },

    /// Every fallback tier was exhausted without producing data.
    #[error("data unavailable for {symbol} ({data_type}): {reason}")]
    DataUnavailable {
        /// Requested symbol.
        symbol: String,
        /// Requested data type.
        data_type: DataType,
        /// Last failure observed.
        reason: String,
    },

    /// Durable backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Non-transient upstream failure (bad payload, unsupported request).
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl DataError {
    /// Creates an invalid range error.
    pub fn invalid_range(message: impl Into<String>) -> Self {
        Self::InvalidRange(message.into())
    }

    /// Creates a transient channel error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientChannel(message.into())
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Creates an upstream error.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    /// Creates a data unavailable error.
    pub fn unavailable(
        symbol: impl Into<String>,
        data_type: DataType,
        reason: impl Into<String>,
    ) -> Self {
        Self::DataUnavailable {
            symbol: symbol.into(),
            data_type,
            reason: reason.into(),
        }
    }

    /// Returns true if retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientChannel(_))
    }

    /// Returns true for errors caused by the caller rather than the system.
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidRange(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DataError::transient("socket reset").is_transient());
        assert!(!DataError::storage("disk full").is_transient());
        assert!(!DataError::invalid_range("start >= end").is_transient());
        assert!(DataError::invalid_range("start >= end").is_caller_error());
    }

    #[test]
    fn test_unavailable_display() {
        let err = DataError::unavailable("BTC", DataType::OrderBook, "all tiers exhausted");
        let text = err.to_string();
        assert!(text.contains("BTC"));
        assert!(text.contains("order_book"));
        assert!(text.contains("all tiers exhausted"));
    }
}
