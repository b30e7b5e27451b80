use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of market data a request or subscription is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Candles,
    Ticker,
    OrderBook,
    Trades,
}

impl DataType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Candles => "candles",
            Self::Ticker => "ticker",
            Self::OrderBook => "order_book",
            Self::Trades => "trades",
        }
    }

    /// Snapshot types are served through the channel router; candles are not.
    #[must_use]
    pub const fn is_snapshot(self) -> bool {
        !matches!(self, Self::Candles)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: Decimal,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Point-in-time view of the book. Bids are sorted descending, asks ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBookSnapshot {
    #[must_use]
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    #[must_use]
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    #[must_use]
    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        Some((bid + ask) / Decimal::TWO)
    }

    /// Spread in basis points of the mid price.
    #[must_use]
    pub fn spread_bps(&self) -> Option<Decimal> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        let mid = self.mid_price()?;
        if mid.is_zero() {
            return None;
        }
        Some((ask - bid) / mid * Decimal::from(10_000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradePrint {
    pub symbol: String,
    pub trade_id: u64,
    pub price: Decimal,
    pub size: Decimal,
    pub side: TradeSide,
    pub timestamp: DateTime<Utc>,
}

/// Recent trades for one symbol, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeTape {
    pub symbol: String,
    pub trades: Vec<TradePrint>,
}

impl TradeTape {
    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            trades: Vec::new(),
        }
    }

    /// Appends prints not already on the tape and keeps the newest `cap`.
    pub fn extend_capped(&mut self, prints: impl IntoIterator<Item = TradePrint>, cap: usize) {
        for print in prints {
            if self.trades.iter().any(|t| t.trade_id == print.trade_id) {
                continue;
            }
            self.trades.push(print);
        }
        self.trades.sort_by_key(|t| (t.timestamp, t.trade_id));
        if self.trades.len() > cap {
            let excess = self.trades.len() - cap;
            self.trades.drain(..excess);
        }
    }
}

/// Any non-candle payload the provider caches in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Snapshot {
    Ticker(Ticker),
    OrderBook(OrderBookSnapshot),
    Trades(TradeTape),
}

impl Snapshot {
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Ticker(t) => &t.symbol,
            Self::OrderBook(b) => &b.symbol,
            Self::Trades(t) => &t.symbol,
        }
    }

    #[must_use]
    pub const fn data_type(&self) -> DataType {
        match self {
            Self::Ticker(_) => DataType::Ticker,
            Self::OrderBook(_) => DataType::OrderBook,
            Self::Trades(_) => DataType::Trades,
        }
    }
}
