//! Hyperliquid `/info` and WebSocket payloads and their conversion into
//! provider types.

use chrono::{DateTime, Utc};
use market_data_core::{
    time_utils, CandleRecord, DataError, DataType, OrderBookSnapshot, PriceLevel, Result,
    Snapshot, StreamEvent, Ticker, Timeframe, TradePrint, TradeSide, TradeTape,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

// =============================================================================
// Requests
// =============================================================================

/// Inclusive millisecond window covering `count` buckets ending at the bucket
/// that contains `to`.
#[must_use]
pub fn candle_window(to: DateTime<Utc>, timeframe: Timeframe, count: usize) -> (i64, i64) {
    let last = time_utils::align_to_boundary(to, timeframe);
    let first = time_utils::step(last, timeframe, 1 - count.max(1) as i64);
    (
        first.timestamp_millis(),
        last.timestamp_millis() + timeframe.as_millis() - 1,
    )
}

#[must_use]
pub fn candle_snapshot_request(symbol: &str, timeframe: Timeframe, start_ms: i64, end_ms: i64) -> Value {
    json!({
        "type": "candleSnapshot",
        "req": {
            "coin": symbol,
            "interval": timeframe.as_str(),
            "startTime": start_ms,
            "endTime": end_ms
        }
    })
}

/// `/info` request body for one snapshot kind. Tickers come from `allMids`,
/// which covers every symbol at once.
#[must_use]
pub fn snapshot_request(data_type: DataType, symbol: &str) -> Value {
    match data_type {
        DataType::OrderBook => json!({ "type": "l2Book", "coin": symbol }),
        DataType::Trades => json!({ "type": "recentTrades", "coin": symbol }),
        DataType::Ticker | DataType::Candles => json!({ "type": "allMids" }),
    }
}

/// WebSocket subscription message for one symbol.
#[must_use]
pub fn subscription_message(data_type: DataType, symbol: &str, method: &str) -> Value {
    let subscription = match data_type {
        DataType::OrderBook => json!({ "type": "l2Book", "coin": symbol }),
        DataType::Trades => json!({ "type": "trades", "coin": symbol }),
        DataType::Ticker | DataType::Candles => json!({ "type": "allMids" }),
    };
    json!({ "method": method, "subscription": subscription })
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct WireCandle {
    /// Open time, ms.
    pub t: i64,
    #[serde(rename = "T")]
    pub close_time: Option<i64>,
    pub o: Decimal,
    pub h: Decimal,
    pub l: Decimal,
    pub c: Decimal,
    pub v: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireLevel {
    pub px: Decimal,
    pub sz: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireBook {
    pub coin: String,
    pub time: i64,
    pub levels: (Vec<WireLevel>, Vec<WireLevel>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireTrade {
    pub coin: String,
    pub side: String,
    pub px: Decimal,
    pub sz: Decimal,
    pub time: i64,
    pub tid: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct WireMids {
    mids: HashMap<String, Decimal>,
}

fn millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DataError::upstream(format!("timestamp out of range: {ms}")))
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| DataError::upstream(format!("bad {what} payload: {e}")))
}

// =============================================================================
// Conversions
// =============================================================================

/// Parses a `candleSnapshot` response, oldest first.
///
/// # Errors
/// Returns [`DataError::Upstream`] if the payload is malformed.
pub fn parse_candles(symbol: &str, timeframe: Timeframe, value: Value) -> Result<Vec<CandleRecord>> {
    let wire: Vec<WireCandle> = decode(value, "candleSnapshot")?;
    let mut records = wire
        .into_iter()
        .map(|c| {
            Ok(CandleRecord {
                symbol: symbol.to_string(),
                timeframe,
                open_time: millis(c.t)?,
                open: c.o,
                high: c.h,
                low: c.l,
                close: c.c,
                volume: c.v,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    records.sort_by_key(|r| r.open_time);
    Ok(records)
}

/// Tickers for `symbols` out of an `allMids` map. Unknown symbols are skipped.
///
/// # Errors
/// Returns [`DataError::Upstream`] if the payload is malformed.
pub fn parse_all_mids(value: Value, symbols: &[String], at: DateTime<Utc>) -> Result<Vec<Ticker>> {
    let mids: HashMap<String, Decimal> = decode(value, "allMids")?;
    Ok(tickers_from_mids(&mids, symbols, at))
}

fn tickers_from_mids(mids: &HashMap<String, Decimal>, symbols: &[String], at: DateTime<Utc>) -> Vec<Ticker> {
    symbols
        .iter()
        .filter_map(|symbol| {
            mids.get(symbol).map(|price| Ticker {
                symbol: symbol.clone(),
                price: *price,
                best_bid: None,
                best_ask: None,
                timestamp: at,
            })
        })
        .collect()
}

/// # Errors
/// Returns [`DataError::Upstream`] if the payload is malformed.
pub fn parse_l2_book(value: Value) -> Result<OrderBookSnapshot> {
    let wire: WireBook = decode(value, "l2Book")?;
    let level = |l: WireLevel| PriceLevel { price: l.px, size: l.sz };
    let (bids, asks) = wire.levels;
    Ok(OrderBookSnapshot {
        symbol: wire.coin,
        bids: bids.into_iter().map(level).collect(),
        asks: asks.into_iter().map(level).collect(),
        timestamp: millis(wire.time)?,
    })
}

/// # Errors
/// Returns [`DataError::Upstream`] if the payload is malformed.
pub fn parse_trades(value: Value) -> Result<Vec<TradePrint>> {
    let wire: Vec<WireTrade> = decode(value, "trades")?;
    wire.into_iter()
        .map(|t| {
            Ok(TradePrint {
                symbol: t.coin,
                trade_id: t.tid,
                price: t.px,
                size: t.sz,
                // "B" is an aggressive buy, "A" an aggressive sell
                side: if t.side == "B" { TradeSide::Buy } else { TradeSide::Sell },
                timestamp: millis(t.time)?,
            })
        })
        .collect()
}

/// Converts one WebSocket text frame into stream events for `symbols`.
///
/// Control frames (`subscriptionResponse`, `pong`) and other channels yield
/// nothing.
///
/// # Errors
/// Returns [`DataError::Upstream`] if the frame is not valid JSON or a data
/// channel payload is malformed.
pub fn parse_ws_message(text: &str, symbols: &[String], at: DateTime<Utc>) -> Result<Vec<StreamEvent>> {
    let mut frame: Value = serde_json::from_str(text)
        .map_err(|e| DataError::upstream(format!("bad websocket frame: {e}")))?;
    let channel = frame
        .get("channel")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let data = frame.get_mut("data").map(Value::take).unwrap_or(Value::Null);

    let snapshots = match channel.as_str() {
        "allMids" => {
            let wire: WireMids = decode(data, "allMids")?;
            tickers_from_mids(&wire.mids, symbols, at)
                .into_iter()
                .map(Snapshot::Ticker)
                .collect()
        }
        "l2Book" => {
            let book = parse_l2_book(data)?;
            if symbols.contains(&book.symbol) {
                vec![Snapshot::OrderBook(book)]
            } else {
                Vec::new()
            }
        }
        "trades" => {
            let mut by_symbol: HashMap<String, TradeTape> = HashMap::new();
            for print in parse_trades(data)? {
                if symbols.contains(&print.symbol) {
                    by_symbol
                        .entry(print.symbol.clone())
                        .or_insert_with(|| TradeTape::new(print.symbol.clone()))
                        .trades
                        .push(print);
                }
            }
            by_symbol.into_values().map(Snapshot::Trades).collect()
        }
        _ => Vec::new(),
    };
    Ok(snapshots.into_iter().map(StreamEvent::Snapshot).collect())
}
