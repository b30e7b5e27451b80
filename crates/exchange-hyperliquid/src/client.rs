use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use market_data_core::{
    time_utils, CandleRecord, DataError, DataType, Result, Snapshot, StreamSink,
    SubscriptionHandle, Timeframe, TradeTape, UpstreamConfig, UpstreamProvider,
};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::websocket::HyperliquidStreamer;
use crate::wire;

/// 1200 request weight per minute.
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 20;

/// `candleSnapshot` returns at most this many candles.
pub const MAX_CANDLES_PER_CALL: usize = 5000;

pub struct HyperliquidClient {
    http_client: Client,
    info_url: Url,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    max_candles_per_call: usize,
    streamer: HyperliquidStreamer,
}

impl HyperliquidClient {
    /// # Errors
    /// Returns error if either URL is invalid.
    pub fn new(api_url: &str, ws_url: &str) -> anyhow::Result<Self> {
        Self::with_http_client(api_url, ws_url, Client::new())
    }

    /// Builds a client with the configured timeout and per-call limit.
    ///
    /// # Errors
    /// Returns error if a URL is invalid or the HTTP client cannot be built.
    pub fn from_config(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;
        let mut client = Self::with_http_client(&config.api_url, &config.ws_url, http_client)?;
        client.max_candles_per_call = config.max_candles_per_call.clamp(1, MAX_CANDLES_PER_CALL);
        Ok(client)
    }

    fn with_http_client(api_url: &str, ws_url: &str, http_client: Client) -> anyhow::Result<Self> {
        let info_url = Url::parse(api_url)
            .and_then(|base| base.join("/info"))
            .with_context(|| format!("Invalid Hyperliquid API URL: {api_url}"))?;
        let ws = Url::parse(ws_url).with_context(|| format!("Invalid Hyperliquid WebSocket URL: {ws_url}"))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            anyhow::bail!("WebSocket URL must use ws:// or wss://, got {ws_url}");
        }

        Ok(Self {
            http_client,
            info_url,
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(DEFAULT_REQUESTS_PER_SECOND).unwrap_or(NonZeroU32::MIN),
            ))),
            max_candles_per_call: MAX_CANDLES_PER_CALL,
            streamer: HyperliquidStreamer::new(ws.as_str()),
        })
    }

    #[must_use]
    pub fn with_rate_limit(mut self, requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        self.rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));
        self
    }

    #[must_use]
    pub fn info_url(&self) -> &Url {
        &self.info_url
    }

    #[must_use]
    pub fn streamer(&self) -> &HyperliquidStreamer {
        &self.streamer
    }

    /// POSTs `body` to `/info`.
    ///
    /// # Errors
    /// [`DataError::TransientChannel`] for network failures, timeouts, 429 and
    /// 5xx responses; [`DataError::Upstream`] for other failures.
    pub async fn post_info(&self, body: &Value) -> Result<Value> {
        self.rate_limiter.until_ready().await;
        let response = self
            .http_client
            .post(self.info_url.clone())
            .json(body)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }
        response.json().await.map_err(map_request_error)
    }
}

/// Maps an HTTP status to a provider error.
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> DataError {
    let message = format!("Hyperliquid /info returned {status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        DataError::transient(message)
    } else {
        DataError::upstream(message)
    }
}

fn map_request_error(e: reqwest::Error) -> DataError {
    if let Some(status) = e.status() {
        return classify_status(status, &e.to_string());
    }
    if e.is_timeout() || e.is_connect() || e.is_request() {
        DataError::transient(format!("Hyperliquid request failed: {e}"))
    } else {
        DataError::upstream(format!("Hyperliquid response invalid: {e}"))
    }
}

#[async_trait]
impl UpstreamProvider for HyperliquidClient {
    fn max_candles_per_call(&self) -> usize {
        self.max_candles_per_call
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        to: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<CandleRecord>> {
        let count = count.clamp(1, self.max_candles_per_call);
        let (start_ms, end_ms) = wire::candle_window(to, timeframe, count);
        let body = wire::candle_snapshot_request(symbol, timeframe, start_ms, end_ms);

        let mut records = wire::parse_candles(symbol, timeframe, self.post_info(&body).await?)?;
        let last = time_utils::align_to_boundary(to, timeframe);
        records.retain(|r| r.open_time.timestamp_millis() >= start_ms && r.open_time <= last);
        if records.len() > count {
            records.drain(..records.len() - count);
        }

        debug!(symbol, timeframe = %timeframe, requested = count, received = records.len(), "Fetched candles");
        Ok(records)
    }

    async fn fetch_snapshot(&self, data_type: DataType, symbols: &[String]) -> Result<Vec<Snapshot>> {
        match data_type {
            DataType::Ticker => {
                let body = wire::snapshot_request(DataType::Ticker, "");
                let mids = self.post_info(&body).await?;
                Ok(wire::parse_all_mids(mids, symbols, Utc::now())?
                    .into_iter()
                    .map(Snapshot::Ticker)
                    .collect())
            }
            DataType::OrderBook => {
                let mut out = Vec::with_capacity(symbols.len());
                for symbol in symbols {
                    let body = wire::snapshot_request(DataType::OrderBook, symbol);
                    out.push(Snapshot::OrderBook(wire::parse_l2_book(self.post_info(&body).await?)?));
                }
                Ok(out)
            }
            DataType::Trades => {
                let mut out = Vec::with_capacity(symbols.len());
                for symbol in symbols {
                    let body = wire::snapshot_request(DataType::Trades, symbol);
                    let mut tape = TradeTape::new(symbol.clone());
                    tape.trades = wire::parse_trades(self.post_info(&body).await?)?;
                    tape.trades.sort_by_key(|t| (t.timestamp, t.trade_id));
                    out.push(Snapshot::Trades(tape));
                }
                Ok(out)
            }
            DataType::Candles => Err(DataError::upstream("candles are not a snapshot type")),
        }
    }

    async fn subscribe(
        &self,
        data_type: DataType,
        symbols: &[String],
        sink: StreamSink,
    ) -> Result<SubscriptionHandle> {
        self.streamer.start(data_type, symbols, sink).await
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        if !self.streamer.stop(handle) {
            warn!(id = handle.0, "Unsubscribe for unknown handle");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "hyperliquid"
    }
}
