use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use market_data_core::{DataError, DataType, PushOutcome, StreamEvent, StreamSink, SubscriptionHandle};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::wire;

/// The server drops connections idle for 60s.
const PING_INTERVAL: Duration = Duration::from_secs(50);

pub struct HyperliquidWebSocket {
    ws_url: String,
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl HyperliquidWebSocket {
    #[must_use]
    pub fn new(ws_url: String) -> Self {
        Self { ws_url, stream: None }
    }

    /// Connects to the WebSocket server
    ///
    /// # Errors
    /// Returns error if connection fails or server is unreachable
    pub async fn connect(&mut self) -> Result<()> {
        debug!(url = %self.ws_url, "Attempting WebSocket connection");

        let (ws_stream, response) = connect_async(&self.ws_url).await.map_err(|e| {
            warn!(url = %self.ws_url, error = %e, "WebSocket connection error");
            anyhow::anyhow!("Failed to connect to WebSocket at {}: {}", self.ws_url, e)
        })?;

        self.stream = Some(ws_stream);
        info!(url = %self.ws_url, status = %response.status(), "WebSocket connected");
        Ok(())
    }

    /// # Errors
    /// Returns error if WebSocket is not connected or send fails
    pub async fn send_json(&mut self, payload: &Value) -> Result<()> {
        let Some(stream) = &mut self.stream else {
            anyhow::bail!("WebSocket not connected")
        };
        stream.send(Message::Text(payload.to_string())).await?;
        Ok(())
    }

    /// Waits for the next text frame, pinging the server while idle.
    ///
    /// Returns `Ok(None)` once the server closes the connection.
    ///
    /// # Errors
    /// Returns error if WebSocket is not connected or receive fails
    pub async fn next_message(&mut self) -> Result<Option<String>> {
        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("WebSocket not connected"))?;

            let Ok(next) = tokio::time::timeout(PING_INTERVAL, stream.next()).await else {
                self.send_ping().await?;
                continue;
            };

            match next {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => trace!("Control frame"),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "WebSocket closed by server");
                    self.stream = None;
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(e.into());
                }
                None => {
                    self.stream = None;
                    return Ok(None);
                }
            }
        }
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.send_json(&serde_json::json!({"method": "ping"})).await?;
        trace!("Sent ping to server");
        Ok(())
    }
}

// =============================================================================
// Streamer
// =============================================================================

/// One WebSocket task per subscription, each pushing into the caller's sink.
///
/// Tasks do not reconnect on their own: a dropped socket is reported as a
/// [`StreamEvent::Disconnected`] and the task ends.
pub struct HyperliquidStreamer {
    ws_url: String,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl HyperliquidStreamer {
    #[must_use]
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a socket, subscribes `symbols` and starts forwarding updates.
    ///
    /// # Errors
    /// [`DataError::TransientChannel`] if the socket cannot be opened or the
    /// subscription cannot be sent; [`DataError::Upstream`] for candles, which
    /// this adapter does not stream.
    pub async fn start(
        &self,
        data_type: DataType,
        symbols: &[String],
        sink: StreamSink,
    ) -> market_data_core::Result<SubscriptionHandle> {
        if data_type == DataType::Candles {
            return Err(DataError::upstream("candle streaming is not supported"));
        }

        let mut ws = HyperliquidWebSocket::new(self.ws_url.clone());
        ws.connect()
            .await
            .map_err(|e| DataError::transient(format!("{e:#}")))?;
        for message in subscription_messages(data_type, symbols, "subscribe") {
            ws.send_json(&message)
                .await
                .map_err(|e| DataError::transient(format!("subscribe send failed: {e:#}")))?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(forward(ws, data_type, symbols.to_vec(), sink));
        self.tasks.lock().insert(id, task);
        info!(id, data_type = %data_type, symbols = symbols.len(), "Stream subscription started");
        Ok(SubscriptionHandle(id))
    }

    /// Stops the task behind `handle`. Returns false for unknown handles.
    pub fn stop(&self, handle: SubscriptionHandle) -> bool {
        match self.tasks.lock().remove(&handle.0) {
            Some(task) => {
                task.abort();
                debug!(id = handle.0, "Stream subscription stopped");
                true
            }
            None => false,
        }
    }

    /// Subscriptions whose task is still running.
    #[must_use]
    pub fn active(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.is_finished());
        tasks.len()
    }
}

impl Drop for HyperliquidStreamer {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

/// `allMids` carries every symbol, so tickers need a single subscription.
fn subscription_messages(data_type: DataType, symbols: &[String], method: &str) -> Vec<Value> {
    match data_type {
        DataType::Ticker => symbols
            .first()
            .map(|s| vec![wire::subscription_message(data_type, s, method)])
            .unwrap_or_default(),
        _ => symbols
            .iter()
            .map(|s| wire::subscription_message(data_type, s, method))
            .collect(),
    }
}

async fn forward(mut ws: HyperliquidWebSocket, data_type: DataType, symbols: Vec<String>, sink: StreamSink) {
    let reason = loop {
        match ws.next_message().await {
            Ok(Some(text)) => match wire::parse_ws_message(&text, &symbols, Utc::now()) {
                Ok(events) => {
                    for event in events {
                        if sink.push(event) == PushOutcome::Closed {
                            debug!(data_type = %data_type, "Sink closed, ending stream task");
                            return;
                        }
                    }
                }
                Err(e) => warn!(data_type = %data_type, error = %e, "Skipping unparseable frame"),
            },
            Ok(None) => break "connection closed by server".to_string(),
            Err(e) => break format!("{e:#}"),
        }
    };

    warn!(data_type = %data_type, symbols = ?symbols, reason = %reason, "Stream disconnected");
    sink.push(StreamEvent::Disconnected {
        data_type,
        symbols,
        reason,
    });
}
