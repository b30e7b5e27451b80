//! Hyperliquid adapter for the smart data provider.
//!
//! [`HyperliquidClient`] implements `UpstreamProvider` over the `/info` REST
//! endpoint and streams `allMids`, `l2Book` and `trades` over WebSocket.

pub mod client;
pub mod websocket;
pub mod wire;

pub use client::{HyperliquidClient, DEFAULT_REQUESTS_PER_SECOND, MAX_CANDLES_PER_CALL};
pub use websocket::{HyperliquidStreamer, HyperliquidWebSocket};
