pub mod config;
pub mod config_loader;
pub mod error;
pub mod models;
pub mod priority;
pub mod range;
pub mod snapshot;
pub mod stream;
pub mod time_utils;
pub mod timeframe;
pub mod traits;

pub use config::{
    AppConfig, CacheConfig, DatabaseConfig, FacadeConfig, FragmentPolicy, RouterConfig,
    SchedulerConfig, SplitterConfig, UpstreamConfig,
};
pub use config_loader::ConfigLoader;
pub use error::{DataError, Result};
pub use models::{CandleKey, CandleRecord};
pub use priority::RequestPriority;
pub use range::{CandleSpan, TimeRange};
pub use snapshot::{
    DataType, OrderBookSnapshot, PriceLevel, Snapshot, Ticker, TradePrint, TradeSide, TradeTape,
};
pub use stream::{stream_queue, PushOutcome, StreamEvent, StreamReceiver, StreamSink};
pub use timeframe::{ParseTimeframeError, Timeframe};
pub use traits::{SubscriptionHandle, UpstreamProvider};
