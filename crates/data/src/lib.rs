//! Storage for the market data provider.
//!
//! This crate provides:
//! - The durable candle backend contract with in-memory and `PostgreSQL` implementations
//! - A TTL/LRU memory cache for realtime snapshots
//! - `CacheStore`, the two-tier store the provider reads and writes through
//! - CSV import/export of candles

pub mod backend;
pub mod cache_store;
pub mod csv_storage;
pub mod memory_cache;
pub mod postgres;

pub use backend::{CandleBackend, InMemoryCandleBackend};
pub use cache_store::{CacheStore, CacheStoreStats, IntegrityViolation, PutOutcome};
pub use csv_storage::CsvStorage;
pub use memory_cache::{CacheStats, CachedValue, MemoryCache};
pub use postgres::PgCandleBackend;
