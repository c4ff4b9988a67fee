//! Durable job store for the fusion relayer.
//!
//! Three providers share one capability contract ([`RelayStore`]): the
//! Postgres truth store, the Redis cache store, and the hybrid provider that
//! layers cache reads over truth writes. Provider selection happens once at
//! construction from the [`StoreConfig`] mode tag; the engine only ever holds
//! an `Arc<dyn RelayStore>`.
//!
//! The schema migrator ([`migrate`]) and the archival pipeline ([`archive`])
//! operate on the truth store only.

#![cfg_attr(not(test), forbid(unsafe_code))]
#![warn(missing_docs)]

pub mod archive;
mod cache_stats;
mod config;
mod hybrid;
pub mod migrate;
mod postgres;
mod redis_store;
mod traits;

pub use cache_stats::{CacheCounters, EntityClass};
pub use config::*;
pub use hybrid::HybridStore;
pub use postgres::PostgresStore;
pub use redis_store::RedisStore;
pub use traits::*;
