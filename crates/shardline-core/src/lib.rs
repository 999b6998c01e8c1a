//! Configuration, composition root, and maintenance loops for a Shardline
//! shard.
//!
//! A worker process loads a [`ShardlineConfig`], builds one
//! [`ShardContext`] from it, and starts its [`Maintenance`] loops. Domain
//! services then receive the context by reference and reach the database,
//! the cache, and the other shards only through it.
//!
//! # Modules
//!
//! - [`config`] -- YAML configuration with environment overrides.
//! - [`context`] -- [`ShardContext`], wiring executor, cache, and bridge to
//!   their configured (or fallback) implementations.
//! - [`maintenance`] -- cache sweeper and database health loop.

pub mod config;
pub mod context;
pub mod maintenance;

pub use config::{
    BridgeSettings, CacheConfig, ConfigError, DatabaseConfig, LogFormat, LoggingConfig,
    RetrySettings, ShardConfig, ShardlineConfig, TransportKind,
};
pub use context::ShardContext;
pub use maintenance::{Maintenance, health_tick, spawn_health_loop};
