//! Cross-shard coordination for Shardline.
//!
//! Shards are peers. The bridge lets one shard notify the others
//! ([`ShardBridge::broadcast`]) and ask all of them a question
//! ([`ShardBridge::request_all`]), aggregating whatever answers arrive
//! before the timeout. Delivery is best-effort and nothing is persisted.
//!
//! # Architecture
//!
//! ```text
//!  shard 0                     pub/sub                      shard N
//! ShardBridge --publish--> {prefix}:request  --> listener --> handler
//!     ^                                                          |
//!     +---- pending[request_id] <-- {prefix}:response <--publish-+
//! ```
//!
//! # Modules
//!
//! - [`bridge`] -- lifecycle, broadcast, fan-out, handlers
//! - [`aggregate`] -- cluster stats and cross-shard lookups
//! - [`message`] -- the [`ShardMessage`] envelope and channel names
//! - [`transport`] -- the [`PubSubTransport`] capability
//! - [`redis`], [`nats`], [`memory`] -- transport implementations
//! - [`error`] -- shared error type

pub mod aggregate;
pub mod bridge;
pub mod error;
pub mod memory;
pub mod message;
pub mod nats;
pub mod redis;
pub mod transport;

// Re-export primary types for convenience.
pub use aggregate::{ClusterStats, FIND_GUILD_REQUEST, FIND_USER_REQUEST, Located, STATS_REQUEST};
pub use bridge::{
    BridgeConfig, BridgeEvent, DEFAULT_REQUEST_TIMEOUT, RequestHandler, ShardBridge, ShardResponse,
};
pub use error::BridgeError;
pub use memory::MemoryTransport;
pub use message::{Channel, ChannelNames, DEFAULT_CHANNEL_PREFIX, ShardMessage};
pub use nats::NatsTransport;
pub use redis::RedisTransport;
pub use transport::{Envelope, MessageStream, PubSubTransport};
