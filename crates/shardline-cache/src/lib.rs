//! Hybrid cache for a Shardline shard (`Dragonfly` + in-memory fallback).
//!
//! The external cache is the shared store; the fallback map keeps a local
//! copy of everything written so the shard keeps answering through an
//! external outage. Fallback entries expire by timestamp: lazily on read and
//! in bulk by a periodic sweep, with no per-key timers.
//!
//! # Architecture
//!
//! ```text
//! domain service
//!     |
//!     +-- HybridCache --+--> ExternalCache (DragonflyCache | NullCache)
//!                       |
//!                       +--> FallbackStore (bounded, FIFO eviction, swept)
//! ```
//!
//! # Modules
//!
//! - [`hybrid`] -- get/set/delete, pattern delete, sweep, stats
//! - [`trackers`] -- spam, duplicate-message, and rate-limit windows
//! - [`fallback`] -- the bounded local store and glob matching
//! - [`external`] -- the [`ExternalCache`] capability and [`NullCache`]
//! - [`dragonfly`] -- [`fred`]-backed [`ExternalCache`]
//! - [`error`] -- shared error type

pub mod dragonfly;
pub mod error;
pub mod external;
pub mod fallback;
pub mod hybrid;
pub mod trackers;

// Re-export primary types for convenience.
pub use dragonfly::{DragonflyCache, redact_url};
pub use error::CacheError;
pub use external::{ExternalCache, NullCache, WindowCount};
pub use fallback::{FallbackStore, glob_match};
pub use hybrid::{CacheStats, DEFAULT_MAX_FALLBACK_ENTRIES, DEFAULT_TTL, HybridCache};
pub use trackers::{DuplicateResult, DuplicateTracker, RateLimitDecision, content_hash};
