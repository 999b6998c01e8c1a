//! Resilient data layer for a Shardline shard (`PostgreSQL`).
//!
//! Domain services reach the database only through [`QueryExecutor`], which
//! validates identifiers, routes reads to a replica when safe, retries
//! transient failures, and defers writes while the database is down.
//!
//! # Architecture
//!
//! ```text
//! domain service
//!     |
//!     +-- QueryExecutor ----------> SqlBackend (PostgresPools: primary + replica)
//!             |    ^
//!             |    +-- replays queued writes on recovery
//!             v
//!         DegradationController (health per dependency + FIFO write queue)
//! ```
//!
//! # Modules
//!
//! - [`executor`] -- the executor, CRUD helpers, `safe_*` writes, status
//! - [`degradation`] -- health state machine and write queue
//! - [`retry`] -- exponential backoff with jitter
//! - [`classify`] -- transient-error classification (SQLSTATE + message)
//! - [`statement`] -- parameterized CRUD statement builder
//! - [`identifiers`] -- table allow-list and identifier validation
//! - [`routing`] -- replica-safety check and pool selection
//! - [`backend`] -- the [`SqlBackend`] seam and pool statistics
//! - [`postgres`] -- `sqlx` pools implementing [`SqlBackend`]
//! - [`error`] -- shared error type

pub mod backend;
pub mod classify;
pub mod degradation;
pub mod error;
pub mod executor;
pub mod identifiers;
pub mod postgres;
pub mod retry;
pub mod routing;
pub mod statement;

// Re-export primary types for convenience.
pub use backend::{PoolStats, SqlBackend};
pub use degradation::{
    DegradationController, DependencyHealth, DependencySnapshot, QueuedWrite, ReplayReport,
    WriteOperation, WriteQueueEntry, WriteReplayer,
};
pub use error::DbError;
pub use executor::{
    DATABASE, DatabaseStatus, ExecuteOptions, QueryExecutor, ReadOptions, ReplicaStatus,
    WriteOutcome,
};
pub use postgres::{PostgresConfig, PostgresPools};
pub use retry::{RetryConfig, retry_with_backoff};
pub use routing::PoolTarget;
pub use statement::{Record, Row, SqlValue, Statement, record};
