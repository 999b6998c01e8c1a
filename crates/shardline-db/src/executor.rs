//! The resilient query executor.
//!
//! [`QueryExecutor`] is what domain services talk to. Every call:
//!
//! 1. validates table and column names (CRUD helpers only), before anything
//!    touches the network;
//! 2. routes the statement to the replica when it is a plain read, else to
//!    the primary;
//! 3. retries transient failures with jittered exponential backoff;
//! 4. reports the outcome to the [`DegradationController`]: success resets
//!    the failure counter, an exhausted transient failure counts toward
//!    `Unavailable`.
//!
//! The `safe_*` write variants check health first. While the database is
//! `Unavailable`, or older deferred writes have not been replayed yet, they
//! queue the write and return [`WriteOutcome::Queued`] instead of failing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::backend::{PoolStats, SqlBackend};
use crate::classify;
use crate::degradation::{
    DegradationController, DependencyHealth, QueuedWrite, ReplayReport, WriteOperation,
    WriteQueueEntry,
    WriteReplayer,
};
use crate::error::DbError;
use crate::retry::{RetryConfig, retry_with_backoff};
use crate::routing::{PoolTarget, route};
use crate::statement::{self, Record, Row, SqlValue, Statement};

/// Dependency name the executor reports under.
pub const DATABASE: &str = "database";

/// Queries slower than this are logged.
pub const DEFAULT_SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(1_000);

/// Longest SQL prefix included in slow-query and failure logs.
const LOGGED_SQL_CHARS: usize = 200;

/// Per-call overrides for [`QueryExecutor::execute`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Retry budget for this call instead of the executor's.
    pub retries: Option<u32>,
    /// Make exactly one attempt.
    pub no_retry: bool,
    /// Never route to the replica.
    pub use_primary: bool,
}

impl ExecuteOptions {
    /// Override the retry budget.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Disable retries.
    #[must_use]
    pub const fn no_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }

    /// Force the primary pool.
    #[must_use]
    pub const fn primary(mut self) -> Self {
        self.use_primary = true;
        self
    }
}

/// Options for [`QueryExecutor::get_one`] and [`QueryExecutor::get_many`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Read from the primary, e.g. right after a write.
    pub use_primary: bool,
}

impl From<ReadOptions> for ExecuteOptions {
    fn from(options: ReadOptions) -> Self {
        Self {
            use_primary: options.use_primary,
            ..Self::default()
        }
    }
}

/// Result of a `safe_*` write.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// The write ran; these are the rows it returned.
    Applied(Vec<Row>),
    /// The database was unavailable or still replaying; the write was
    /// queued behind the older deferred writes.
    Queued(QueuedWrite),
}

impl WriteOutcome {
    /// Whether the write was deferred.
    pub const fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}

/// Replica section of [`DatabaseStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    /// Whether a replica pool is configured and connected.
    pub enabled: bool,
    /// Replica host, if any.
    pub host: Option<String>,
}

/// Health surface for external health-check consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    /// False only while the database is `Unavailable`.
    pub is_connected: bool,
    /// Current health.
    pub state: DependencyHealth,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// Failures needed to become `Unavailable`.
    pub max_failures: u32,
    /// Writes waiting for replay.
    pub pending_writes: usize,
    /// Replica details.
    pub read_replica: ReplicaStatus,
    /// The executor's retry policy.
    pub retry_config: RetryConfig,
    /// Attempts that took at least the slow-query threshold since startup.
    pub slow_queries: u64,
}

/// Retrying, routing, degradation-aware database client.
#[derive(Clone)]
pub struct QueryExecutor {
    backend: Arc<dyn SqlBackend>,
    controller: Arc<DegradationController>,
    retry: RetryConfig,
    slow_query_threshold: Duration,
    slow_queries: Arc<AtomicU64>,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("retry", &self.retry)
            .field("slow_query_threshold", &self.slow_query_threshold)
            .field("has_replica", &self.backend.has_replica())
            .finish_non_exhaustive()
    }
}

impl QueryExecutor {
    /// Create an executor over `backend` reporting to `controller`.
    pub fn new(backend: Arc<dyn SqlBackend>, controller: Arc<DegradationController>) -> Self {
        Self {
            backend,
            controller,
            retry: RetryConfig::default(),
            slow_query_threshold: DEFAULT_SLOW_QUERY_THRESHOLD,
            slow_queries: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the slow-query threshold.
    #[must_use]
    pub const fn with_slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    /// The controller this executor reports to.
    pub fn controller(&self) -> &Arc<DegradationController> {
        &self.controller
    }

    /// The retry policy.
    pub const fn retry_config(&self) -> RetryConfig {
        self.retry
    }

    // =========================================================================
    // Raw statements
    // =========================================================================

    /// Run caller-supplied SQL with bound parameters.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or the last transient error
    /// once the retry budget is spent.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: ExecuteOptions,
    ) -> Result<Vec<Row>, DbError> {
        let statement = Statement::new(sql, params.to_vec());
        self.run(&statement, options).await
    }

    /// First row of a read, if any.
    ///
    /// # Errors
    ///
    /// Same as [`QueryExecutor::execute`].
    pub async fn get_one(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: ReadOptions,
    ) -> Result<Option<Row>, DbError> {
        let rows = self.execute(sql, params, options.into()).await?;
        Ok(rows.into_iter().next())
    }

    /// Every row of a read.
    ///
    /// # Errors
    ///
    /// Same as [`QueryExecutor::execute`].
    pub async fn get_many(
        &self,
        sql: &str,
        params: &[SqlValue],
        options: ReadOptions,
    ) -> Result<Vec<Row>, DbError> {
        self.execute(sql, params, options.into()).await
    }

    // =========================================================================
    // CRUD helpers
    // =========================================================================

    /// Insert one row and return it.
    ///
    /// # Errors
    ///
    /// Validation errors are returned before any network call. Otherwise
    /// the same as [`QueryExecutor::execute`].
    pub async fn insert(&self, table: &str, data: &Record) -> Result<Option<Row>, DbError> {
        let statement = statement::insert(table, data)?;
        Ok(self.write(&statement).await?.into_iter().next())
    }

    /// Update matching rows and return them.
    ///
    /// # Errors
    ///
    /// Same as [`QueryExecutor::insert`]; an empty predicate is refused.
    pub async fn update(
        &self,
        table: &str,
        data: &Record,
        predicate: &Record,
    ) -> Result<Vec<Row>, DbError> {
        let statement = statement::update(table, data, predicate)?;
        self.write(&statement).await
    }

    /// Insert or update on `conflict_key` and return the resulting row.
    ///
    /// # Errors
    ///
    /// Same as [`QueryExecutor::insert`]; the conflict key is validated too.
    pub async fn upsert(
        &self,
        table: &str,
        data: &Record,
        conflict_key: &[String],
    ) -> Result<Option<Row>, DbError> {
        let statement = statement::upsert(table, data, conflict_key)?;
        Ok(self.write(&statement).await?.into_iter().next())
    }

    /// Delete matching rows and return them.
    ///
    /// # Errors
    ///
    /// Same as [`QueryExecutor::insert`]; an empty predicate is refused.
    pub async fn delete(&self, table: &str, predicate: &Record) -> Result<Vec<Row>, DbError> {
        let statement = statement::delete(table, predicate)?;
        self.write(&statement).await
    }

    // =========================================================================
    // Degraded writes
    // =========================================================================

    /// [`QueryExecutor::insert`], or queue it while the database is down.
    ///
    /// # Errors
    ///
    /// Validation errors always surface. Execution errors surface only when
    /// the write was attempted.
    pub async fn safe_insert(&self, table: &str, data: &Record) -> Result<WriteOutcome, DbError> {
        let statement = statement::insert(table, data)?;
        self.safe_write(&statement, || WriteQueueEntry::insert(table, data.clone()))
            .await
    }

    /// [`QueryExecutor::update`], or queue it while the database is down.
    ///
    /// # Errors
    ///
    /// See [`QueryExecutor::safe_insert`].
    pub async fn safe_update(
        &self,
        table: &str,
        data: &Record,
        predicate: &Record,
    ) -> Result<WriteOutcome, DbError> {
        let statement = statement::update(table, data, predicate)?;
        self.safe_write(&statement, || {
            WriteQueueEntry::update(table, data.clone(), predicate.clone())
        })
        .await
    }

    /// [`QueryExecutor::upsert`], or queue it while the database is down.
    ///
    /// # Errors
    ///
    /// See [`QueryExecutor::safe_insert`].
    pub async fn safe_upsert(
        &self,
        table: &str,
        data: &Record,
        conflict_key: &[String],
    ) -> Result<WriteOutcome, DbError> {
        let statement = statement::upsert(table, data, conflict_key)?;
        self.safe_write(&statement, || {
            WriteQueueEntry::upsert(table, data.clone(), conflict_key.to_vec())
        })
        .await
    }

    /// [`QueryExecutor::delete`], or queue it while the database is down.
    ///
    /// # Errors
    ///
    /// See [`QueryExecutor::safe_insert`].
    pub async fn safe_delete(
        &self,
        table: &str,
        predicate: &Record,
    ) -> Result<WriteOutcome, DbError> {
        let statement = statement::delete(table, predicate)?;
        self.safe_write(&statement, || WriteQueueEntry::delete(table, predicate.clone()))
            .await
    }

    /// Re-run a queued write.
    ///
    /// Inserts are replayed with `ON CONFLICT DO NOTHING` so an insert that
    /// reached the server before the outage is not duplicated on tables
    /// with a unique key.
    ///
    /// # Errors
    ///
    /// Same as [`QueryExecutor::execute`].
    pub async fn apply_entry(&self, entry: &WriteQueueEntry) -> Result<(), DbError> {
        let statement = match entry.operation {
            WriteOperation::Insert => statement::insert_ignoring_conflicts(&entry.table, &entry.data)?,
            WriteOperation::Update => statement::update(&entry.table, &entry.data, &entry.predicate)?,
            WriteOperation::Upsert => statement::upsert(&entry.table, &entry.data, &entry.conflict_key)?,
            WriteOperation::Delete => statement::delete(&entry.table, &entry.predicate)?,
        };
        self.write(&statement).await.map(|_| ())
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Probe the primary with `SELECT 1`, once, without retries.
    ///
    /// A passing probe is the recovery signal: if the database was not
    /// healthy it is marked healthy and the write queue is replayed. A
    /// failing probe counts as one failure.
    pub async fn check_health(&self) -> bool {
        let probe = Statement::new("SELECT 1", Vec::new());
        match self.backend.run(PoolTarget::Primary, &probe).await {
            Ok(_) => {
                self.controller.record_success(DATABASE).await;
                let unhealthy = self.controller.health(DATABASE).await != DependencyHealth::Healthy;
                let pending = self.controller.pending_writes(DATABASE).await > 0;
                if unhealthy || pending {
                    let report = self.controller.recover(DATABASE, self).await;
                    debug!(
                        replayed = report.replayed,
                        remaining = report.remaining,
                        "health probe passed"
                    );
                }
                true
            }
            Err(e) => {
                let health = self.controller.record_failure(DATABASE).await;
                warn!(error = %e, health = %health, "database health probe failed");
                false
            }
        }
    }

    /// Replay the write queue without probing.
    pub async fn replay_pending(&self) -> ReplayReport {
        self.controller.replay(DATABASE, self).await
    }

    /// Log a warning for every pool whose connections are all in use, and
    /// return those pools.
    pub fn check_pool_pressure(&self) -> Vec<PoolStats> {
        let saturated: Vec<_> = self
            .backend
            .pool_stats()
            .into_iter()
            .filter(PoolStats::saturated)
            .collect();
        for stats in &saturated {
            warn!(
                pool = %stats.target,
                size = stats.size,
                max = stats.max,
                "connection pool saturated, queries are waiting for connections"
            );
        }
        saturated
    }

    /// Snapshot of the executor's health for external consumers.
    pub async fn status(&self) -> DatabaseStatus {
        let state = self.controller.health(DATABASE).await;
        DatabaseStatus {
            is_connected: state != DependencyHealth::Unavailable,
            state,
            failure_count: self.controller.failure_count(DATABASE).await,
            max_failures: self.controller.max_failures(),
            pending_writes: self.controller.pending_writes(DATABASE).await,
            read_replica: ReplicaStatus {
                enabled: self.backend.has_replica(),
                host: self.backend.replica_host(),
            },
            retry_config: self.retry,
            slow_queries: self.slow_queries.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn retry_for(&self, options: ExecuteOptions) -> RetryConfig {
        if options.no_retry {
            RetryConfig::none()
        } else if let Some(retries) = options.retries {
            self.retry.with_max_retries(retries)
        } else {
            self.retry
        }
    }

    async fn write(&self, statement: &Statement) -> Result<Vec<Row>, DbError> {
        self.run(statement, ExecuteOptions::default().primary()).await
    }

    async fn safe_write(
        &self,
        statement: &Statement,
        entry: impl FnOnce() -> WriteQueueEntry,
    ) -> Result<WriteOutcome, DbError> {
        if let Some(marker) = self.controller.defer_write(DATABASE, entry).await {
            return Ok(WriteOutcome::Queued(marker));
        }
        self.write(statement).await.map(WriteOutcome::Applied)
    }

    async fn run(&self, statement: &Statement, options: ExecuteOptions) -> Result<Vec<Row>, DbError> {
        let target = route(&statement.sql, options.use_primary, self.backend.has_replica());
        debug!(pool = %target, "routing statement");
        let retry = self.retry_for(options);

        let result = retry_with_backoff(&retry, classify::is_transient, |_| {
            self.run_once(target, statement)
        })
        .await;

        match result {
            Ok(rows) => {
                self.controller.record_success(DATABASE).await;
                Ok(rows)
            }
            Err(e) if classify::is_transient(&e) => {
                error!(
                    error = %e,
                    attempts = retry.max_retries.saturating_add(1),
                    sql = %sql_preview(&statement.sql),
                    "query failed after retries"
                );
                self.controller.record_failure(DATABASE).await;
                Err(e)
            }
            Err(e) => {
                debug!(error = %e, "query failed with non-transient error");
                Err(e)
            }
        }
    }

    /// One attempt. A replica connection failure falls through to the
    /// primary within the same attempt and marks the database degraded.
    ///
    /// Only the attempt itself is timed; backoff sleeps between attempts
    /// never make a query slow.
    async fn run_once(&self, target: PoolTarget, statement: &Statement) -> Result<Vec<Row>, DbError> {
        let started = Instant::now();
        let result = match self.backend.run(target, statement).await {
            Err(DbError::Connection(message)) if target == PoolTarget::Replica => {
                warn!(error = %message, "replica connection failed, falling back to primary");
                self.controller.mark_degraded(DATABASE).await;
                self.backend.run(PoolTarget::Primary, statement).await
            }
            other => other,
        };
        let elapsed = started.elapsed();
        if let Ok(rows) = &result
            && elapsed >= self.slow_query_threshold
        {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
            warn!(
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                rows = rows.len(),
                sql = %sql_preview(&statement.sql),
                "slow query"
            );
        }
        result
    }
}

#[async_trait]
impl WriteReplayer for QueryExecutor {
    async fn apply(&self, entry: &WriteQueueEntry) -> Result<(), DbError> {
        self.apply_entry(entry).await
    }
}

fn sql_preview(sql: &str) -> String {
    let mut preview: String = sql.chars().take(LOGGED_SQL_CHARS).collect();
    if preview.len() < sql.len() {
        preview.push_str("...");
    }
    preview
}
