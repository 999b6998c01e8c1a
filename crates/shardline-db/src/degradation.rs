//! Per-dependency health tracking and the deferred write queue.
//!
//! Each dependency (for example `"database"`) moves through three states:
//!
//! ```text
//! Healthy --(consecutive failures >= max_failures)--> Unavailable
//! Unavailable --(explicit recovery signal)--> Healthy (+ FIFO replay)
//! Healthy --(partial capability lost)--> Degraded
//! ```
//!
//! Successful calls only reset the failure counter; leaving `Unavailable`
//! takes an explicit recovery signal, normally a passing health probe.
//!
//! Writes attempted while a dependency is `Unavailable` are appended to its
//! queue, and so is every later write until that queue has drained: a new
//! write never overtakes an older deferred one. On recovery the queue is replayed strictly in order through a
//! [`WriteReplayer`]; the first failure halts replay and leaves that entry
//! (and everything behind it) queued.
//!
//! State is process-local. Each shard keeps its own copy.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::DbError;
use crate::statement::Record;

/// Default number of consecutive failures before a dependency is marked
/// unavailable.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Health of one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyHealth {
    /// Fully operational.
    Healthy,
    /// Operational with reduced capability (e.g. replica down, primary up).
    Degraded,
    /// Not usable; writes are queued.
    Unavailable,
}

impl std::fmt::Display for DependencyHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded => f.write_str("degraded"),
            Self::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// The kind of write a queue entry defers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    /// `INSERT`.
    Insert,
    /// `UPDATE ... WHERE`.
    Update,
    /// `INSERT ... ON CONFLICT DO UPDATE`.
    Upsert,
    /// `DELETE ... WHERE`.
    Delete,
}

impl std::fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => f.write_str("insert"),
            Self::Update => f.write_str("update"),
            Self::Upsert => f.write_str("upsert"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// A write deferred while its dependency was unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteQueueEntry {
    /// Unique entry ID (v7, so IDs sort by enqueue time).
    pub id: Uuid,
    /// The write to perform.
    pub operation: WriteOperation,
    /// Target table.
    pub table: String,
    /// Column values for insert/update/upsert. Empty for delete.
    pub data: Record,
    /// Equality predicate for update/delete. Empty for insert/upsert.
    pub predicate: Record,
    /// Conflict columns for upsert. Empty otherwise.
    pub conflict_key: Vec<String>,
    /// When the write was deferred.
    pub enqueued_at: DateTime<Utc>,
}

impl WriteQueueEntry {
    fn new(operation: WriteOperation, table: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            operation,
            table: table.to_owned(),
            data: Record::new(),
            predicate: Record::new(),
            conflict_key: Vec::new(),
            enqueued_at: Utc::now(),
        }
    }

    /// A deferred insert.
    pub fn insert(table: &str, data: Record) -> Self {
        Self {
            data,
            ..Self::new(WriteOperation::Insert, table)
        }
    }

    /// A deferred update.
    pub fn update(table: &str, data: Record, predicate: Record) -> Self {
        Self {
            data,
            predicate,
            ..Self::new(WriteOperation::Update, table)
        }
    }

    /// A deferred upsert.
    pub fn upsert(table: &str, data: Record, conflict_key: Vec<String>) -> Self {
        Self {
            data,
            conflict_key,
            ..Self::new(WriteOperation::Upsert, table)
        }
    }

    /// A deferred delete.
    pub fn delete(table: &str, predicate: Record) -> Self {
        Self {
            predicate,
            ..Self::new(WriteOperation::Delete, table)
        }
    }
}

/// Re-applies queued writes during replay.
#[async_trait]
pub trait WriteReplayer: Send + Sync {
    /// Perform the entry's original operation.
    async fn apply(&self, entry: &WriteQueueEntry) -> Result<(), DbError>;
}

/// Marker returned when a write was deferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedWrite {
    /// ID of the queue entry.
    pub id: Uuid,
    /// The deferred operation.
    pub operation: WriteOperation,
    /// Target table.
    pub table: String,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplayReport {
    /// Entries applied and removed from the queue.
    pub replayed: usize,
    /// Entries still queued after the pass.
    pub remaining: usize,
    /// The error that stopped the pass, if any.
    pub halted_on: Option<DbError>,
    /// True if another replay of the same queue was already running and
    /// this call did nothing.
    pub already_running: bool,
}

/// Point-in-time view of one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencySnapshot {
    /// Dependency name.
    pub name: String,
    /// Current health.
    pub health: DependencyHealth,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Queued writes.
    pub pending_writes: usize,
    /// When the health last changed.
    pub since: DateTime<Utc>,
}

#[derive(Debug)]
struct DependencyState {
    health: DependencyHealth,
    consecutive_failures: u32,
    queue: VecDeque<WriteQueueEntry>,
    replaying: bool,
    changed_at: DateTime<Utc>,
}

impl DependencyState {
    fn new() -> Self {
        Self {
            health: DependencyHealth::Healthy,
            consecutive_failures: 0,
            queue: VecDeque::new(),
            replaying: false,
            changed_at: Utc::now(),
        }
    }

    fn defer(&mut self, name: &str, entry: WriteQueueEntry) {
        tracing::warn!(
            dependency = name,
            health = %self.health,
            operation = %entry.operation,
            table = %entry.table,
            queue_len = self.queue.len().saturating_add(1),
            "write deferred"
        );
        self.queue.push_back(entry);
    }

    fn transition(&mut self, name: &str, to: DependencyHealth) -> bool {
        if self.health == to {
            return false;
        }
        let from = self.health;
        self.health = to;
        self.changed_at = Utc::now();
        match to {
            DependencyHealth::Healthy => tracing::info!(
                dependency = name,
                from = %from,
                pending_writes = self.queue.len(),
                "dependency recovered"
            ),
            DependencyHealth::Degraded | DependencyHealth::Unavailable => tracing::warn!(
                dependency = name,
                from = %from,
                to = %to,
                consecutive_failures = self.consecutive_failures,
                "dependency health changed"
            ),
        }
        true
    }
}

/// Tracks dependency health and owns the per-dependency write queues.
#[derive(Debug)]
pub struct DegradationController {
    max_failures: u32,
    states: Mutex<HashMap<String, DependencyState>>,
}

impl Default for DegradationController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILURES)
    }
}

impl DegradationController {
    /// Create a controller that marks a dependency unavailable after
    /// `max_failures` consecutive failures (at least 1).
    pub fn new(max_failures: u32) -> Self {
        Self {
            max_failures: max_failures.max(1),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// The configured failure threshold.
    pub const fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Current health of `dependency`. Unknown dependencies are healthy.
    pub async fn health(&self, dependency: &str) -> DependencyHealth {
        self.states
            .lock()
            .await
            .get(dependency)
            .map_or(DependencyHealth::Healthy, |s| s.health)
    }

    /// Consecutive failures recorded for `dependency`.
    pub async fn failure_count(&self, dependency: &str) -> u32 {
        self.states
            .lock()
            .await
            .get(dependency)
            .map_or(0, |s| s.consecutive_failures)
    }

    /// Reset the failure counter after a successful call.
    ///
    /// Does not change health: leaving `Unavailable` needs
    /// [`DegradationController::mark_recovered`].
    pub async fn record_success(&self, dependency: &str) {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(dependency) {
            state.consecutive_failures = 0;
        }
    }

    /// Count a failure and return the resulting health.
    pub async fn record_failure(&self, dependency: &str) -> DependencyHealth {
        let mut states = self.states.lock().await;
        let state = states
            .entry(dependency.to_owned())
            .or_insert_with(DependencyState::new);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.max_failures {
            state.transition(dependency, DependencyHealth::Unavailable);
        }
        state.health
    }

    /// Mark a healthy dependency as running with reduced capability.
    ///
    /// Has no effect on an `Unavailable` dependency.
    pub async fn mark_degraded(&self, dependency: &str) {
        let mut states = self.states.lock().await;
        let state = states
            .entry(dependency.to_owned())
            .or_insert_with(DependencyState::new);
        if state.health == DependencyHealth::Healthy {
            state.transition(dependency, DependencyHealth::Degraded);
        }
    }

    /// Explicit recovery signal. Resets the counter and returns true if the
    /// dependency was not already healthy.
    pub async fn mark_recovered(&self, dependency: &str) -> bool {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(dependency) else {
            return false;
        };
        state.consecutive_failures = 0;
        state.transition(dependency, DependencyHealth::Healthy)
    }

    /// Append a deferred write to the dependency's queue.
    pub async fn queue_write(&self, dependency: &str, entry: WriteQueueEntry) {
        let mut states = self.states.lock().await;
        let state = states
            .entry(dependency.to_owned())
            .or_insert_with(DependencyState::new);
        state.defer(dependency, entry);
    }

    /// Queue the write built by `entry` if `dependency` cannot take it
    /// directly: it is `Unavailable`, older writes are still queued, or a
    /// replay is running. Returns `None` when the caller should apply the
    /// write itself.
    ///
    /// The check and the append happen under one lock, so a replay cannot
    /// drain the queue in between.
    pub async fn defer_write<F>(&self, dependency: &str, entry: F) -> Option<QueuedWrite>
    where
        F: FnOnce() -> WriteQueueEntry,
    {
        let mut states = self.states.lock().await;
        let state = states.get_mut(dependency)?;
        let must_queue = state.health == DependencyHealth::Unavailable
            || state.replaying
            || !state.queue.is_empty();
        if !must_queue {
            return None;
        }
        let entry = entry();
        let marker = QueuedWrite {
            id: entry.id,
            operation: entry.operation,
            table: entry.table.clone(),
        };
        state.defer(dependency, entry);
        Some(marker)
    }

    /// Number of writes queued for `dependency`.
    pub async fn pending_writes(&self, dependency: &str) -> usize {
        self.states
            .lock()
            .await
            .get(dependency)
            .map_or(0, |s| s.queue.len())
    }

    /// Copy of the queued writes, oldest first.
    pub async fn queued(&self, dependency: &str) -> Vec<WriteQueueEntry> {
        self.states
            .lock()
            .await
            .get(dependency)
            .map(|s| s.queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Discard every queued write for `dependency` and return them.
    pub async fn flush(&self, dependency: &str) -> Vec<WriteQueueEntry> {
        let mut states = self.states.lock().await;
        let dropped: Vec<_> = states
            .get_mut(dependency)
            .map(|s| s.queue.drain(..).collect())
            .unwrap_or_default();
        if !dropped.is_empty() {
            tracing::warn!(
                dependency,
                dropped = dropped.len(),
                "write queue flushed without replay"
            );
        }
        dropped
    }

    /// Replay the queue for `dependency` in FIFO order.
    ///
    /// The lock is released while each entry is applied, so the replayer may
    /// report success or failure back to this controller. An entry is popped
    /// only after it applied successfully; the first error halts the pass.
    pub async fn replay(&self, dependency: &str, replayer: &dyn WriteReplayer) -> ReplayReport {
        {
            let mut states = self.states.lock().await;
            let Some(state) = states.get_mut(dependency) else {
                return ReplayReport::default();
            };
            if state.replaying {
                tracing::debug!(dependency, "replay already in progress");
                return ReplayReport {
                    remaining: state.queue.len(),
                    already_running: true,
                    ..ReplayReport::default()
                };
            }
            state.replaying = true;
        }

        let mut report = ReplayReport::default();
        loop {
            let next = {
                let states = self.states.lock().await;
                states
                    .get(dependency)
                    .and_then(|s| s.queue.front().cloned())
            };
            let Some(entry) = next else {
                break;
            };

            match replayer.apply(&entry).await {
                Ok(()) => {
                    let mut states = self.states.lock().await;
                    if let Some(state) = states.get_mut(dependency)
                        && state.queue.front().is_some_and(|front| front.id == entry.id)
                    {
                        state.queue.pop_front();
                    }
                    report.replayed = report.replayed.saturating_add(1);
                }
                Err(e) => {
                    tracing::warn!(
                        dependency,
                        entry_id = %entry.id,
                        operation = %entry.operation,
                        table = %entry.table,
                        error = %e,
                        "replay halted, entry left at head of queue"
                    );
                    report.halted_on = Some(e);
                    break;
                }
            }
        }

        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(dependency) {
            state.replaying = false;
            report.remaining = state.queue.len();
        }
        if report.replayed > 0 || report.remaining > 0 {
            tracing::info!(
                dependency,
                replayed = report.replayed,
                remaining = report.remaining,
                "write queue replay finished"
            );
        }
        report
    }

    /// Mark `dependency` healthy and replay its queue.
    pub async fn recover(&self, dependency: &str, replayer: &dyn WriteReplayer) -> ReplayReport {
        self.mark_recovered(dependency).await;
        self.replay(dependency, replayer).await
    }

    /// Every tracked dependency, sorted by name.
    pub async fn snapshot(&self) -> Vec<DependencySnapshot> {
        let states = self.states.lock().await;
        let mut out: Vec<_> = states
            .iter()
            .map(|(name, s)| DependencySnapshot {
                name: name.clone(),
                health: s.health,
                consecutive_failures: s.consecutive_failures,
                pending_writes: s.queue.len(),
                since: s.changed_at,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::statement::record;

    const DB: &str = "database";

    struct Recorder {
        seen: std::sync::Mutex<Vec<Uuid>>,
        fail_at: Option<usize>,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn new(fail_at: Option<usize>) -> Self {
            Self {
                seen: std::sync::Mutex::new(Vec::new()),
                fail_at,
                calls: AtomicUsize::new(0),
            }
        }

        fn seen(&self) -> Vec<Uuid> {
            self.seen.lock().map(|v| v.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl WriteReplayer for Recorder {
        async fn apply(&self, entry: &WriteQueueEntry) -> Result<(), DbError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(call) {
                return Err(DbError::Connection("refused".to_owned()));
            }
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(entry.id);
            }
            Ok(())
        }
    }

    fn entry(n: i64) -> WriteQueueEntry {
        WriteQueueEntry::insert("audit_log", record([("n", n)]))
    }

    #[tokio::test]
    async fn unknown_dependency_is_healthy() {
        let controller = DegradationController::default();
        assert_eq!(controller.health(DB).await, DependencyHealth::Healthy);
        assert_eq!(controller.failure_count(DB).await, 0);
    }

    #[tokio::test]
    async fn writes_defer_until_the_queue_drains() {
        let controller = DegradationController::new(1);
        assert!(controller.defer_write(DB, || entry(0)).await.is_none());

        controller.record_failure(DB).await;
        let first = controller.defer_write(DB, || entry(1)).await;
        assert!(first.is_some_and(|m| m.operation == WriteOperation::Insert));

        // Healthy again, but an older write is still queued.
        controller.mark_recovered(DB).await;
        assert!(controller.defer_write(DB, || entry(2)).await.is_some());
        assert_eq!(controller.pending_writes(DB).await, 2);

        controller.flush(DB).await;
        assert!(controller.defer_write(DB, || entry(3)).await.is_none());
        assert_eq!(controller.pending_writes(DB).await, 0);
    }

    #[tokio::test]
    async fn threshold_failures_make_unavailable() {
        let controller = DegradationController::new(3);
        assert_eq!(controller.record_failure(DB).await, DependencyHealth::Healthy);
        assert_eq!(controller.record_failure(DB).await, DependencyHealth::Healthy);
        assert_eq!(controller.record_failure(DB).await, DependencyHealth::Unavailable);
        assert_eq!(controller.failure_count(DB).await, 3);
    }

    #[tokio::test]
    async fn success_resets_counter_but_not_state() {
        let controller = DegradationController::new(2);
        controller.record_failure(DB).await;
        controller.record_success(DB).await;
        controller.record_failure(DB).await;
        assert_eq!(controller.health(DB).await, DependencyHealth::Healthy);

        controller.record_failure(DB).await;
        assert_eq!(controller.health(DB).await, DependencyHealth::Unavailable);
        controller.record_success(DB).await;
        assert_eq!(controller.failure_count(DB).await, 0);
        assert_eq!(controller.health(DB).await, DependencyHealth::Unavailable);

        assert!(controller.mark_recovered(DB).await);
        assert_eq!(controller.health(DB).await, DependencyHealth::Healthy);
        assert!(!controller.mark_recovered(DB).await);
    }

    #[tokio::test]
    async fn degraded_only_from_healthy() {
        let controller = DegradationController::new(1);
        controller.mark_degraded(DB).await;
        assert_eq!(controller.health(DB).await, DependencyHealth::Degraded);
        controller.record_failure(DB).await;
        controller.mark_degraded(DB).await;
        assert_eq!(controller.health(DB).await, DependencyHealth::Unavailable);
    }

    #[tokio::test]
    async fn replay_is_fifo_and_drains() {
        let controller = DegradationController::new(1);
        let entries: Vec<_> = (0..5).map(entry).collect();
        for e in &entries {
            controller.queue_write(DB, e.clone()).await;
        }
        let recorder = Recorder::new(None);
        let report = controller.replay(DB, &recorder).await;

        assert_eq!(report.replayed, 5);
        assert_eq!(report.remaining, 0);
        assert!(report.halted_on.is_none());
        let expected: Vec<_> = entries.iter().map(|e| e.id).collect();
        assert_eq!(recorder.seen(), expected);
    }

    #[tokio::test]
    async fn replay_halts_and_keeps_failed_entry_at_head() {
        let controller = DegradationController::new(1);
        let entries: Vec<_> = (0..4).map(entry).collect();
        for e in &entries {
            controller.queue_write(DB, e.clone()).await;
        }
        let recorder = Recorder::new(Some(2));
        let report = controller.replay(DB, &recorder).await;

        assert_eq!(report.replayed, 2);
        assert_eq!(report.remaining, 2);
        assert!(matches!(report.halted_on, Some(DbError::Connection(_))));
        let left: Vec<_> = controller.queued(DB).await.iter().map(|e| e.id).collect();
        let expected: Vec<_> = entries.iter().skip(2).map(|e| e.id).collect();
        assert_eq!(left, expected);
    }

    #[tokio::test]
    async fn flush_discards_everything() {
        let controller = DegradationController::default();
        controller.queue_write(DB, entry(1)).await;
        controller.queue_write(DB, entry(2)).await;
        assert_eq!(controller.flush(DB).await.len(), 2);
        assert_eq!(controller.pending_writes(DB).await, 0);
    }

    #[tokio::test]
    async fn snapshot_lists_dependencies() {
        let controller = DegradationController::new(1);
        controller.record_failure("database").await;
        controller.mark_degraded("cache").await;
        let snap = controller.snapshot().await;
        let names: Vec<_> = snap.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["cache", "database"]);
        assert_eq!(
            snap.iter().map(|s| s.health).collect::<Vec<_>>(),
            vec![DependencyHealth::Degraded, DependencyHealth::Unavailable]
        );
    }
}
