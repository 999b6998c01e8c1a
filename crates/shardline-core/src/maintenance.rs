//! Background loops: cache sweeping and database health probing.
//!
//! The health loop checks pool pressure on every tick and probes the
//! primary only when there is something to recover: a non-healthy state,
//! outstanding failures, or queued writes. A passing probe is the recovery
//! signal that replays the write queue.

use std::sync::Arc;
use std::time::Duration;

use shardline_db::{DATABASE, DependencyHealth, QueryExecutor};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::context::ShardContext;

/// Handles to the running background loops.
#[derive(Debug)]
pub struct Maintenance {
    sweeper: JoinHandle<()>,
    health: JoinHandle<()>,
}

impl Maintenance {
    /// Stop every loop.
    pub fn stop(self) {
        self.sweeper.abort();
        self.health.abort();
        info!("maintenance loops stopped");
    }
}

impl ShardContext {
    /// Start the cache sweeper and the database health loop.
    pub fn spawn_maintenance(&self) -> Maintenance {
        let sweeper = self.cache().spawn_sweeper(self.config().cache.sweep_interval());
        let health = spawn_health_loop(
            Arc::clone(self.executor()),
            self.config().database.health_check_interval(),
        );
        info!(
            sweep_interval_secs = self.config().cache.sweep_interval_secs,
            health_check_interval_secs = self.config().database.health_check_interval_secs,
            "maintenance loops started"
        );
        Maintenance { sweeper, health }
    }
}

/// Shortest period the health loop accepts.
const MIN_HEALTH_INTERVAL: Duration = Duration::from_millis(1);

/// Run [`health_tick`] every `interval` (at least one millisecond).
pub fn spawn_health_loop(executor: Arc<QueryExecutor>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(MIN_HEALTH_INTERVAL));
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            health_tick(&executor).await;
        }
    })
}

/// One pass of the health loop. Returns whether a probe was sent.
pub async fn health_tick(executor: &QueryExecutor) -> bool {
    let saturated = executor.check_pool_pressure().len();

    let controller = executor.controller();
    let needs_probe = controller.health(DATABASE).await != DependencyHealth::Healthy
        || controller.failure_count(DATABASE).await > 0
        || controller.pending_writes(DATABASE).await > 0;
    if !needs_probe {
        return false;
    }
    let healthy = executor.check_health().await;
    debug!(healthy, saturated, "database health probe");
    true
}
