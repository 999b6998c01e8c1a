//! The executor's seam to the database.
//!
//! [`QueryExecutor`](crate::executor::QueryExecutor) never talks to `sqlx`
//! directly; it drives a [`SqlBackend`]. Production code uses
//! [`PostgresPools`](crate::postgres::PostgresPools), tests substitute an
//! in-memory fake that records every call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::routing::PoolTarget;
use crate::statement::{Row, Statement};

/// Occupancy of one connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Which pool these numbers describe.
    pub target: PoolTarget,
    /// Open connections, busy or idle.
    pub size: u32,
    /// Open connections not currently checked out.
    pub idle: u32,
    /// Configured maximum pool size.
    pub max: u32,
}

impl PoolStats {
    /// Connections currently checked out.
    pub const fn in_use(&self) -> u32 {
        self.size.saturating_sub(self.idle)
    }

    /// True when every allowed connection is open and checked out, so the
    /// next acquire has to wait.
    pub const fn saturated(&self) -> bool {
        self.max > 0 && self.size >= self.max && self.idle == 0
    }
}

/// Runs statements against a primary and an optional replica.
#[async_trait]
pub trait SqlBackend: Send + Sync {
    /// Run one statement on `target` and return every row it produced.
    ///
    /// Implementations without a replica run [`PoolTarget::Replica`]
    /// statements on the primary.
    async fn run(&self, target: PoolTarget, statement: &Statement) -> Result<Vec<Row>, DbError>;

    /// Whether a replica pool is configured.
    fn has_replica(&self) -> bool;

    /// Host of the replica, for the status surface.
    fn replica_host(&self) -> Option<String>;

    /// Current occupancy of each pool.
    fn pool_stats(&self) -> Vec<PoolStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturation_needs_full_and_busy_pool() {
        let stats = PoolStats {
            target: PoolTarget::Primary,
            size: 15,
            idle: 0,
            max: 15,
        };
        assert!(stats.saturated());
        assert_eq!(stats.in_use(), 15);

        let idle = PoolStats { idle: 1, ..stats };
        assert!(!idle.saturated());
        let growing = PoolStats { size: 10, ..stats };
        assert!(!growing.saturated());
    }
}
