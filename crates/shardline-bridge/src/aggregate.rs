//! Cluster-wide reads composed from fan-out requests.
//!
//! Each shard registers handlers for [`STATS_REQUEST`],
//! [`FIND_GUILD_REQUEST`] and [`FIND_USER_REQUEST`]. Lookups ask the local
//! handler first and go to the cluster only on a local miss.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::bridge::{ShardBridge, ShardResponse};
use crate::error::BridgeError;

/// Request type answered with a shard's stats object.
pub const STATS_REQUEST: &str = "getStats";

/// Request type answered with a guild record or `null`.
pub const FIND_GUILD_REQUEST: &str = "findGuild";

/// Request type answered with a user record or `null`.
pub const FIND_USER_REQUEST: &str = "findUser";

/// Stats gathered from every shard that answered in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStats {
    /// Per-shard answers, ordered by shard id.
    pub shards: Vec<ShardResponse>,
    /// Shards that answered successfully.
    pub responded: usize,
    /// Shards in the deployment.
    pub expected: usize,
    /// Shards with no successful answer. Their numbers are unknown.
    pub missing_shards: Vec<u32>,
    /// Integer fields summed over the shards that answered.
    pub totals: BTreeMap<String, i64>,
}

impl ClusterStats {
    /// Build from fan-out responses for a deployment of `total_shards`.
    pub fn from_responses(responses: Vec<ShardResponse>, total_shards: u32) -> Self {
        let ok: Vec<&ShardResponse> = responses.iter().filter(|r| r.is_ok()).collect();
        let mut totals: BTreeMap<String, i64> = BTreeMap::new();
        for response in &ok {
            let Some(fields) = response.data.as_object() else {
                continue;
            };
            for (name, value) in fields {
                if let Some(n) = value.as_i64() {
                    let total = totals.entry(name.clone()).or_insert(0);
                    *total = total.saturating_add(n);
                }
            }
        }
        let missing_shards = (0..total_shards)
            .filter(|id| !ok.iter().any(|r| r.shard_id == *id))
            .collect();
        let responded = ok.len();
        Self {
            shards: responses,
            responded,
            expected: usize::try_from(total_shards).unwrap_or(usize::MAX),
            missing_shards,
            totals,
        }
    }

    /// Whether every shard answered.
    pub fn is_complete(&self) -> bool {
        self.missing_shards.is_empty()
    }
}

/// A record found on some shard.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Located {
    /// Shard holding the record.
    pub shard_id: u32,
    /// The record.
    pub data: Value,
}

impl ShardBridge {
    /// Stats from every shard, summed.
    pub async fn cluster_stats(&self) -> Result<ClusterStats, BridgeError> {
        let responses = self.request_all(STATS_REQUEST, Value::Null).await?;
        Ok(ClusterStats::from_responses(responses, self.total_shards()))
    }

    /// Find which shard holds guild `guild_id`.
    pub async fn find_guild(&self, guild_id: &str) -> Result<Option<Located>, BridgeError> {
        self.locate(FIND_GUILD_REQUEST, json!({ "id": guild_id })).await
    }

    /// Find which shard holds user `user_id`.
    pub async fn find_user(&self, user_id: &str) -> Result<Option<Located>, BridgeError> {
        self.locate(FIND_USER_REQUEST, json!({ "id": user_id })).await
    }

    async fn locate(&self, kind: &str, query: Value) -> Result<Option<Located>, BridgeError> {
        match self.handle_locally(kind, query.clone()).await {
            Ok(data) if !data.is_null() => {
                debug!(kind, "lookup answered locally");
                return Ok(Some(Located {
                    shard_id: self.shard_id(),
                    data,
                }));
            }
            Ok(_) => {}
            Err(e) => debug!(kind, error = %e, "local lookup failed, asking the cluster"),
        }
        if self.is_local_only() {
            return Ok(None);
        }
        let responses = self.request_all(kind, query).await?;
        Ok(responses
            .into_iter()
            .find(|r| r.is_ok() && r.shard_id != self.shard_id() && !r.data.is_null())
            .map(|r| Located {
                shard_id: r.shard_id,
                data: r.data,
            }))
    }
}
