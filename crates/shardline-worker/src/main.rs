//! Shard worker binary for Shardline.
//!
//! Brings up one shard's resilience layer and keeps it running until the
//! process is interrupted. Domain services are linked in by embedding
//! [`ShardContext`] the same way this binary does.
//!
//! # Startup Sequence
//!
//! 1. Load configuration (`SHARDLINE_CONFIG` or `shardline.yaml`, then
//!    environment overrides)
//! 2. Initialize structured logging (tracing), honouring `RUST_LOG`
//! 3. Build the shard context: database pools, hybrid cache, shard bridge
//! 4. Start the cache sweeper and database health loop
//! 5. Wait for Ctrl-C, then stop the loops and close every connection

mod error;

use shardline_core::{LogFormat, LoggingConfig, ShardContext, ShardlineConfig};
use shardline_db::DATABASE;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::WorkerError;

/// Application entry point for the shard worker.
///
/// # Errors
///
/// Returns an error if configuration is invalid or the shutdown signal
/// handler cannot be installed.
#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    // 1. Load configuration. Logging depends on it, so it comes first.
    let config = ShardlineConfig::load()?;

    // 2. Initialize structured logging.
    init_tracing(&config.logging);
    info!(
        shard_id = config.shard.shard_id,
        total_shards = config.shard.total_shards,
        transport = ?config.bridge.transport,
        "shardline-worker starting"
    );

    // 3. Build the shard context.
    let context = ShardContext::build(config).await?;
    let db = context.executor().status().await;
    let cache = context.cache().stats();
    info!(
        database = DATABASE,
        database_state = %db.state,
        replica_enabled = db.read_replica.enabled,
        external_cache = cache.external_connected,
        local_only = context.bridge().is_local_only(),
        "Shard context ready"
    );

    // 4. Start maintenance loops.
    let maintenance = context.spawn_maintenance();

    // 5. Run until interrupted.
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    maintenance.stop();
    context.shutdown().await;
    info!("shardline-worker shutdown complete");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    match logging.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init(),
    }
}
