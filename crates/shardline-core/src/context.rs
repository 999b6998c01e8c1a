//! Composition root for one shard.
//!
//! [`ShardContext`] is built once at startup and handed by reference to
//! every domain service. It owns the query executor, the hybrid cache and
//! the shard bridge, and picks each optional dependency's implementation
//! from configuration:
//!
//! | Dependency | Configured and reachable | Otherwise |
//! |------------|--------------------------|-----------|
//! | `PostgreSQL` | connected pools | lazy pools, one failure recorded |
//! | External cache | [`DragonflyCache`] | [`NullCache`] (fallback-only) |
//! | Pub/sub | Redis or NATS transport | local-only bridge |

use std::sync::Arc;

use serde_json::{Value, json};
use shardline_bridge::{
    BridgeError, NatsTransport, PubSubTransport, RedisTransport, STATS_REQUEST, ShardBridge,
};
use shardline_cache::{DragonflyCache, ExternalCache, HybridCache, NullCache, redact_url};
use shardline_db::{
    DATABASE, DbError, DegradationController, PostgresPools, QueryExecutor, RetryConfig, SqlBackend,
};
use tracing::{info, warn};

use crate::config::{ConfigError, ShardlineConfig, TransportKind};

/// Everything a shard's domain services need.
pub struct ShardContext {
    config: ShardlineConfig,
    executor: Arc<QueryExecutor>,
    cache: Arc<HybridCache>,
    bridge: Arc<ShardBridge>,
    pools: Option<PostgresPools>,
    dragonfly: Option<DragonflyCache>,
}

impl std::fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardContext")
            .field("shard_id", &self.config.shard.shard_id)
            .field("total_shards", &self.config.shard.total_shards)
            .field("cache", &self.cache)
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

impl ShardContext {
    /// Connect to everything `config` names.
    ///
    /// Unreachable services do not fail startup: the database comes up with
    /// lazy pools, the cache runs fallback-only and the bridge local-only.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the configuration fails
    /// validation or a database URL cannot be parsed.
    pub async fn build(config: ShardlineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let (pools, reachable) = connect_database(&config).await?;
        let dragonfly = connect_cache(&config).await;
        let transport = connect_transport(&config).await;

        let backend: Arc<dyn SqlBackend> = Arc::new(pools.clone());
        let external: Arc<dyn ExternalCache> = match &dragonfly {
            Some(cache) => Arc::new(cache.clone()),
            None => Arc::new(NullCache),
        };
        let mut context = Self::from_parts(config, backend, external, transport).await;
        if !reachable {
            context.executor.controller().record_failure(DATABASE).await;
        }
        context.pools = Some(pools);
        context.dragonfly = dragonfly;
        Ok(context)
    }

    /// Assemble a context from ready-made capabilities.
    pub async fn from_parts(
        config: ShardlineConfig,
        backend: Arc<dyn SqlBackend>,
        external: Arc<dyn ExternalCache>,
        transport: Option<Arc<dyn PubSubTransport>>,
    ) -> Self {
        let controller = Arc::new(DegradationController::new(config.database.max_failures));
        let executor = Arc::new(
            QueryExecutor::new(backend, controller)
                .with_retry(RetryConfig::from(config.database.retry))
                .with_slow_query_threshold(config.database.slow_query_threshold()),
        );
        let cache = Arc::new(
            HybridCache::new(external, config.cache.max_fallback_entries)
                .with_default_ttl(config.cache.default_ttl()),
        );
        let bridge =
            ShardBridge::start(config.bridge.bridge_config(&config.shard), transport).await;

        let context = Self {
            config,
            executor,
            cache,
            bridge,
            pools: None,
            dragonfly: None,
        };
        context.register_stats_handler();
        context
    }

    /// The loaded configuration.
    pub const fn config(&self) -> &ShardlineConfig {
        &self.config
    }

    /// Resilient query executor.
    pub const fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    /// Hybrid cache.
    pub const fn cache(&self) -> &Arc<HybridCache> {
        &self.cache
    }

    /// Shard bridge.
    pub const fn bridge(&self) -> &Arc<ShardBridge> {
        &self.bridge
    }

    /// Answer [`STATS_REQUEST`] with this shard's cache and database numbers.
    ///
    /// Domain services may replace it with a richer handler.
    fn register_stats_handler(&self) {
        let shard_id = self.config.shard.shard_id;
        let cache = Arc::clone(&self.cache);
        let executor = Arc::clone(&self.executor);
        self.bridge.register_handler(STATS_REQUEST, move |_: Value| {
            let cache = Arc::clone(&cache);
            let executor = Arc::clone(&executor);
            async move {
                let cache_stats = cache.stats();
                let db = executor.status().await;
                Ok::<Value, BridgeError>(json!({
                    "shardId": shard_id,
                    "fallbackEntries": cache_stats.fallback_entries,
                    "externalCacheConnected": cache_stats.external_connected,
                    "pendingWrites": db.pending_writes,
                    "databaseState": db.state,
                }))
            }
        });
    }

    /// Shut the bridge down, then close cache and database connections.
    pub async fn shutdown(&self) {
        self.bridge.shutdown().await;
        if let Some(cache) = &self.dragonfly {
            cache.quit().await;
        }
        if let Some(pools) = &self.pools {
            pools.close().await;
        }
        info!(shard_id = self.config.shard.shard_id, "shard context shut down");
    }
}

/// Connected pools, or lazy ones when the server is down. The flag says
/// whether the primary answered.
async fn connect_database(config: &ShardlineConfig) -> Result<(PostgresPools, bool), ConfigError> {
    let pg = config.database.postgres_config();
    match PostgresPools::connect(&pg).await {
        Ok(pools) => Ok((pools, true)),
        Err(e @ DbError::Config(_)) => Err(ConfigError::Invalid(format!("database: {e}"))),
        Err(e) => {
            warn!(
                dependency = DATABASE,
                url = %redact_url(&pg.url),
                error = %e,
                "PostgreSQL unreachable at startup, continuing with lazy pools"
            );
            let pools = PostgresPools::connect_lazy(&pg)
                .map_err(|e| ConfigError::Invalid(format!("database: {e}")))?;
            Ok((pools, false))
        }
    }
}

async fn connect_cache(config: &ShardlineConfig) -> Option<DragonflyCache> {
    let url = config.cache.url.as_deref()?;
    match DragonflyCache::connect(url).await {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!(
                url = %redact_url(url),
                error = %e,
                "external cache unavailable, running fallback-only"
            );
            None
        }
    }
}

async fn connect_transport(config: &ShardlineConfig) -> Option<Arc<dyn PubSubTransport>> {
    if config.shard.total_shards <= 1 {
        return None;
    }
    let url = config.bridge.resolved_url(&config.cache)?;
    let connected: Result<Arc<dyn PubSubTransport>, BridgeError> = match config.bridge.transport {
        TransportKind::None => return None,
        TransportKind::Redis => RedisTransport::connect(&url)
            .await
            .map(|t| Arc::new(t) as Arc<dyn PubSubTransport>),
        TransportKind::Nats => NatsTransport::connect(&url)
            .await
            .map(|t| Arc::new(t) as Arc<dyn PubSubTransport>),
    };
    match connected {
        Ok(transport) => {
            info!(transport = transport.name(), url = %redact_url(&url), "pub/sub connected");
            Some(transport)
        }
        Err(e) => {
            warn!(url = %redact_url(&url), error = %e, "pub/sub unavailable");
            None
        }
    }
}
