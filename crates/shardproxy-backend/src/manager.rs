//! Channel pool manager
//!
//! Maps datasource names to their [`ChannelPool`]s. Pools are created lazily
//! on the first acquire for a name, and concurrent first acquires for the
//! same name share one pool.

use crate::config::{EngineSettings, PoolSettings};
use crate::datasource::DataSourceRegistry;
use crate::error::{Error, Result};
use crate::handler::{default_handler_factory, HandlerFactory};
use crate::pool::{ChannelPool, PoolConfig, PoolStats, PooledChannel};
use crate::runtime::BackendRuntime;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Registry of per-datasource channel pools
pub struct ChannelPoolManager {
    registry: Arc<DataSourceRegistry>,
    runtime: Arc<BackendRuntime>,
    pool_config: PoolConfig,
    handler_factory: HandlerFactory,
    pools: DashMap<String, Arc<ChannelPool>>,
    pools_created: AtomicU64,
    closing: AtomicBool,
    drained: OnceCell<bool>,
}

impl std::fmt::Debug for ChannelPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPoolManager")
            .field("datasources", &self.registry.len())
            .field("pools", &self.pools.len())
            .field("closing", &self.closing.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ChannelPoolManager {
    /// Manager using the standard login handler
    pub fn new(
        registry: Arc<DataSourceRegistry>,
        runtime: Arc<BackendRuntime>,
        pool: &PoolSettings,
        engine: &EngineSettings,
    ) -> Self {
        Self::with_handler_factory(registry, runtime, pool, engine, default_handler_factory())
    }

    /// Manager whose pools use handlers built by `handler_factory`
    pub fn with_handler_factory(
        registry: Arc<DataSourceRegistry>,
        runtime: Arc<BackendRuntime>,
        pool: &PoolSettings,
        engine: &EngineSettings,
        handler_factory: HandlerFactory,
    ) -> Self {
        Self {
            registry,
            runtime,
            pool_config: PoolConfig::from_settings(pool, engine.statement_cache_size),
            handler_factory,
            pools: DashMap::new(),
            pools_created: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            drained: OnceCell::new(),
        }
    }

    /// Pool for `datasource`, created on first use
    pub fn pool(&self, datasource: &str) -> Result<Arc<ChannelPool>> {
        if self.closing.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        if let Some(pool) = self.pools.get(datasource) {
            return Ok(Arc::clone(pool.value()));
        }

        let config = self.registry.resolve(datasource)?;
        let pool = self
            .pools
            .entry(datasource.to_string())
            .or_insert_with(|| {
                self.pools_created.fetch_add(1, Ordering::Relaxed);
                info!(
                    datasource,
                    address = %config.address(),
                    max_size = self.pool_config.max_size,
                    "channel pool created"
                );
                let handler = (self.handler_factory)(Arc::clone(&config));
                ChannelPool::new(
                    Arc::clone(&config),
                    self.pool_config.clone(),
                    Arc::clone(&self.runtime),
                    handler,
                )
            });
        Ok(Arc::clone(pool.value()))
    }

    /// Acquire a channel to `datasource`
    pub async fn acquire(&self, datasource: &str) -> Result<PooledChannel> {
        let pool = self.pool(datasource)?;
        pool.acquire().await
    }

    /// Return a channel to its pool
    pub fn release(&self, channel: PooledChannel) {
        channel.release();
    }

    /// Datasource registry
    pub fn registry(&self) -> &Arc<DataSourceRegistry> {
        &self.registry
    }

    /// I/O runtime channels run on
    pub fn runtime(&self) -> &Arc<BackendRuntime> {
        &self.runtime
    }

    /// Configuration shared by every pool
    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool_config
    }

    /// Pools created so far
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Total pool creations; equals `pool_count` unless pools were rebuilt
    pub fn pools_created(&self) -> u64 {
        self.pools_created.load(Ordering::Relaxed)
    }

    /// Stats of every live pool, by datasource
    pub fn stats(&self) -> BTreeMap<String, PoolStats> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Whether `shutdown` has begun
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Refuse new acquires, wait for in-use channels, then close every pool.
    ///
    /// Returns `false` if channels were still out when `drain_timeout` passed.
    /// Later calls wait for the first drain and report its outcome.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        self.closing.store(true, Ordering::Release);
        *self
            .drained
            .get_or_init(|| self.drain(drain_timeout))
            .await
    }

    async fn drain(&self, drain_timeout: Duration) -> bool {
        let pools: Vec<Arc<ChannelPool>> = self
            .pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let deadline = tokio::time::Instant::now() + drain_timeout;
        let mut drained = true;
        for pool in &pools {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !pool.wait_for_idle(remaining).await {
                warn!(
                    datasource = %pool.datasource().name,
                    in_use = pool.in_use(),
                    "channels still in use at shutdown"
                );
                drained = false;
            }
            pool.close();
        }
        info!(pools = pools.len(), drained, "channel pools closed");
        drained
    }
}
