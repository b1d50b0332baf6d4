//! Composition root
//!
//! [`ShardingBackend`] wires the registry, the I/O runtime, the pool manager
//! and the engine factory together. It is constructed once per process and
//! passed explicitly to whatever drives it.

use crate::config::BackendConfig;
use crate::datasource::DataSourceRegistry;
use crate::engine::{EngineContext, ExecuteEngineFactory, ExecutionRequest, ExecutionResult};
use crate::engine::ProxyMode;
use crate::error::Result;
use crate::handler::{default_handler_factory, HandlerFactory};
use crate::manager::ChannelPoolManager;
use crate::runtime::BackendRuntime;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Builder for [`ShardingBackend`]
pub struct ShardingBackendBuilder {
    config: BackendConfig,
    handle: Option<Handle>,
    handler_factory: Option<HandlerFactory>,
}

impl ShardingBackendBuilder {
    /// Run channels on an existing tokio runtime instead of a dedicated one
    pub fn with_runtime_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Use custom channel lifecycle handlers
    pub fn with_handler_factory(mut self, factory: HandlerFactory) -> Self {
        self.handler_factory = Some(factory);
        self
    }

    /// Validate the configuration and start the backend
    pub fn build(self) -> Result<ShardingBackend> {
        let config = self.config;
        config.validate()?;
        let mode = config.proxy_mode()?;

        let registry = Arc::new(DataSourceRegistry::from_config(&config)?);
        let runtime = match self.handle {
            Some(handle) => BackendRuntime::attach(handle, &config.runtime),
            None => BackendRuntime::start(&config.runtime)?,
        };
        let manager = Arc::new(ChannelPoolManager::with_handler_factory(
            Arc::clone(&registry),
            Arc::clone(&runtime),
            &config.pool,
            &config.engine,
            self.handler_factory.unwrap_or_else(default_handler_factory),
        ));
        let factory = ExecuteEngineFactory::new(
            Some(mode),
            EngineContext::new(Arc::clone(&manager), config.engine.clone()),
        );

        info!(
            mode = %mode,
            datasources = registry.len(),
            max_pool_size = config.pool.max_size,
            "sharding backend started"
        );
        Ok(ShardingBackend {
            config,
            registry,
            runtime,
            manager,
            factory,
        })
    }
}

/// Backend core of the sharding proxy
pub struct ShardingBackend {
    config: BackendConfig,
    registry: Arc<DataSourceRegistry>,
    runtime: Arc<BackendRuntime>,
    manager: Arc<ChannelPoolManager>,
    factory: ExecuteEngineFactory,
}

impl std::fmt::Debug for ShardingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardingBackend")
            .field("mode", &self.config.proxy_mode)
            .field("manager", &self.manager)
            .field("runtime", &self.runtime)
            .finish()
    }
}

impl ShardingBackend {
    /// Builder over a configuration
    pub fn builder(config: BackendConfig) -> ShardingBackendBuilder {
        ShardingBackendBuilder {
            config,
            handle: None,
            handler_factory: None,
        }
    }

    /// Start with a dedicated I/O runtime and the standard handlers
    pub fn start(config: BackendConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Execute a routed statement with the engine the proxy mode selects
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let engine = self.factory.create(&request)?;
        debug!(
            mode = %engine.mode(),
            kind = %engine.statement_kind(),
            targets = request.targets().len(),
            "executing statement"
        );
        engine.execute(&request).await
    }

    /// Round trip to one datasource over a pooled channel
    pub async fn ping(&self, datasource: &str) -> Result<Duration> {
        let start = Instant::now();
        let mut channel = self.manager.acquire(datasource).await?;
        channel.ping().await?;
        channel.release();
        Ok(start.elapsed())
    }

    /// Proxy mode in effect
    pub fn mode(&self) -> Result<ProxyMode> {
        self.factory.mode()
    }

    /// Loaded configuration
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Datasource registry
    pub fn registry(&self) -> &Arc<DataSourceRegistry> {
        &self.registry
    }

    /// Channel pool manager
    pub fn manager(&self) -> &Arc<ChannelPoolManager> {
        &self.manager
    }

    /// I/O runtime
    pub fn runtime(&self) -> &Arc<BackendRuntime> {
        &self.runtime
    }

    /// Engine factory
    pub fn factory(&self) -> &ExecuteEngineFactory {
        &self.factory
    }

    /// Stop new acquires, drain channels, then stop the I/O runtime.
    ///
    /// Returns whether everything drained within the shutdown timeout.
    pub async fn shutdown(&self) -> bool {
        let timeout = self.config.runtime.shutdown_timeout();
        let start = Instant::now();
        info!(timeout_ms = timeout.as_millis() as u64, "sharding backend shutting down");

        let pools_drained = self.manager.shutdown(timeout).await;
        let remaining = timeout.saturating_sub(start.elapsed());
        let runtime_drained = self.runtime.stop(remaining).await;

        let drained = pools_drained && runtime_drained;
        info!(drained, "sharding backend stopped");
        drained
    }
}
