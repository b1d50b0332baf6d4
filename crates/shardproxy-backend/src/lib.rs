//! # shardproxy-backend
//!
//! Backend-facing core of a MySQL sharding proxy: pooled channels to every
//! backend datasource and the engines that run one routed statement against
//! many shards.
//!
//! ## Features
//!
//! - **DataSource Registry**: connection URLs parsed once into immutable records
//! - **Channel Pools**: one bounded pool per datasource, created lazily, with a
//!   login handshake on every new channel
//! - **I/O Runtime**: shared tokio runtime with tuned sockets and pooled buffers
//! - **Execute Engines**: memory-strictly (buffer, release early) or
//!   connection-strictly (stream, hold channel) for text and prepared statements
//! - **Result Merging**: per-shard attribution, concatenation or sorted k-way merge
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shardproxy_backend::prelude::*;
//!
//! let config = BackendConfig::from_file("shardproxy.yaml")?;
//! let backend = ShardingBackend::start(config)?;
//!
//! let request = ExecutionRequest::text("SELECT id, name FROM t_order", ["ds_0", "ds_1"])?
//!     .with_merge(MergeOrder::Sorted(RowComparator::by_column(0)));
//! let merged = backend.execute(request).await?.merged_rows().await;
//!
//! backend.shutdown().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod backend;
pub mod buffer_pool;
pub mod channel;
pub mod config;
pub mod datasource;
pub mod engine;
pub mod error;
pub mod handler;
pub mod manager;
pub mod pool;
pub mod protocol;
pub mod runtime;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Values and metadata
    pub use crate::types::{Column, ColumnType, Row, SqlTime, Value};

    // Configuration
    pub use crate::config::{
        BackendConfig, DataSourceSettings, EngineSettings, PoolSettings, RuntimeSettings,
        SensitiveString,
    };
    pub use crate::datasource::{DataSourceConfig, DataSourceRegistry};

    // Channels and pools
    pub use crate::channel::{BackendChannel, ChannelId, ChannelState, QueryResponse};
    pub use crate::handler::{
        default_handler_factory, BackendChannelHandler, ChannelPoolHandler, HandlerFactory,
    };
    pub use crate::manager::ChannelPoolManager;
    pub use crate::pool::{ChannelPool, PoolConfig, PoolStats, PooledChannel};
    pub use crate::runtime::{BackendRuntime, IoStrategy};

    // Engines
    pub use crate::engine::{
        EngineContext, ExecuteEngine, ExecuteEngineFactory, ExecutionRequest, ExecutionResult,
        MergeOrder, MergedRowStream, MergedRows, ProxyMode, RowComparator, ShardError,
        ShardOutput, ShardResult, ShardRow, ShardRowStream, SortDirection, StatementKind,
        UpdateCount,
    };

    pub use crate::backend::ShardingBackend;
}

// Re-export commonly used items at crate root
pub use backend::ShardingBackend;
pub use error::{Error, Result};
pub use types::Value;
