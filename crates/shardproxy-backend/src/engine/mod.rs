//! Execute engines
//!
//! Four strategies share the [`ExecuteEngine`] contract, one per combination
//! of [`ProxyMode`] and [`StatementKind`]:
//!
//! | | Text | Prepared |
//! |---|---|---|
//! | `MEMORY_STRICTLY` | [`TextMemoryStrictlyEngine`] | [`StatementMemoryStrictlyEngine`] |
//! | `CONNECTION_STRICTLY` | [`TextConnectionStrictlyEngine`] | [`StatementConnectionStrictlyEngine`] |
//!
//! Every engine fans a request out to its targets concurrently on the backend
//! I/O runtime. Each target yields its own [`ShardResult`], so one shard's
//! failure never hides another shard's rows.

mod factory;
mod memory;
mod result;
mod stream;

pub use factory::ExecuteEngineFactory;
pub use memory::{StatementMemoryStrictlyEngine, TextMemoryStrictlyEngine};
pub use result::{
    ExecutionResult, MergeOrder, MergedRowStream, MergedRows, RowComparator, RowSet,
    ShardError, ShardOutput, ShardResult, ShardRow, SortDirection, UpdateCount,
};
pub use stream::{ShardRowStream, StatementConnectionStrictlyEngine, TextConnectionStrictlyEngine};

use stream::ActivityClock;

use crate::channel::QueryResponse;
use crate::config::EngineSettings;
use crate::error::{Error, Result};
use crate::manager::ChannelPoolManager;
use crate::types::Value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Process-wide execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyMode {
    /// Buffer results, release channels early
    MemoryStrictly,
    /// Stream results, hold channels until read
    ConnectionStrictly,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryStrictly => write!(f, "MEMORY_STRICTLY"),
            Self::ConnectionStrictly => write!(f, "CONNECTION_STRICTLY"),
        }
    }
}

impl FromStr for ProxyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "MEMORY_STRICTLY" => Ok(Self::MemoryStrictly),
            "CONNECTION_STRICTLY" => Ok(Self::ConnectionStrictly),
            other => Err(Error::config(format!("unknown proxy mode '{other}'"))),
        }
    }
}

/// Statement protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Plain SQL text (COM_QUERY)
    Text,
    /// Prepared statement with bound parameters (COM_STMT_EXECUTE)
    Prepared,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Prepared => write!(f, "prepared"),
        }
    }
}

/// A routed statement and the datasources it must run on
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    kind: StatementKind,
    sql: String,
    parameters: Vec<Value>,
    targets: Vec<String>,
    merge: MergeOrder,
    cancellation: Option<CancellationToken>,
}

impl ExecutionRequest {
    /// Text statement for `targets`
    pub fn text<I, S>(sql: impl Into<String>, targets: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(StatementKind::Text, sql.into(), Vec::new(), targets)
    }

    /// Prepared statement with bound `parameters` for `targets`
    pub fn prepared<I, S>(sql: impl Into<String>, parameters: Vec<Value>, targets: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(StatementKind::Prepared, sql.into(), parameters, targets)
    }

    fn build<I, S>(
        kind: StatementKind,
        sql: String,
        parameters: Vec<Value>,
        targets: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if sql.trim().is_empty() {
            return Err(Error::invalid_request("statement is empty"));
        }
        if kind == StatementKind::Text && !parameters.is_empty() {
            return Err(Error::invalid_request("text statements take no parameters"));
        }

        let mut unique: Vec<String> = Vec::new();
        for target in targets {
            let target = target.into();
            if !unique.contains(&target) {
                unique.push(target);
            }
        }
        if unique.is_empty() {
            return Err(Error::invalid_request("no target datasource"));
        }

        Ok(Self {
            kind,
            sql,
            parameters,
            targets: unique,
            merge: MergeOrder::Concatenate,
            cancellation: None,
        })
    }

    /// Merge rows from several shards in this order
    pub fn with_merge(mut self, merge: MergeOrder) -> Self {
        self.merge = merge;
        self
    }

    /// Abort the execution when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Statement protocol
    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// Statement text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bound parameters (prepared only)
    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    /// Target datasource names, duplicates removed, order kept
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Requested merge order
    pub fn merge(&self) -> &MergeOrder {
        &self.merge
    }

    /// Cancellation token, if any
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub(crate) fn expect_kind(&self, kind: StatementKind) -> Result<()> {
        if self.kind != kind {
            return Err(Error::invalid_request(format!(
                "{kind} engine cannot run a {} statement",
                self.kind
            )));
        }
        Ok(())
    }

    /// Parameters to send: the request's own, or the engine's when the request has none
    pub(crate) fn bind_parameters(&self, bound: &[Value]) -> Result<Arc<[Value]>> {
        if self.parameters.is_empty() {
            return Ok(bound.into());
        }
        if bound.is_empty() || bound == self.parameters.as_slice() {
            return Ok(self.parameters.as_slice().into());
        }
        Err(Error::invalid_request(
            "request parameters differ from the engine's bound parameters",
        ))
    }
}

/// Shared state of every engine
#[derive(Debug, Clone)]
pub struct EngineContext {
    manager: Arc<ChannelPoolManager>,
    settings: EngineSettings,
}

impl EngineContext {
    /// Engines acquiring channels from `manager`
    pub fn new(manager: Arc<ChannelPoolManager>, settings: EngineSettings) -> Self {
        Self { manager, settings }
    }

    /// Channel pool manager
    pub fn manager(&self) -> &Arc<ChannelPoolManager> {
        &self.manager
    }

    /// Engine settings
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

/// Executes a request against each of its targets
#[async_trait]
pub trait ExecuteEngine: Send + Sync + fmt::Debug {
    /// Resource strategy
    fn mode(&self) -> ProxyMode;

    /// Statement protocol
    fn statement_kind(&self) -> StatementKind;

    /// Parameters bound at creation (prepared engines)
    fn parameters(&self) -> &[Value] {
        &[]
    }

    /// Run the request on every target
    ///
    /// Per-shard failures are part of the result. `Err` is returned only when
    /// the request does not fit the engine.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult>;
}

/// What happens to a channel once a result set header has been read
#[derive(Debug, Clone)]
pub(crate) enum Retention {
    /// Read every row, then release
    Buffer,
    /// Hand the channel to a stream; streams of one execution share `activity`
    Stream {
        idle_timeout: Duration,
        activity: Arc<ActivityClock>,
    },
}

impl Retention {
    pub(crate) fn stream(idle_timeout: Duration) -> Self {
        Self::Stream {
            idle_timeout,
            activity: ActivityClock::new(),
        }
    }
}

pub(crate) async fn fan_out(
    context: &EngineContext,
    request: &ExecutionRequest,
    parameters: Option<Arc<[Value]>>,
    retention: Retention,
    mode: ProxyMode,
) -> ExecutionResult {
    let sql: Arc<str> = Arc::from(request.sql());
    let runtime = context.manager.runtime();

    let tasks: Vec<_> = request
        .targets()
        .iter()
        .map(|target| {
            let datasource: Arc<str> = Arc::from(target.as_str());
            let task = run_shard(
                Arc::clone(&context.manager),
                Arc::clone(&datasource),
                Arc::clone(&sql),
                parameters.clone(),
                retention.clone(),
                context.settings.query_timeout(),
                request.cancellation().cloned(),
            );
            (datasource, runtime.spawn(task))
        })
        .collect();

    let shards = futures::future::join_all(tasks.into_iter().map(|(datasource, task)| async move {
        let outcome = match task {
            Ok(handle) => handle
                .await
                .unwrap_or_else(|e| Err(Error::protocol(format!("shard task failed: {e}")))),
            Err(e) => Err(e),
        };
        ShardResult {
            datasource,
            outcome,
        }
    }))
    .await;

    if let Retention::Stream { activity, .. } = &retention {
        // the consumer's idle time starts once the result is handed over
        activity.touch();
    }

    debug!(
        mode = %mode,
        targets = shards.len(),
        failed = shards.iter().filter(|s| s.outcome.is_err()).count(),
        "statement executed"
    );
    ExecutionResult::new(mode, request.merge().clone(), shards)
}

async fn run_shard(
    manager: Arc<ChannelPoolManager>,
    datasource: Arc<str>,
    sql: Arc<str>,
    parameters: Option<Arc<[Value]>>,
    retention: Retention,
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
) -> Result<ShardOutput> {
    let work = async {
        let exec = execute_on(&manager, &datasource, &sql, parameters.as_deref(), &retention);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, exec).await.map_err(|_| {
                Error::timeout(format!(
                    "'{datasource}' did not respond within {}ms",
                    limit.as_millis()
                ))
            })?,
            None => exec.await,
        }
    };

    // dropping `work` mid-command leaves the channel in flight, so its pool discards it
    match cancellation {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            result = work => result,
        },
        None => work.await,
    }
}

async fn execute_on(
    manager: &ChannelPoolManager,
    datasource: &str,
    sql: &str,
    parameters: Option<&[Value]>,
    retention: &Retention,
) -> Result<ShardOutput> {
    let mut channel = manager.acquire(datasource).await?;
    let response = match parameters {
        Some(parameters) => channel.execute_prepared(sql, parameters).await?,
        None => channel.query(sql).await?,
    };

    match (response, retention) {
        (QueryResponse::Ok(ok), _) => {
            channel.release();
            Ok(ShardOutput::Update(ok.into()))
        }
        (QueryResponse::ResultSet(columns), Retention::Buffer) => {
            let mut rows = Vec::new();
            while let Some(row) = channel.next_row().await? {
                rows.push(row);
            }
            channel.release();
            Ok(ShardOutput::Rows(RowSet { columns, rows }))
        }
        (
            QueryResponse::ResultSet(columns),
            Retention::Stream {
                idle_timeout,
                activity,
            },
        ) => Ok(ShardOutput::Stream(ShardRowStream::open(
            channel,
            columns,
            manager.runtime(),
            *idle_timeout,
            Arc::clone(activity),
        ))),
    }
}
