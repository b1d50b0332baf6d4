//! Connection-strictly execution: rows are read lazily off a held channel

use super::{fan_out, EngineContext, ExecuteEngine, ExecutionRequest, ExecutionResult};
use super::{ProxyMode, Retention, StatementKind};
use crate::error::{Error, Result};
use crate::pool::PooledChannel;
use crate::runtime::BackendRuntime;
use crate::types::{Column, Row, Value};
use async_trait::async_trait;
use futures::Stream;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Consumer activity shared by every stream of one execution
///
/// Reading any shard counts for all of them, so shards the consumer has not
/// reached yet keep their channels while an earlier shard is being read.
#[derive(Debug)]
pub(crate) struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        })
    }

    pub(crate) fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::AcqRel);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Acquire));
        self.origin.elapsed().saturating_sub(last)
    }
}

struct StreamState {
    channel: Option<PooledChannel>,
    expired: bool,
}

/// Rows of one shard, read on demand from a checked-out channel
///
/// The channel goes back to its pool when the last row has been read or
/// [`close`](Self::close) drains the rest. Dropping an unfinished stream
/// discards the channel. A consumer that stops reading every stream of its
/// execution for longer than the stream idle timeout loses the channels and
/// gets [`Error::Timeout`].
pub struct ShardRowStream {
    datasource: Arc<str>,
    columns: Arc<[Column]>,
    state: Arc<Mutex<StreamState>>,
    activity: Arc<ActivityClock>,
    watchdog: CancellationToken,
    rows_read: u64,
    finished: bool,
}

impl fmt::Debug for ShardRowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardRowStream")
            .field("datasource", &self.datasource)
            .field("columns", &self.columns.len())
            .field("rows_read", &self.rows_read)
            .field("finished", &self.finished)
            .finish()
    }
}

impl ShardRowStream {
    pub(crate) fn open(
        channel: PooledChannel,
        columns: Arc<[Column]>,
        runtime: &BackendRuntime,
        idle_timeout: Duration,
        activity: Arc<ActivityClock>,
    ) -> Self {
        let datasource: Arc<str> = Arc::from(channel.datasource().name.as_str());
        let state = Arc::new(Mutex::new(StreamState {
            channel: Some(channel),
            expired: false,
        }));
        let watchdog = runtime.shutdown_token().child_token();
        activity.touch();

        let task = watch_idle(
            Arc::downgrade(&state),
            Arc::clone(&activity),
            idle_timeout,
            watchdog.clone(),
            Arc::clone(&datasource),
        );
        if runtime.spawn(task).is_err() {
            debug!(datasource = %datasource, "runtime stopping, stream has no idle watchdog");
        }

        Self {
            datasource,
            columns,
            state,
            activity,
            watchdog,
            rows_read: 0,
            finished: false,
        }
    }

    /// Datasource the rows come from
    pub fn datasource(&self) -> &Arc<str> {
        &self.datasource
    }

    /// Column metadata
    pub fn columns(&self) -> &Arc<[Column]> {
        &self.columns
    }

    /// Rows read so far
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Whether the stream has ended and given up its channel
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next row; `None` once the result set is exhausted
    pub async fn next(&mut self) -> Result<Option<Row>> {
        if self.finished {
            return Ok(None);
        }
        self.activity.touch();
        let shared = Arc::clone(&self.state);
        let mut state = shared.lock().await;
        if state.expired {
            drop(state);
            self.finish();
            return Err(Error::timeout(format!(
                "stream from '{}' idle for too long, channel reclaimed",
                self.datasource
            )));
        }

        let result = match state.channel.as_mut() {
            Some(channel) => channel.next_row().await,
            None => Ok(None),
        };
        match result {
            Ok(Some(row)) => {
                self.activity.touch();
                self.rows_read += 1;
                Ok(Some(row))
            }
            Ok(None) => {
                if let Some(channel) = state.channel.take() {
                    channel.release();
                }
                drop(state);
                self.finish();
                Ok(None)
            }
            Err(e) => {
                // server errors leave the channel in sync, anything else marked it broken
                drop(state.channel.take());
                drop(state);
                self.finish();
                Err(e)
            }
        }
    }

    /// Read and discard the remaining rows, then release the channel
    pub async fn close(mut self) -> Result<u64> {
        let mut skipped = 0;
        while self.next().await?.is_some() {
            skipped += 1;
        }
        Ok(skipped)
    }

    /// Give up the channel without reading the rest
    pub async fn abort(mut self) {
        let channel = self.state.lock().await.channel.take();
        if let Some(channel) = channel {
            channel.discard("stream aborted");
        }
        self.finish();
    }

    /// Adapt into a [`futures::Stream`]
    pub fn into_stream(self) -> impl Stream<Item = Result<Row>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            match stream.next().await {
                Ok(Some(row)) => Some((Ok(row), stream)),
                Ok(None) => None,
                Err(e) => Some((Err(e), stream)),
            }
        })
    }

    fn finish(&mut self) {
        self.finished = true;
        self.watchdog.cancel();
    }
}

impl Drop for ShardRowStream {
    fn drop(&mut self) {
        self.watchdog.cancel();
        if self.finished {
            return;
        }
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(channel) = state.channel.take() {
                debug!(datasource = %self.datasource, rows_read = self.rows_read, "unfinished stream dropped");
                channel.discard("stream dropped");
            }
        }
    }
}

async fn watch_idle(
    state: Weak<Mutex<StreamState>>,
    activity: Arc<ActivityClock>,
    timeout: Duration,
    cancel: CancellationToken,
    datasource: Arc<str>,
) {
    let mut wait = timeout;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        let Some(state) = state.upgrade() else { return };
        // a read in progress counts as activity
        let Ok(mut guard) = state.try_lock() else {
            wait = timeout;
            continue;
        };
        if guard.channel.is_none() {
            return;
        }
        let idle = activity.idle_for();
        if idle < timeout {
            wait = timeout - idle;
            continue;
        }
        if let Some(channel) = guard.channel.take() {
            warn!(
                datasource = %datasource,
                idle_ms = idle.as_millis() as u64,
                "stream consumer idle, discarding channel"
            );
            channel.discard("stream idle timeout");
        }
        guard.expired = true;
        return;
    }
}

/// Streams text query results, holding each shard's channel until read
#[derive(Debug, Clone)]
pub struct TextConnectionStrictlyEngine {
    context: EngineContext,
}

impl TextConnectionStrictlyEngine {
    /// Create an engine over `context`
    pub fn new(context: EngineContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl ExecuteEngine for TextConnectionStrictlyEngine {
    fn mode(&self) -> ProxyMode {
        ProxyMode::ConnectionStrictly
    }

    fn statement_kind(&self) -> StatementKind {
        StatementKind::Text
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        request.expect_kind(StatementKind::Text)?;
        let retention = Retention::stream(self.context.settings().stream_idle_timeout());
        Ok(fan_out(&self.context, request, None, retention, ProxyMode::ConnectionStrictly).await)
    }
}

/// Streams prepared statement results, holding each shard's channel until read
#[derive(Debug, Clone)]
pub struct StatementConnectionStrictlyEngine {
    context: EngineContext,
    parameters: Vec<Value>,
}

impl StatementConnectionStrictlyEngine {
    /// Create an engine binding `parameters`
    pub fn new(context: EngineContext, parameters: Vec<Value>) -> Self {
        Self {
            context,
            parameters,
        }
    }
}

#[async_trait]
impl ExecuteEngine for StatementConnectionStrictlyEngine {
    fn mode(&self) -> ProxyMode {
        ProxyMode::ConnectionStrictly
    }

    fn statement_kind(&self) -> StatementKind {
        StatementKind::Prepared
    }

    fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        request.expect_kind(StatementKind::Prepared)?;
        let parameters = request.bind_parameters(&self.parameters)?;
        let retention = Retention::stream(self.context.settings().stream_idle_timeout());
        Ok(fan_out(
            &self.context,
            request,
            Some(parameters),
            retention,
            ProxyMode::ConnectionStrictly,
        )
        .await)
    }
}
