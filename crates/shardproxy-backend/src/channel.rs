//! Backend channels
//!
//! A [`BackendChannel`] is one live connection to one datasource. It moves
//! through `Created -> Handshaking -> Idle <-> Acquired -> Closed` and is
//! only ever pooled with channels of the same datasource.
//!
//! A command marks the channel in flight until the backend's response has been
//! read to the end. If the future driving a command is dropped halfway (caller
//! cancellation, timeout), the flag stays set and the pool discards the
//! channel instead of handing a half-read stream to the next caller.

use crate::datasource::DataSourceConfig;
use crate::error::{Error, Result};
use crate::protocol::handshake::{self, Session};
use crate::protocol::message::{self, ResponseHeader, StmtPrepareOk};
use crate::protocol::packet::PacketStream;
use crate::protocol::CapabilityFlags;
use crate::runtime::BackendRuntime;
use crate::types::{Column, Row, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{:05x}", self.0)
    }
}

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Socket connected, no login yet
    Created,
    /// Login in progress
    Handshaking,
    /// Parked in its pool
    Idle,
    /// Checked out by a caller
    Acquired,
    /// Closed; never reused
    Closed,
}

/// Response to a statement
#[derive(Debug, Clone)]
pub enum QueryResponse {
    /// No result set (DML, DDL, SET ...)
    Ok(message::OkPacket),
    /// Result set header; rows follow through [`BackendChannel::next_row`]
    ResultSet(Arc<[Column]>),
}

#[derive(Debug, Clone)]
struct PreparedStatement {
    id: u32,
    num_params: u16,
}

/// Bounded per-channel cache of server-side prepared statements
#[derive(Debug)]
struct StatementCache {
    capacity: usize,
    entries: HashMap<String, PreparedStatement>,
    order: VecDeque<String>,
}

impl StatementCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, sql: &str) -> Option<PreparedStatement> {
        let stmt = self.entries.get(sql)?.clone();
        if let Some(pos) = self.order.iter().position(|k| k == sql) {
            if let Some(key) = self.order.remove(pos) {
                self.order.push_back(key);
            }
        }
        Some(stmt)
    }

    /// Insert and return the evicted statement, if any
    fn insert(&mut self, sql: &str, stmt: PreparedStatement) -> Option<PreparedStatement> {
        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                evicted = self.entries.remove(&oldest);
            }
        }
        self.entries.insert(sql.to_string(), stmt);
        self.order.push_back(sql.to_string());
        evicted
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug)]
struct PendingRows {
    columns: Arc<[Column]>,
    binary: bool,
}

/// One live connection to a backend datasource
pub struct BackendChannel {
    id: ChannelId,
    datasource: Arc<DataSourceConfig>,
    stream: PacketStream,
    state: ChannelState,
    session: Option<Session>,
    handshakes: u32,
    created_at: Instant,
    last_used: Instant,
    in_flight: bool,
    broken: bool,
    pending: Option<PendingRows>,
    statements: StatementCache,
}

impl fmt::Debug for BackendChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendChannel")
            .field("id", &self.id)
            .field("datasource", &self.datasource.name)
            .field("state", &self.state)
            .field("in_flight", &self.in_flight)
            .field("broken", &self.broken)
            .field("statements", &self.statements.len())
            .finish_non_exhaustive()
    }
}

impl BackendChannel {
    /// Connect a new channel on the runtime's socket configuration
    pub async fn open(
        datasource: Arc<DataSourceConfig>,
        runtime: &BackendRuntime,
        statement_cache_size: usize,
    ) -> Result<Self> {
        let tcp = runtime
            .socket_options()
            .connect(&datasource.host, datasource.port)
            .await
            .map_err(|e| {
                Error::unreachable_with_source(
                    datasource.name.as_str(),
                    format!("connect to {} failed: {e}", datasource.address()),
                    e,
                )
            })?;

        let id = ChannelId::next();
        let stream = PacketStream::new(
            tcp,
            Arc::clone(runtime.buffers()),
            Arc::from(datasource.name.as_str()),
        );
        let now = Instant::now();
        debug!(channel = %id, datasource = %datasource.name, "channel connected");
        Ok(Self {
            id,
            datasource,
            stream,
            state: ChannelState::Created,
            session: None,
            handshakes: 0,
            created_at: now,
            last_used: now,
            in_flight: false,
            broken: false,
            pending: None,
            statements: StatementCache::new(statement_cache_size),
        })
    }

    /// Log in with the tagged datasource's credentials. Runs once per channel.
    pub async fn handshake(&mut self) -> Result<()> {
        if self.handshakes > 0 || self.state != ChannelState::Created {
            return Err(Error::protocol(format!(
                "channel {} already past its handshake",
                self.id
            )));
        }
        self.state = ChannelState::Handshaking;
        self.in_flight = true;
        match handshake::login(&mut self.stream, &self.datasource).await {
            Ok(session) => {
                debug!(
                    channel = %self.id,
                    datasource = %self.datasource.name,
                    server_version = %session.server_version,
                    connection_id = session.connection_id,
                    "handshake complete"
                );
                self.session = Some(session);
                self.handshakes += 1;
                self.in_flight = false;
                self.state = ChannelState::Idle;
                Ok(())
            }
            Err(e) => {
                self.broken = true;
                self.state = ChannelState::Closed;
                Err(e)
            }
        }
    }

    /// Trace every frame of this channel
    pub fn enable_frame_logging(&mut self) {
        let label = format!("{}@{}", self.id, self.datasource.name);
        self.stream.enable_frame_logging(label);
    }

    /// Whether frame tracing is on
    pub fn frame_logging(&self) -> bool {
        self.stream.frame_logging()
    }

    fn caps(&self) -> CapabilityFlags {
        self.session
            .as_ref()
            .map(|s| s.capabilities)
            .unwrap_or(CapabilityFlags::new(0))
    }

    fn begin_command(&mut self) -> Result<()> {
        if self.broken || self.state == ChannelState::Closed {
            return Err(Error::unreachable(
                self.datasource.name.as_str(),
                format!("channel {} is closed", self.id),
            ));
        }
        if self.session.is_none() {
            return Err(Error::protocol(format!(
                "channel {} has not completed its handshake",
                self.id
            )));
        }
        if self.pending.is_some() || self.in_flight {
            return Err(Error::invalid_request(format!(
                "channel {} still has an unread response",
                self.id
            )));
        }
        self.in_flight = true;
        self.last_used = Instant::now();
        Ok(())
    }

    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.breaks_channel() {
                self.broken = true;
            }
        }
        result
    }

    /// Send a text statement (COM_QUERY)
    pub async fn query(&mut self, sql: &str) -> Result<QueryResponse> {
        self.begin_command()?;
        let result = async {
            self.stream.write_command(&message::encode_query(sql)).await?;
            self.read_response(false).await
        }
        .await;
        self.observe(result)
    }

    /// Prepare (or reuse) `sql` and execute it with `params` (COM_STMT_EXECUTE)
    pub async fn execute_prepared(&mut self, sql: &str, params: &[Value]) -> Result<QueryResponse> {
        self.begin_command()?;
        let result = self.execute_prepared_inner(sql, params).await;
        self.observe(result)
    }

    async fn execute_prepared_inner(&mut self, sql: &str, params: &[Value]) -> Result<QueryResponse> {
        let stmt = self.prepare(sql).await?;
        if usize::from(stmt.num_params) != params.len() {
            self.in_flight = false;
            return Err(Error::invalid_request(format!(
                "statement expects {} parameters, {} bound",
                stmt.num_params,
                params.len()
            )));
        }
        self.stream
            .write_command(&message::encode_execute(stmt.id, params))
            .await?;
        self.read_response(true).await
    }

    async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        if let Some(stmt) = self.statements.get(sql) {
            return Ok(stmt);
        }

        self.stream
            .write_command(&message::encode_prepare(sql))
            .await?;
        let packet = self.stream.read_packet().await?;
        if packet.first() == Some(&0xFF) {
            self.in_flight = false;
            return Err(message::ErrPacket::parse(&packet, self.caps())?.into_error());
        }
        let ok = StmtPrepareOk::parse(&packet)?;
        self.skip_definitions(usize::from(ok.num_params)).await?;
        self.skip_definitions(usize::from(ok.num_columns)).await?;

        let stmt = PreparedStatement {
            id: ok.statement_id,
            num_params: ok.num_params,
        };
        trace!(channel = %self.id, statement_id = ok.statement_id, "statement prepared");
        if let Some(evicted) = self.statements.insert(sql, stmt.clone()) {
            self.stream
                .write_command(&message::encode_stmt_close(evicted.id))
                .await?;
            trace!(channel = %self.id, statement_id = evicted.id, "statement evicted");
        }
        Ok(stmt)
    }

    async fn skip_definitions(&mut self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        for _ in 0..count {
            self.stream.read_packet().await?;
        }
        if !self.caps().has(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
            let eof = self.stream.read_packet().await?;
            if !message::is_terminator(&eof, self.caps()) {
                return Err(Error::protocol("expected EOF after definitions"));
            }
        }
        Ok(())
    }

    async fn read_response(&mut self, binary: bool) -> Result<QueryResponse> {
        let caps = self.caps();
        let packet = self.stream.read_packet().await?;
        match ResponseHeader::parse(&packet, caps)? {
            ResponseHeader::Ok(ok) => {
                self.in_flight = false;
                Ok(QueryResponse::Ok(ok))
            }
            ResponseHeader::Err(err) => {
                self.in_flight = false;
                Err(err.into_error())
            }
            ResponseHeader::LocalInfile(file) => {
                // Decline by sending an empty file, then consume the verdict
                self.stream.write_packet(&[]).await?;
                let verdict = self.stream.read_packet().await?;
                if verdict.first() == Some(&0xFF) {
                    message::ErrPacket::parse(&verdict, caps)?;
                } else {
                    message::OkPacket::parse(&verdict, caps)?;
                }
                self.in_flight = false;
                Err(Error::invalid_request(format!(
                    "LOAD DATA LOCAL INFILE '{file}' is not supported"
                )))
            }
            ResponseHeader::ResultSet(count) => {
                let count = usize::try_from(count)
                    .map_err(|_| Error::protocol("column count overflow"))?;
                let mut columns = Vec::with_capacity(count);
                for _ in 0..count {
                    let packet = self.stream.read_packet().await?;
                    columns.push(message::parse_column(&packet)?);
                }
                if !caps.has(CapabilityFlags::CLIENT_DEPRECATE_EOF) {
                    let eof = self.stream.read_packet().await?;
                    if !message::is_terminator(&eof, caps) {
                        return Err(Error::protocol("expected EOF after column definitions"));
                    }
                }
                let columns: Arc<[Column]> = columns.into();
                self.pending = Some(PendingRows {
                    columns: Arc::clone(&columns),
                    binary,
                });
                Ok(QueryResponse::ResultSet(columns))
            }
        }
    }

    /// Next row of the pending result set; `None` once it is exhausted
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        let result = self.next_row_inner().await;
        self.observe(result)
    }

    async fn next_row_inner(&mut self) -> Result<Option<Row>> {
        let Some(pending) = &self.pending else {
            return Ok(None);
        };
        let (columns, binary) = (Arc::clone(&pending.columns), pending.binary);
        let caps = self.caps();

        let packet = self.stream.read_packet().await?;
        if packet.first() == Some(&0xFF) {
            self.pending = None;
            self.in_flight = false;
            return Err(message::ErrPacket::parse(&packet, caps)?.into_error());
        }
        if message::is_terminator(&packet, caps) {
            message::parse_terminator(&packet, caps)?;
            self.pending = None;
            self.in_flight = false;
            self.last_used = Instant::now();
            return Ok(None);
        }

        let row = if binary {
            message::decode_binary_row(&packet, &columns)?
        } else {
            message::decode_text_row(&packet, &columns)?
        };
        Ok(Some(row))
    }

    /// Read and discard the rest of the pending result set
    pub async fn drain(&mut self) -> Result<u64> {
        let mut skipped = 0;
        while self.next_row().await?.is_some() {
            skipped += 1;
        }
        Ok(skipped)
    }

    /// Liveness check (COM_PING)
    pub async fn ping(&mut self) -> Result<()> {
        self.begin_command()?;
        let result = async {
            self.stream.write_command(&message::encode_ping()).await?;
            let packet = self.stream.read_packet().await?;
            self.in_flight = false;
            match packet.first() {
                Some(0xFF) => Err(message::ErrPacket::parse(&packet, self.caps())?.into_error()),
                _ => message::OkPacket::parse(&packet, self.caps()).map(|_| ()),
            }
        }
        .await;
        self.observe(result)
    }

    /// Close the channel, sending COM_QUIT when the stream is still in sync
    pub async fn close(mut self) {
        if self.state == ChannelState::Closed && self.broken {
            return;
        }
        if self.session.is_some() && self.is_reusable() {
            let _ = self.stream.write_command(&message::encode_quit()).await;
        }
        let _ = self.stream.shutdown().await;
        self.state = ChannelState::Closed;
        debug!(channel = %self.id, datasource = %self.datasource.name, "channel closed");
    }

    /// Whether the channel can go back to idle
    pub fn is_reusable(&self) -> bool {
        !self.broken
            && !self.in_flight
            && self.pending.is_none()
            && self.session.is_some()
            && self.state != ChannelState::Closed
    }

    /// Flag the channel so its pool discards it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the channel has been flagged unusable
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Whether a result set is still being read
    pub fn has_pending_rows(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    /// Channel id
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Datasource this channel is bound to
    pub fn datasource(&self) -> &Arc<DataSourceConfig> {
        &self.datasource
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// How many times the login sequence ran on this channel
    pub fn handshake_count(&self) -> u32 {
        self.handshakes
    }

    /// Backend version reported in the greeting
    pub fn server_version(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.server_version.as_str())
    }

    /// Backend connection id
    pub fn connection_id(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.connection_id)
    }

    /// Time since the channel was connected
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last command
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}
