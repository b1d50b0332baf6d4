//! Shared fixtures: an in-process MySQL backend speaking the real wire protocol

#![allow(dead_code)]

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use shardproxy_backend::prelude::*;
use shardproxy_backend::protocol::handshake::AuthPlugin;
use shardproxy_backend::protocol::{command, put_lenenc_bytes, put_lenenc_int, CapabilityFlags};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const USER: &str = "root";
pub const PASSWORD: &str = "s3cret";
pub const DATABASE: &str = "shard_db";

const LONGLONG: u8 = 0x08;
const VAR_STRING: u8 = 0xFD;
const NULL_TYPE: u8 = 0x06;
const DOUBLE: u8 = 0x05;

static TRACING: Once = Once::new();

/// Initialize tracing for tests (call once at start of test)
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("shardproxy_backend=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Column of a canned result set
#[derive(Debug, Clone, Copy)]
pub enum MockColumn {
    Int(&'static str),
    Text(&'static str),
}

impl MockColumn {
    fn name(self) -> &'static str {
        match self {
            Self::Int(name) | Self::Text(name) => name,
        }
    }

    fn type_code(self) -> u8 {
        match self {
            Self::Int(_) => LONGLONG,
            Self::Text(_) => VAR_STRING,
        }
    }
}

/// Canned response to one statement
#[derive(Debug, Clone)]
pub enum MockResponse {
    Rows {
        columns: Vec<MockColumn>,
        rows: Vec<Vec<Option<String>>>,
    },
    Ok {
        affected_rows: u64,
        last_insert_id: u64,
    },
    Error {
        code: u16,
        message: String,
    },
    /// Drop the connection without answering
    Disconnect,
}

impl MockResponse {
    /// Integer `id` column holding `ids`
    pub fn ids(ids: &[i64]) -> Self {
        Self::Rows {
            columns: vec![MockColumn::Int("id")],
            rows: ids.iter().map(|id| vec![Some(id.to_string())]).collect(),
        }
    }

    /// `(id, name)` rows
    pub fn users(rows: &[(i64, Option<&str>)]) -> Self {
        Self::Rows {
            columns: vec![MockColumn::Int("id"), MockColumn::Text("name")],
            rows: rows
                .iter()
                .map(|(id, name)| vec![Some(id.to_string()), name.map(str::to_string)])
                .collect(),
        }
    }

    pub fn affected(rows: u64) -> Self {
        Self::Ok {
            affected_rows: rows,
            last_insert_id: 0,
        }
    }

    fn column_count(&self) -> usize {
        match self {
            Self::Rows { columns, .. } => columns.len(),
            _ => 0,
        }
    }
}

/// Counters and knobs shared by every connection of one mock backend
#[derive(Debug, Default)]
pub struct MockState {
    pub connections: AtomicUsize,
    pub logins: AtomicUsize,
    pub failed_logins: AtomicUsize,
    pub queries: AtomicUsize,
    pub prepares: AtomicUsize,
    pub executes: AtomicUsize,
    pub statement_closes: AtomicUsize,
    pub pings: AtomicUsize,
    pub quits: AtomicUsize,
    pub reject_auth: AtomicBool,
    pub reject_next_logins: AtomicUsize,
    pub deprecate_eof: AtomicBool,
    pub delay_ms: AtomicU64,
    next_connection_id: AtomicU32,
    next_statement_id: AtomicU32,
    responses: Mutex<HashMap<String, MockResponse>>,
    executed_params: Mutex<Vec<Vec<Value>>>,
    databases: Mutex<Vec<Option<String>>>,
}

impl MockState {
    fn take_rejection(&self) -> bool {
        self.reject_next_logins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn response(&self, sql: &str) -> Option<MockResponse> {
        self.responses.lock().get(sql.trim()).cloned()
    }

    async fn delay(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// A MySQL server on a loopback port
pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<MockState>,
    accept: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());
        state.next_connection_id.store(1, Ordering::SeqCst);
        state.next_statement_id.store(1, Ordering::SeqCst);

        let accept_state = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let mut conn = MockConnection::new(socket, state);
                    let _ = conn.serve().await;
                });
            }
        });

        Self {
            addr,
            state,
            accept,
        }
    }

    /// Register the response to `sql` (text and prepared)
    pub fn respond(&self, sql: &str, response: MockResponse) -> &Self {
        self.state
            .responses
            .lock()
            .insert(sql.trim().to_string(), response);
        self
    }

    pub fn state(&self) -> &Arc<MockState> {
        &self.state
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn reject_auth(&self, reject: bool) {
        self.state.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Refuse only the next `count` logins
    pub fn reject_next_logins(&self, count: usize) {
        self.state.reject_next_logins.store(count, Ordering::SeqCst);
    }

    pub fn failed_logins(&self) -> usize {
        self.state.failed_logins.load(Ordering::SeqCst)
    }

    pub fn deprecate_eof(&self, enabled: bool) {
        self.state.deprecate_eof.store(enabled, Ordering::SeqCst);
    }

    pub fn logins(&self) -> usize {
        self.state.logins.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn executed_params(&self) -> Vec<Vec<Value>> {
        self.state.executed_params.lock().clone()
    }

    pub fn databases(&self) -> Vec<Option<String>> {
        self.state.databases.lock().clone()
    }

    pub fn url(&self) -> String {
        format!("jdbc:mysql://{}:{}/{}", self.addr.ip(), self.addr.port(), DATABASE)
    }

    pub fn settings(&self) -> DataSourceSettings {
        DataSourceSettings::new(self.url()).with_credentials(USER, PASSWORD)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// URL of a port nobody listens on
pub async fn unreachable_settings() -> DataSourceSettings {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    DataSourceSettings::new(format!("jdbc:mysql://127.0.0.1:{port}/{DATABASE}"))
        .with_credentials(USER, PASSWORD)
}

/// Configuration over `datasources` with test-friendly timeouts
pub fn config(mode: ProxyMode, datasources: Vec<(&str, DataSourceSettings)>) -> BackendConfig {
    let mut config = BackendConfig::new(mode)
        .with_pool(
            PoolSettings::default()
                .with_max_size(4)
                .with_acquire_timeout(Duration::from_millis(500)),
        )
        .with_runtime(RuntimeSettings::default().with_connect_timeout(Duration::from_millis(500)));
    for (name, settings) in datasources {
        config = config.with_datasource(name, settings);
    }
    config
}

/// Backend attached to the test's runtime
pub fn backend(config: BackendConfig) -> ShardingBackend {
    ShardingBackend::builder(config)
        .with_runtime_handle(tokio::runtime::Handle::current())
        .build()
        .unwrap()
}

/// Standalone manager over the given datasources
pub fn manager(
    datasources: Vec<(&str, DataSourceSettings)>,
    pool: PoolSettings,
) -> Arc<ChannelPoolManager> {
    let registry = DataSourceRegistry::new(
        datasources
            .iter()
            .map(|(name, settings)| DataSourceConfig::from_settings(name, settings).unwrap()),
    )
    .unwrap();
    let settings = RuntimeSettings::default().with_connect_timeout(Duration::from_millis(500));
    let runtime = BackendRuntime::attach(tokio::runtime::Handle::current(), &settings);
    Arc::new(ChannelPoolManager::new(
        Arc::new(registry),
        runtime,
        &pool,
        &EngineSettings::default(),
    ))
}

// ==================== Wire protocol ====================

struct MockConnection {
    socket: TcpStream,
    state: Arc<MockState>,
    seq: u8,
    read_buf: BytesMut,
    deprecate_eof: bool,
    statements: HashMap<u32, (String, usize)>,
}

impl MockConnection {
    fn new(socket: TcpStream, state: Arc<MockState>) -> Self {
        let deprecate_eof = state.deprecate_eof.load(Ordering::SeqCst);
        Self {
            socket,
            state,
            seq: 0,
            read_buf: BytesMut::new(),
            deprecate_eof,
            statements: HashMap::new(),
        }
    }

    async fn recv(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            if self.read_buf.len() >= 4 {
                let len = u32::from_le_bytes([self.read_buf[0], self.read_buf[1], self.read_buf[2], 0])
                    as usize;
                if self.read_buf.len() >= 4 + len {
                    self.seq = self.read_buf[3].wrapping_add(1);
                    self.read_buf.advance(4);
                    let payload = self.read_buf.split_to(len).to_vec();
                    return Ok(Some(payload));
                }
            }
            if self.socket.read_buf(&mut self.read_buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    async fn send(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_uint_le(payload.len() as u64, 3);
        frame.put_u8(self.seq);
        frame.put_slice(payload);
        self.seq = self.seq.wrapping_add(1);
        self.socket.write_all(&frame).await
    }

    fn capabilities(&self) -> u32 {
        let mut caps = CapabilityFlags::CLIENT_LONG_PASSWORD
            | CapabilityFlags::CLIENT_LONG_FLAG
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_TRANSACTIONS
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
        if self.deprecate_eof {
            caps |= CapabilityFlags::CLIENT_DEPRECATE_EOF;
        }
        caps
    }

    async fn serve(&mut self) -> std::io::Result<()> {
        if !self.login().await? {
            return Ok(());
        }
        loop {
            let Some(packet) = self.recv().await? else {
                return Ok(());
            };
            let Some((&cmd, body)) = packet.split_first() else {
                return Ok(());
            };
            match cmd {
                command::QUERY => {
                    self.state.queries.fetch_add(1, Ordering::SeqCst);
                    self.state.delay().await;
                    let sql = String::from_utf8_lossy(body).into_owned();
                    match self.state.response(&sql) {
                        Some(MockResponse::Disconnect) => return Ok(()),
                        Some(response) => self.send_response(&response, false).await?,
                        None => self.send_err(1064, &format!("syntax error near '{sql}'")).await?,
                    }
                }
                command::STMT_PREPARE => {
                    self.state.prepares.fetch_add(1, Ordering::SeqCst);
                    let sql = String::from_utf8_lossy(body).into_owned();
                    match self.state.response(&sql) {
                        Some(response) => self.send_prepare_ok(&sql, &response).await?,
                        None => self.send_err(1146, "Table 'shard_db.unknown' doesn't exist").await?,
                    }
                }
                command::STMT_EXECUTE => {
                    self.state.executes.fetch_add(1, Ordering::SeqCst);
                    self.state.delay().await;
                    let id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                    let Some((sql, num_params)) = self.statements.get(&id).cloned() else {
                        self.send_err(1243, "Unknown prepared statement handler").await?;
                        continue;
                    };
                    let params = decode_params(&body[9..], num_params);
                    self.state.executed_params.lock().push(params);
                    match self.state.response(&sql) {
                        Some(MockResponse::Disconnect) => return Ok(()),
                        Some(response) => self.send_response(&response, true).await?,
                        None => self.send_err(1064, "statement vanished").await?,
                    }
                }
                command::STMT_CLOSE => {
                    self.state.statement_closes.fetch_add(1, Ordering::SeqCst);
                    let id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                    self.statements.remove(&id);
                }
                command::PING => {
                    self.state.pings.fetch_add(1, Ordering::SeqCst);
                    self.state.delay().await;
                    self.send_ok(0, 0).await?;
                }
                command::QUIT => {
                    self.state.quits.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
                _ => self.send_err(1047, "Unknown command").await?,
            }
        }
    }

    async fn login(&mut self) -> std::io::Result<bool> {
        let nonce: Vec<u8> = (1..=20u8).map(|b| b.wrapping_mul(7) | 0x01).collect();
        let connection_id = self.state.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let caps = self.capabilities();

        let mut greeting = BytesMut::new();
        greeting.put_u8(10);
        greeting.put_slice(b"8.0.36-mock\0");
        greeting.put_u32_le(connection_id);
        greeting.put_slice(&nonce[..8]);
        greeting.put_u8(0);
        greeting.put_u16_le((caps & 0xFFFF) as u16);
        greeting.put_u8(45);
        greeting.put_u16_le(0x0002);
        greeting.put_u16_le((caps >> 16) as u16);
        greeting.put_u8(21);
        greeting.put_slice(&[0u8; 10]);
        greeting.put_slice(&nonce[8..]);
        greeting.put_u8(0);
        greeting.put_slice(b"mysql_native_password\0");
        self.seq = 0;
        self.send(&greeting).await?;

        let Some(response) = self.recv().await? else {
            return Ok(false);
        };
        let mut r = &response[..];
        let client_caps = r.get_u32_le();
        r.advance(4 + 1 + 23);
        let user_end = r.iter().position(|&b| b == 0).unwrap_or(r.len());
        let user = String::from_utf8_lossy(&r[..user_end]).into_owned();
        r.advance(user_end + 1);
        let auth_len = r.get_u8() as usize;
        let auth = r[..auth_len].to_vec();
        r.advance(auth_len);
        let database = if client_caps & CapabilityFlags::CLIENT_CONNECT_WITH_DB != 0 {
            let end = r.iter().position(|&b| b == 0).unwrap_or(r.len());
            Some(String::from_utf8_lossy(&r[..end]).into_owned())
        } else {
            None
        };
        self.deprecate_eof =
            self.deprecate_eof && client_caps & CapabilityFlags::CLIENT_DEPRECATE_EOF != 0;

        let expected = AuthPlugin::NativePassword.scramble(PASSWORD, &nonce);
        let rejected = self.state.reject_auth.load(Ordering::SeqCst) || self.state.take_rejection();
        if rejected || user != USER || auth != expected {
            self.state.failed_logins.fetch_add(1, Ordering::SeqCst);
            self.send_err(1045, &format!("Access denied for user '{user}'"))
                .await?;
            return Ok(false);
        }

        self.state.databases.lock().push(database);
        self.state.logins.fetch_add(1, Ordering::SeqCst);
        self.send_ok(0, 0).await?;
        Ok(true)
    }

    async fn send_ok(&mut self, affected_rows: u64, last_insert_id: u64) -> std::io::Result<()> {
        let mut ok = BytesMut::new();
        ok.put_u8(0x00);
        put_lenenc_int(&mut ok, affected_rows);
        put_lenenc_int(&mut ok, last_insert_id);
        ok.put_u16_le(0x0002);
        ok.put_u16_le(0);
        self.send(&ok).await
    }

    async fn send_err(&mut self, code: u16, message: &str) -> std::io::Result<()> {
        let mut err = BytesMut::new();
        err.put_u8(0xFF);
        err.put_u16_le(code);
        err.put_slice(b"#HY000");
        err.put_slice(message.as_bytes());
        self.send(&err).await
    }

    async fn send_eof(&mut self) -> std::io::Result<()> {
        self.send(&[0xFE, 0x00, 0x00, 0x02, 0x00]).await
    }

    async fn send_terminator(&mut self) -> std::io::Result<()> {
        if self.deprecate_eof {
            self.send(&[0xFE, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]).await
        } else {
            self.send_eof().await
        }
    }

    async fn send_column(&mut self, column: MockColumn) -> std::io::Result<()> {
        let mut def = BytesMut::new();
        put_lenenc_bytes(&mut def, b"def");
        put_lenenc_bytes(&mut def, DATABASE.as_bytes());
        put_lenenc_bytes(&mut def, b"t");
        put_lenenc_bytes(&mut def, b"t");
        put_lenenc_bytes(&mut def, column.name().as_bytes());
        put_lenenc_bytes(&mut def, column.name().as_bytes());
        put_lenenc_int(&mut def, 0x0C);
        def.put_u16_le(45);
        def.put_u32_le(255);
        def.put_u8(column.type_code());
        def.put_u16_le(0);
        def.put_u8(0);
        def.put_u16_le(0);
        self.send(&def).await
    }

    async fn send_prepare_ok(&mut self, sql: &str, response: &MockResponse) -> std::io::Result<()> {
        let id = self.state.next_statement_id.fetch_add(1, Ordering::SeqCst);
        let num_params = sql.matches('?').count();
        let num_columns = response.column_count();
        self.statements.insert(id, (sql.to_string(), num_params));

        let mut ok = BytesMut::new();
        ok.put_u8(0x00);
        ok.put_u32_le(id);
        ok.put_u16_le(num_columns as u16);
        ok.put_u16_le(num_params as u16);
        ok.put_u8(0);
        ok.put_u16_le(0);
        self.send(&ok).await?;

        if num_params > 0 {
            for _ in 0..num_params {
                self.send_column(MockColumn::Text("?")).await?;
            }
            if !self.deprecate_eof {
                self.send_eof().await?;
            }
        }
        if let MockResponse::Rows { columns, .. } = response {
            for column in columns.clone() {
                self.send_column(column).await?;
            }
            if !self.deprecate_eof {
                self.send_eof().await?;
            }
        }
        Ok(())
    }

    async fn send_response(&mut self, response: &MockResponse, binary: bool) -> std::io::Result<()> {
        match response {
            MockResponse::Ok {
                affected_rows,
                last_insert_id,
            } => self.send_ok(*affected_rows, *last_insert_id).await,
            MockResponse::Error { code, message } => self.send_err(*code, message).await,
            MockResponse::Disconnect => Ok(()),
            MockResponse::Rows { columns, rows } => {
                let mut header = BytesMut::new();
                put_lenenc_int(&mut header, columns.len() as u64);
                self.send(&header).await?;
                for column in columns.clone() {
                    self.send_column(column).await?;
                }
                if !self.deprecate_eof {
                    self.send_eof().await?;
                }
                for row in rows {
                    let packet = if binary {
                        encode_binary_row(columns, row)
                    } else {
                        encode_text_row(row)
                    };
                    self.send(&packet).await?;
                }
                self.send_terminator().await
            }
        }
    }
}

fn encode_text_row(row: &[Option<String>]) -> BytesMut {
    let mut packet = BytesMut::new();
    for cell in row {
        match cell {
            Some(value) => put_lenenc_bytes(&mut packet, value.as_bytes()),
            None => packet.put_u8(0xFB),
        }
    }
    packet
}

fn encode_binary_row(columns: &[MockColumn], row: &[Option<String>]) -> BytesMut {
    let mut packet = BytesMut::new();
    packet.put_u8(0x00);
    let mut bitmap = vec![0u8; (columns.len() + 7 + 2) / 8];
    for (idx, cell) in row.iter().enumerate() {
        if cell.is_none() {
            let bit = idx + 2;
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
    }
    packet.put_slice(&bitmap);
    for (column, cell) in columns.iter().zip(row) {
        let Some(value) = cell else { continue };
        match column {
            MockColumn::Int(_) => packet.put_i64_le(value.parse().unwrap()),
            MockColumn::Text(_) => put_lenenc_bytes(&mut packet, value.as_bytes()),
        }
    }
    packet
}

fn decode_params(mut body: &[u8], count: usize) -> Vec<Value> {
    if count == 0 {
        return Vec::new();
    }
    let bitmap = body[..count.div_ceil(8)].to_vec();
    body.advance(count.div_ceil(8));
    let bound = body.get_u8();
    assert_eq!(bound, 1, "client must always send parameter types");
    let types: Vec<u8> = (0..count)
        .map(|_| {
            let ty = body.get_u8();
            body.advance(1);
            ty
        })
        .collect();

    let mut params = Vec::with_capacity(count);
    for (idx, ty) in types.into_iter().enumerate() {
        if bitmap[idx / 8] & (1 << (idx % 8)) != 0 || ty == NULL_TYPE {
            params.push(Value::Null);
            continue;
        }
        let value = match ty {
            LONGLONG => Value::Int(body.get_i64_le()),
            DOUBLE => Value::Double(body.get_f64_le()),
            _ => {
                let len = body.get_u8() as usize;
                let text = String::from_utf8_lossy(&body[..len]).into_owned();
                body.advance(len);
                Value::String(text)
            }
        };
        params.push(value);
    }
    params
}
