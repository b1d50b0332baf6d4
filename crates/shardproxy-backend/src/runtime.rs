//! Backend I/O runtime
//!
//! One [`BackendRuntime`] exists per process. Every pool's channels are
//! created on it and every per-shard execution runs on it. It either owns a
//! dedicated multi-threaded tokio runtime sized to the available parallelism,
//! or attaches to a runtime the embedding process already runs.
//!
//! Socket configuration lives in [`SocketOptions`] and is applied to every
//! channel at creation: keep-alive, no send delay, a bounded connect timeout,
//! a bounded number of connects in progress and optional kernel buffer sizes.
//! The [`IoStrategy`] picks between OS-specific keep-alive tuning and a
//! portable subset.

use crate::buffer_pool::BufferPool;
use crate::config::RuntimeSettings;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Socket handling strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoStrategy {
    /// Native where the platform supports it, portable otherwise
    #[default]
    Auto,
    /// OS-specific keep-alive probing (interval and retry count)
    Native,
    /// Options available on every platform
    Portable,
}

impl IoStrategy {
    /// Whether this build targets a platform with native keep-alive tuning
    pub const fn native_supported() -> bool {
        cfg!(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd"
        ))
    }

    /// Resolve `Auto`, and `Native` on platforms without support
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto if Self::native_supported() => Self::Native,
            Self::Auto => Self::Portable,
            Self::Native if !Self::native_supported() => {
                warn!("native io strategy unavailable on this platform, using portable");
                Self::Portable
            }
            other => other,
        }
    }
}

/// Options applied to every backend socket
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Bounded connect timeout, covering resolution and connect
    pub connect_timeout: Duration,
    /// SO_KEEPALIVE
    pub keepalive: bool,
    /// Idle time before the first keep-alive packet
    pub keepalive_time: Duration,
    /// TCP_NODELAY
    pub nodelay: bool,
    /// Connects allowed in progress at once; further connects queue
    pub backlog: u32,
    /// SO_RCVBUF
    pub recv_buffer_size: Option<u32>,
    /// SO_SNDBUF
    pub send_buffer_size: Option<u32>,
    /// Resolved strategy (never `Auto`)
    pub strategy: IoStrategy,
    connect_slots: Arc<Semaphore>,
}

impl SocketOptions {
    /// Derive options from runtime settings
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            keepalive: settings.keepalive,
            keepalive_time: Duration::from_secs(settings.keepalive_time_secs),
            nodelay: settings.nodelay,
            backlog: settings.backlog,
            recv_buffer_size: settings.recv_buffer_size,
            send_buffer_size: settings.send_buffer_size,
            strategy: settings.io_strategy.resolve(),
            connect_slots: Arc::new(Semaphore::new(settings.backlog.max(1) as usize)),
        }
    }

    fn socket_for(&self, addr: &SocketAddr) -> io::Result<TcpSocket> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(self.keepalive)?;
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        Ok(socket)
    }

    /// Connect to `host:port` within `connect_timeout`, trying each resolved
    /// address in turn. Waiting for a connect slot counts against the timeout.
    pub async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let deadline = Instant::now() + self.connect_timeout;
        let timed_out = || {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "connect to {host}:{port} timed out after {}ms",
                    self.connect_timeout.as_millis()
                ),
            )
        };

        let _slot = tokio::time::timeout_at(deadline, self.connect_slots.acquire())
            .await
            .map_err(|_| timed_out())?
            .map_err(|_| io::Error::other("connect slots closed"))?;

        let addrs: Vec<SocketAddr> =
            tokio::time::timeout_at(deadline, tokio::net::lookup_host((host, port)))
                .await
                .map_err(|_| timed_out())??
                .collect();

        let mut last_err = None;
        for addr in addrs {
            let socket = self.socket_for(&addr)?;
            match tokio::time::timeout_at(deadline, socket.connect(addr)).await {
                Ok(Ok(stream)) => {
                    self.tune(&stream)?;
                    debug!(%addr, "backend socket connected");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
                Err(_) => return Err(timed_out()),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{host}:{port} resolved to no addresses"),
            )
        }))
    }

    fn tune(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        if !self.keepalive {
            return Ok(());
        }

        let sock_ref = SockRef::from(stream);
        let keepalive = TcpKeepalive::new().with_time(self.keepalive_time);
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd"
        ))]
        let keepalive = if self.strategy == IoStrategy::Native {
            keepalive
                .with_interval(Duration::from_secs(10))
                .with_retries(3)
        } else {
            keepalive
        };
        sock_ref.set_tcp_keepalive(&keepalive)
    }
}

/// Process-wide I/O substrate for backend channels
pub struct BackendRuntime {
    handle: Handle,
    owned: Mutex<Option<Runtime>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    buffers: Arc<BufferPool>,
    sockets: SocketOptions,
    worker_threads: usize,
}

impl std::fmt::Debug for BackendRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRuntime")
            .field("dedicated", &self.owned.lock().is_some())
            .field("worker_threads", &self.worker_threads)
            .field("strategy", &self.sockets.strategy)
            .field("in_flight", &self.tracker.len())
            .finish()
    }
}

impl BackendRuntime {
    /// Start a dedicated multi-threaded runtime
    pub fn start(settings: &RuntimeSettings) -> Result<Arc<Self>> {
        let worker_threads = settings.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("shardproxy-io")
            .enable_all()
            .build()
            .map_err(|e| Error::config(format!("failed to build io runtime: {e}")))?;

        let this = Self::build(runtime.handle().clone(), Some(runtime), settings, worker_threads);
        info!(
            worker_threads,
            strategy = ?this.sockets.strategy,
            "backend io runtime started"
        );
        Ok(Arc::new(this))
    }

    /// Run channels on an existing runtime instead of a dedicated one
    pub fn attach(handle: Handle, settings: &RuntimeSettings) -> Arc<Self> {
        let worker_threads = handle.metrics().num_workers();
        let this = Self::build(handle, None, settings, worker_threads);
        info!(
            worker_threads,
            strategy = ?this.sockets.strategy,
            "backend io runtime attached"
        );
        Arc::new(this)
    }

    fn build(
        handle: Handle,
        owned: Option<Runtime>,
        settings: &RuntimeSettings,
        worker_threads: usize,
    ) -> Self {
        Self {
            handle,
            owned: Mutex::new(owned),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            buffers: Arc::new(BufferPool::new(settings.buffers_per_class)),
            sockets: SocketOptions::from_settings(settings),
            worker_threads,
        }
    }

    /// Spawn channel work on the runtime; rejected once `stop` has begun
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        Ok(self.tracker.spawn_on(future, &self.handle))
    }

    /// Runtime handle
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Socket options applied to every channel
    pub fn socket_options(&self) -> &SocketOptions {
        &self.sockets
    }

    /// Shared frame buffer pool
    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Token cancelled when `stop` begins; background watchers derive child tokens
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Whether `stop` has begun
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Tasks spawned through the runtime that have not finished yet
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Worker thread count
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Stop accepting work, wait up to `drain_timeout` for in-flight tasks,
    /// then release a dedicated runtime's threads.
    ///
    /// Returns whether everything drained in time.
    pub async fn stop(&self, drain_timeout: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();

        let drained = tokio::time::timeout(drain_timeout, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                in_flight = self.tracker.len(),
                "io runtime drain timed out, abandoning remaining tasks"
            );
        }

        if let Some(runtime) = self.owned.lock().take() {
            runtime.shutdown_background();
        }
        info!(drained, "backend io runtime stopped");
        drained
    }
}

impl Drop for BackendRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.owned.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
