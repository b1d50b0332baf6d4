//! Per-datasource channel pool
//!
//! Every pool owns the channels of exactly one datasource. Capacity is a
//! semaphore with `max_size` permits: a permit is held for as long as a
//! channel is out, so at most `max_size` channels of a datasource are ever
//! open or being opened. Callers wait at most `acquire_timeout` for a permit
//! and get [`Error::PoolExhausted`] after that.
//!
//! Returning a channel is synchronous (the guard's `Drop`), so a channel can
//! be released from any task or thread. A channel that is broken, still
//! mid-response, or past its lifetime is closed instead of being pooled.

use crate::channel::{BackendChannel, ChannelState};
use crate::config::PoolSettings;
use crate::datasource::DataSourceConfig;
use crate::error::{Error, Result};
use crate::handler::ChannelPoolHandler;
use crate::runtime::BackendRuntime;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Channel pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum channels (idle plus in use)
    pub max_size: usize,
    /// Maximum time to wait for a channel
    pub acquire_timeout: Duration,
    /// Channels older than this are recycled
    pub max_lifetime: Option<Duration>,
    /// Channels idle longer than this are recycled
    pub idle_timeout: Option<Duration>,
    /// Ping idle channels before handing them out
    pub test_on_borrow: bool,
    /// Extra attempts with a fresh channel after a failed create
    pub handshake_retries: u32,
    /// Prepared statements cached per channel
    pub statement_cache_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_settings(&PoolSettings::default(), 64)
    }
}

impl PoolConfig {
    /// Build from the `pool` config section
    pub fn from_settings(settings: &PoolSettings, statement_cache_size: usize) -> Self {
        Self {
            max_size: settings.max_size,
            acquire_timeout: settings.acquire_timeout(),
            max_lifetime: settings.max_lifetime(),
            idle_timeout: settings.idle_timeout(),
            test_on_borrow: settings.test_on_borrow,
            handshake_retries: settings.handshake_retries.min(1),
            statement_cache_size: statement_cache_size.max(1),
        }
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set maximum channel lifetime
    pub fn with_max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable or disable test-on-borrow
    pub fn with_test_on_borrow(mut self, enabled: bool) -> Self {
        self.test_on_borrow = enabled;
        self
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Channels opened
    pub channels_created: u64,
    /// Channels closed
    pub channels_closed: u64,
    /// Successful acquisitions
    pub acquisitions: u64,
    /// Channels returned to idle
    pub releases: u64,
    /// Acquires that timed out
    pub exhausted_count: u64,
    /// Sum of acquire wait times
    pub total_wait_time_ms: u64,
    /// Failed connects or handshakes
    pub creation_failures: u64,
    /// Failed borrow-time pings
    pub health_check_failures: u64,
}

/// Lock-free pool counters
#[derive(Debug, Default)]
pub struct AtomicPoolStats {
    channels_created: AtomicU64,
    channels_closed: AtomicU64,
    acquisitions: AtomicU64,
    releases: AtomicU64,
    exhausted_count: AtomicU64,
    total_wait_time_ms: AtomicU64,
    creation_failures: AtomicU64,
    health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a channel creation
    pub fn record_created(&self) {
        self.channels_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a channel close
    pub fn record_closed(&self) {
        self.channels_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record a channel returned to idle
    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed connect or handshake
    pub fn record_creation_failure(&self) {
        self.creation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record health check failure
    pub fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            channels_created: self.channels_created.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }

    /// Average acquire wait in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        if acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / acquisitions as f64
        }
    }
}

/// Bounded set of channels to one datasource
pub struct ChannelPool {
    datasource: Arc<DataSourceConfig>,
    config: PoolConfig,
    runtime: Arc<BackendRuntime>,
    handler: Arc<dyn ChannelPoolHandler>,
    idle: Mutex<Vec<BackendChannel>>,
    permits: Arc<Semaphore>,
    total: AtomicUsize,
    checked_out: AtomicUsize,
    stats: AtomicPoolStats,
    closed: AtomicBool,
    returned: Notify,
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("datasource", &self.datasource.name)
            .field("max_size", &self.config.max_size)
            .field("size", &self.size())
            .field("idle", &self.idle_count())
            .field("in_use", &self.in_use())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelPool {
    /// Create an empty pool; channels are opened on demand
    pub fn new(
        datasource: Arc<DataSourceConfig>,
        config: PoolConfig,
        runtime: Arc<BackendRuntime>,
        handler: Arc<dyn ChannelPoolHandler>,
    ) -> Arc<Self> {
        let max_size = config.max_size.max(1);
        Arc::new(Self {
            datasource,
            config,
            runtime,
            handler,
            idle: Mutex::new(Vec::with_capacity(max_size)),
            permits: Arc::new(Semaphore::new(max_size)),
            total: AtomicUsize::new(0),
            checked_out: AtomicUsize::new(0),
            stats: AtomicPoolStats::new(),
            closed: AtomicBool::new(false),
            returned: Notify::new(),
        })
    }

    /// Hand out a ready channel, reusing an idle one when possible
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledChannel> {
        if self.is_closed() {
            return Err(Error::Shutdown);
        }

        let start = Instant::now();
        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Shutdown),
            Err(_) => {
                self.stats.record_exhausted();
                warn!(
                    datasource = %self.datasource.name,
                    max_size = self.config.max_size,
                    in_use = self.in_use(),
                    "channel pool exhausted"
                );
                return Err(Error::pool_exhausted(
                    self.datasource.name.as_str(),
                    format!(
                        "no channel available within {}ms ({} in use)",
                        self.config.acquire_timeout.as_millis(),
                        self.in_use()
                    ),
                ));
            }
        };

        let mut channel = match self.take_idle().await {
            Some(channel) => channel,
            None => self.create_channel().await?,
        };

        channel.set_state(ChannelState::Acquired);
        self.handler.channel_acquired(&channel);
        self.checked_out.fetch_add(1, Ordering::AcqRel);
        self.stats
            .record_acquisition(start.elapsed().as_millis() as u64);

        Ok(PooledChannel {
            channel: Some(channel),
            pool: Arc::clone(self),
            permit: Some(permit),
        })
    }

    async fn take_idle(&self) -> Option<BackendChannel> {
        loop {
            let mut channel = self.idle.lock().pop()?;
            if self.should_recycle(&channel) {
                self.discard(channel, "expired");
                continue;
            }
            if !channel.is_reusable() {
                self.discard(channel, "not reusable");
                continue;
            }
            if self.config.test_on_borrow {
                let mut check = BorrowCheck {
                    pool: self,
                    channel: Some(channel),
                };
                let result = check.ping().await;
                let Some(mut channel) = check.finish() else {
                    continue;
                };
                if let Err(e) = result {
                    self.stats.record_health_check_failure();
                    debug!(
                        channel = %channel.id(),
                        datasource = %self.datasource.name,
                        error = %e,
                        "idle channel failed health check"
                    );
                    channel.mark_broken();
                    self.discard(channel, "failed health check");
                    continue;
                }
                return Some(channel);
            }
            return Some(channel);
        }
    }

    async fn create_channel(&self) -> Result<BackendChannel> {
        let attempts = 1 + self.config.handshake_retries;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.create_once().await {
                Ok(channel) => {
                    self.total.fetch_add(1, Ordering::AcqRel);
                    self.stats.record_created();
                    return Ok(channel);
                }
                Err(Error::Shutdown) => return Err(Error::Shutdown),
                Err(e) => {
                    self.stats.record_creation_failure();
                    warn!(
                        datasource = %self.datasource.name,
                        attempt,
                        attempts,
                        error = %e,
                        "channel creation failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e @ Error::BackendUnreachable { .. }) => e,
            Some(e) => Error::unreachable_with_source(
                self.datasource.name.as_str(),
                "channel initialization failed",
                e,
            ),
            None => Error::unreachable(self.datasource.name.as_str(), "no channel created"),
        })
    }

    /// Connect and initialize on the I/O runtime, so a dropped acquire cannot
    /// leave a half-initialized channel behind.
    async fn create_once(&self) -> Result<BackendChannel> {
        let runtime = Arc::clone(&self.runtime);
        let datasource = Arc::clone(&self.datasource);
        let handler = Arc::clone(&self.handler);
        let cache_size = self.config.statement_cache_size;

        let task = self.runtime.spawn(async move {
            let mut channel = BackendChannel::open(datasource, &runtime, cache_size).await?;
            if let Err(e) = handler.channel_created(&mut channel).await {
                handler.channel_discarded(&channel, "initialization failed");
                return Err(e);
            }
            if !channel.is_reusable() || channel.handshake_count() != 1 {
                handler.channel_discarded(&channel, "handshake incomplete");
                return Err(Error::protocol(format!(
                    "channel {} was not logged in by its handler",
                    channel.id()
                )));
            }
            Ok(channel)
        })?;

        task.await.map_err(|e| {
            Error::unreachable(
                self.datasource.name.as_str(),
                format!("channel task failed: {e}"),
            )
        })?
    }

    fn should_recycle(&self, channel: &BackendChannel) -> bool {
        self.config
            .max_lifetime
            .is_some_and(|lifetime| channel.age() > lifetime)
            || self
                .config
                .idle_timeout
                .is_some_and(|timeout| channel.idle_for() > timeout)
    }

    fn release(&self, mut channel: BackendChannel) {
        if self.is_closed() {
            self.discard(channel, "pool closed");
            return;
        }
        if !channel.is_reusable() {
            self.discard(channel, "not reusable");
            return;
        }
        if self
            .config
            .max_lifetime
            .is_some_and(|lifetime| channel.age() > lifetime)
        {
            self.discard(channel, "expired");
            return;
        }

        channel.set_state(ChannelState::Idle);
        channel.touch();
        self.handler.channel_released(&channel);
        self.stats.record_release();
        self.idle.lock().push(channel);
    }

    fn discard(&self, channel: BackendChannel, reason: &str) {
        self.handler.channel_discarded(&channel, reason);
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.stats.record_closed();
        debug!(
            channel = %channel.id(),
            datasource = %self.datasource.name,
            reason,
            "closing channel"
        );
        if channel.is_broken() {
            drop(channel);
            return;
        }
        // a stopping runtime refuses the task; dropping still closes the socket
        let _ = self.runtime.spawn(channel.close());
    }

    /// Close idle channels and refuse further acquires
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let idle: Vec<_> = self.idle.lock().drain(..).collect();
        let count = idle.len();
        for channel in idle {
            self.discard(channel, "pool closed");
        }
        debug!(
            datasource = %self.datasource.name,
            closed_idle = count,
            in_use = self.in_use(),
            "channel pool closed"
        );
        self.returned.notify_waiters();
    }

    /// Wait until every acquired channel is back; `false` on timeout
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let returned = self.returned.notified();
            if self.in_use() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, returned).await.is_err() {
                return self.in_use() == 0;
            }
        }
    }

    /// Datasource served by this pool
    pub fn datasource(&self) -> &Arc<DataSourceConfig> {
        &self.datasource
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Open channels, idle or in use
    pub fn size(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Idle channels
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Channels currently handed out
    pub fn in_use(&self) -> usize {
        self.checked_out.load(Ordering::Acquire)
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Counter snapshot
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Average acquire wait in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        self.stats.avg_wait_time_ms()
    }
}

/// Idle channel being pinged before hand-out; closed if the acquire is dropped mid-ping
struct BorrowCheck<'a> {
    pool: &'a ChannelPool,
    channel: Option<BackendChannel>,
}

impl BorrowCheck<'_> {
    async fn ping(&mut self) -> Result<()> {
        match self.channel.as_mut() {
            Some(channel) => channel.ping().await,
            None => Ok(()),
        }
    }

    fn finish(mut self) -> Option<BackendChannel> {
        self.channel.take()
    }
}

impl Drop for BorrowCheck<'_> {
    fn drop(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.mark_broken();
            self.pool.discard(channel, "acquire dropped during health check");
        }
    }
}

/// A channel checked out of a [`ChannelPool`]
///
/// Dropping the guard releases the channel: healthy channels go back to the
/// idle set, anything else is closed. Either way the capacity slot is freed.
pub struct PooledChannel {
    channel: Option<BackendChannel>,
    pool: Arc<ChannelPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledChannel")
            .field("channel", &self.channel)
            .field("datasource", &self.pool.datasource.name)
            .finish()
    }
}

impl PooledChannel {
    /// Return the channel to its pool
    pub fn release(self) {
        drop(self);
    }

    /// Close the channel instead of pooling it
    pub fn discard(mut self, reason: &str) {
        if let Some(channel) = self.channel.take() {
            self.pool.checked_out.fetch_sub(1, Ordering::AcqRel);
            self.pool.discard(channel, reason);
            self.pool.returned.notify_waiters();
        }
    }

    /// Pool this channel belongs to
    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }
}

impl std::ops::Deref for PooledChannel {
    type Target = BackendChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref().expect("channel already released")
    }
}

impl std::ops::DerefMut for PooledChannel {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.channel.as_mut().expect("channel already released")
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.pool.checked_out.fetch_sub(1, Ordering::AcqRel);
            self.pool.release(channel);
            self.pool.returned.notify_waiters();
        }
        // the slot frees only after the channel is idle again
        self.permit.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_from_settings() {
        let settings = PoolSettings::default()
            .with_max_size(3)
            .with_acquire_timeout(Duration::from_millis(250))
            .with_test_on_borrow(true);
        let config = PoolConfig::from_settings(&settings, 16);
        assert_eq!(config.max_size, 3);
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
        assert!(config.test_on_borrow);
        assert_eq!(config.handshake_retries, 1);
        assert_eq!(config.statement_cache_size, 16);
        assert_eq!(config.max_lifetime, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_pool_config_caps_retries() {
        let settings = PoolSettings::default().with_handshake_retries(5);
        let config = PoolConfig::from_settings(&settings, 0);
        assert_eq!(config.handshake_retries, 1);
        assert_eq!(config.statement_cache_size, 1);
    }

    #[test]
    fn test_atomic_stats() {
        let stats = AtomicPoolStats::new();
        stats.record_created();
        stats.record_created();
        stats.record_closed();
        stats.record_acquisition(10);
        stats.record_acquisition(30);
        stats.record_release();
        stats.record_exhausted();
        stats.record_creation_failure();
        stats.record_health_check_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.channels_created, 2);
        assert_eq!(snapshot.channels_closed, 1);
        assert_eq!(snapshot.acquisitions, 2);
        assert_eq!(snapshot.releases, 1);
        assert_eq!(snapshot.exhausted_count, 1);
        assert_eq!(snapshot.total_wait_time_ms, 40);
        assert_eq!(snapshot.creation_failures, 1);
        assert_eq!(snapshot.health_check_failures, 1);
        assert!((stats.avg_wait_time_ms() - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_avg_wait_time_without_acquisitions() {
        assert_eq!(AtomicPoolStats::new().avg_wait_time_ms(), 0.0);
    }
}
