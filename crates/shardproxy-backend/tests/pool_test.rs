//! Tests for channel pools against an in-process MySQL backend
//!
//! Covers handshake-once semantics, bounded capacity, failure handling and
//! shutdown draining.

mod common;

use common::{init_tracing, manager, unreachable_settings, wait_for, MockBackend, MockResponse};
use shardproxy_backend::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn pool_settings() -> PoolSettings {
    PoolSettings::default()
        .with_max_size(2)
        .with_acquire_timeout(Duration::from_millis(200))
}

// ==================== Handshake Tests ====================

#[tokio::test]
async fn test_handshake_runs_once_per_channel() {
    init_tracing();
    let mock = MockBackend::start().await;
    let manager = manager(vec![("ds_0", mock.settings())], pool_settings());

    for _ in 0..5 {
        let mut channel = manager.acquire("ds_0").await.unwrap();
        assert_eq!(channel.handshake_count(), 1);
        assert_eq!(channel.server_version(), Some("8.0.36-mock"));
        channel.ping().await.unwrap();
        channel.release();
    }

    assert_eq!(mock.connections(), 1);
    assert_eq!(mock.logins(), 1);
    assert_eq!(mock.state().pings.load(Ordering::SeqCst), 5);
    assert_eq!(mock.databases(), vec![Some(common::DATABASE.to_string())]);

    let stats = manager.stats();
    assert_eq!(stats["ds_0"].channels_created, 1);
    assert_eq!(stats["ds_0"].acquisitions, 5);
    assert_eq!(stats["ds_0"].releases, 5);
}

#[tokio::test]
async fn test_rejected_login_is_unreachable_after_retry() {
    init_tracing();
    let mock = MockBackend::start().await;
    mock.reject_auth(true);
    let manager = manager(vec![("ds_0", mock.settings())], pool_settings());

    let err = manager.acquire("ds_0").await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::BackendUnreachable);
    assert_eq!(mock.state().failed_logins.load(Ordering::SeqCst), 2);

    let pool = manager.pool("ds_0").unwrap();
    assert_eq!(pool.size(), 0);
    assert_eq!(pool.stats().creation_failures, 2);
}

#[tokio::test]
async fn test_failed_handshake_retries_on_fresh_channel() {
    init_tracing();
    let mock = MockBackend::start().await;
    mock.reject_next_logins(1);
    let manager = manager(vec![("ds_0", mock.settings())], pool_settings());

    let channel = manager.acquire("ds_0").await.unwrap();
    assert_eq!(channel.handshake_count(), 1);
    assert_eq!(mock.connections(), 2);
    assert_eq!(mock.failed_logins(), 1);
    assert_eq!(mock.logins(), 1);

    let pool = Arc::clone(channel.pool());
    let stats = pool.stats();
    assert_eq!(stats.creation_failures, 1);
    assert_eq!(stats.channels_created, 1);
    assert_eq!(pool.size(), 1);
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let mock = MockBackend::start().await;
    let settings = DataSourceSettings::new(mock.url()).with_credentials(common::USER, "wrong");
    let manager = manager(
        vec![("ds_0", settings)],
        pool_settings().with_handshake_retries(0),
    );

    let err = manager.acquire("ds_0").await.unwrap_err();
    assert!(matches!(err, Error::BackendUnreachable { .. }));
    assert_eq!(mock.state().failed_logins.load(Ordering::SeqCst), 1);
    assert_eq!(mock.logins(), 0);
}

#[tokio::test]
async fn test_closed_port_is_unreachable() {
    let manager = manager(vec![("ds_0", unreachable_settings().await)], pool_settings());

    let err = manager.acquire("ds_0").await.unwrap_err();
    match err {
        Error::BackendUnreachable { datasource, .. } => assert_eq!(datasource, "ds_0"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(manager.pool("ds_0").unwrap().in_use(), 0);
}

/// Handler that counts transitions around the standard login
#[derive(Debug)]
struct CountingHandler {
    inner: BackendChannelHandler,
    created: Arc<AtomicUsize>,
    acquired: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl ChannelPoolHandler for CountingHandler {
    async fn channel_created(&self, channel: &mut BackendChannel) -> Result<()> {
        self.inner.channel_created(channel).await?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn channel_acquired(&self, _channel: &BackendChannel) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn channel_released(&self, _channel: &BackendChannel) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_lifecycle_hooks_observe_transitions() {
    let mock = MockBackend::start().await;
    let created = Arc::new(AtomicUsize::new(0));
    let acquired = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));

    let factory: HandlerFactory = {
        let (created, acquired, released) =
            (Arc::clone(&created), Arc::clone(&acquired), Arc::clone(&released));
        Arc::new(move |datasource| {
            Arc::new(CountingHandler {
                inner: BackendChannelHandler::new(datasource),
                created: Arc::clone(&created),
                acquired: Arc::clone(&acquired),
                released: Arc::clone(&released),
            }) as Arc<dyn ChannelPoolHandler>
        })
    };

    let config = DataSourceConfig::from_settings("ds_0", &mock.settings()).unwrap();
    let registry = DataSourceRegistry::new([config]).unwrap();
    let runtime =
        BackendRuntime::attach(tokio::runtime::Handle::current(), &RuntimeSettings::default());
    let manager = ChannelPoolManager::with_handler_factory(
        Arc::new(registry),
        runtime,
        &pool_settings(),
        &EngineSettings::default(),
        factory,
    );

    for _ in 0..3 {
        manager.acquire("ds_0").await.unwrap().release();
    }

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(acquired.load(Ordering::SeqCst), 3);
    assert_eq!(released.load(Ordering::SeqCst), 3);
    assert_eq!(mock.logins(), 1);
}

// ==================== Capacity Tests ====================

#[tokio::test]
async fn test_capacity_is_bounded() {
    init_tracing();
    let mock = MockBackend::start().await;
    let manager = manager(vec![("ds_0", mock.settings())], pool_settings());

    let first = manager.acquire("ds_0").await.unwrap();
    let _second = manager.acquire("ds_0").await.unwrap();

    let err = manager.acquire("ds_0").await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));
    assert!(err.is_retriable());

    first.release();
    let third = manager.acquire("ds_0").await.unwrap();
    assert_eq!(third.handshake_count(), 1);

    let pool = manager.pool("ds_0").unwrap();
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.in_use(), 2);
    assert_eq!(pool.stats().exhausted_count, 1);
    assert_eq!(mock.logins(), 2);
}

#[tokio::test]
async fn test_eleventh_acquire_waits_for_release() {
    let mock = MockBackend::start().await;
    let manager = manager(
        vec![("ds_0", mock.settings())],
        PoolSettings::default().with_acquire_timeout(Duration::from_secs(2)),
    );

    let mut held = Vec::new();
    for _ in 0..10 {
        held.push(manager.acquire("ds_0").await.unwrap());
    }
    let released_id = held[3].id();

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire("ds_0").await.map(|c| c.id()) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    drop(held.remove(3));
    let reused = waiter.await.unwrap().unwrap();
    assert_eq!(reused, released_id);
    assert_eq!(mock.logins(), 10);
    assert_eq!(manager.pool("ds_0").unwrap().size(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_acquire_creates_one_pool() {
    let mock = MockBackend::start().await;
    let manager = manager(
        vec![("ds_0", mock.settings())],
        PoolSettings::default().with_max_size(8),
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let channel = manager.acquire("ds_0").await.unwrap();
                let pool = Arc::clone(channel.pool());
                tokio::time::sleep(Duration::from_millis(20)).await;
                pool
            })
        })
        .collect();

    let pools: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(pools.iter().all(|p| Arc::ptr_eq(p, &pools[0])));
    assert_eq!(manager.pool_count(), 1);
    assert_eq!(manager.pools_created(), 1);
    assert_eq!(mock.logins(), pools[0].size());
}

// ==================== Reuse Tests ====================

#[tokio::test]
async fn test_server_error_keeps_channel() {
    let mock = MockBackend::start().await;
    let manager = manager(vec![("ds_0", mock.settings())], pool_settings());

    let mut channel = manager.acquire("ds_0").await.unwrap();
    let err = channel.query("SELECT * FROM missing").await.unwrap_err();
    assert!(matches!(err, Error::Server { code: 1064, .. }));
    assert!(channel.is_reusable());
    channel.release();

    let pool = manager.pool("ds_0").unwrap();
    assert_eq!(pool.idle_count(), 1);

    let _again = manager.acquire("ds_0").await.unwrap();
    assert_eq!(mock.logins(), 1);
}

#[tokio::test]
async fn test_broken_channel_is_not_reused() {
    init_tracing();
    let mock = MockBackend::start().await;
    mock.respond("SELECT crash()", MockResponse::Disconnect);
    let manager = manager(vec![("ds_0", mock.settings())], pool_settings());

    let mut channel = manager.acquire("ds_0").await.unwrap();
    assert!(channel.query("SELECT crash()").await.is_err());
    assert!(!channel.is_reusable());
    channel.release();

    let pool = manager.pool("ds_0").unwrap();
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.size(), 0);

    let channel = manager.acquire("ds_0").await.unwrap();
    assert_eq!(channel.handshake_count(), 1);
    assert_eq!(mock.logins(), 2);
}

#[tokio::test]
async fn test_pending_rows_prevent_reuse() {
    let mock = MockBackend::start().await;
    mock.respond("SELECT id FROM t", MockResponse::ids(&[1, 2, 3]));
    let manager = manager(vec![("ds_0", mock.settings())], pool_settings());

    let mut channel = manager.acquire("ds_0").await.unwrap();
    channel.query("SELECT id FROM t").await.unwrap();
    assert!(channel.next_row().await.unwrap().is_some());
    assert!(channel.has_pending_rows());
    channel.release();

    assert_eq!(manager.pool("ds_0").unwrap().idle_count(), 0);
}

#[tokio::test]
async fn test_on_borrow_pings_idle_channels() {
    let mock = MockBackend::start().await;
    let manager = manager(
        vec![("ds_0", mock.settings())],
        pool_settings().with_test_on_borrow(true),
    );

    manager.acquire("ds_0").await.unwrap().release();
    manager.acquire("ds_0").await.unwrap().release();

    // only the reused channel is checked
    assert_eq!(mock.state().pings.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats()["ds_0"].health_check_failures, 0);
}

#[tokio::test]
async fn test_dropped_acquire_during_borrow_check_closes_channel() {
    let mock = MockBackend::start().await;
    let manager = manager(
        vec![("ds_0", mock.settings())],
        pool_settings().with_test_on_borrow(true),
    );

    manager.acquire("ds_0").await.unwrap().release();
    let pool = manager.pool("ds_0").unwrap();
    assert_eq!(pool.size(), 1);

    mock.set_delay(Duration::from_millis(500));
    let attempt = tokio::time::timeout(Duration::from_millis(50), manager.acquire("ds_0")).await;
    assert!(attempt.is_err());

    assert_eq!(pool.size(), 0);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.stats().channels_closed, 1);

    mock.set_delay(Duration::ZERO);
    let channel = manager.acquire("ds_0").await.unwrap();
    assert_eq!(channel.handshake_count(), 1);
    assert_eq!(pool.size(), 1);
    assert_eq!(mock.logins(), 2);
}

// ==================== Shutdown Tests ====================

#[tokio::test]
async fn test_shutdown_closes_idle_channels() {
    let mock = MockBackend::start().await;
    let manager = manager(vec![("ds_0", mock.settings())], pool_settings());

    manager.acquire("ds_0").await.unwrap().release();
    assert!(manager.shutdown(Duration::from_secs(1)).await);

    let state = Arc::clone(mock.state());
    assert!(wait_for(|| state.quits.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);

    assert!(matches!(manager.acquire("ds_0").await, Err(Error::Shutdown)));
    assert!(matches!(manager.pool("ds_1"), Err(Error::Shutdown)));
}

#[tokio::test]
async fn test_shutdown_reports_undrained_channels() {
    let mock = MockBackend::start().await;
    let manager = manager(vec![("ds_0", mock.settings())], pool_settings());

    let held = manager.acquire("ds_0").await.unwrap();
    let pool = Arc::clone(held.pool());
    assert!(!manager.shutdown(Duration::from_millis(50)).await);
    // a second call reports the failed drain instead of succeeding
    assert!(!manager.shutdown(Duration::from_secs(5)).await);
    assert!(pool.is_closed());
    assert_eq!(pool.in_use(), 1);

    // late release after close discards instead of pooling
    drop(held);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.size(), 0);

    let state = Arc::clone(mock.state());
    assert!(wait_for(|| state.quits.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);
}
