//! 连接池集成测试（模拟传输，暂停时钟）

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use vps_deploy::{error::AppError, pool::SessionHealth};

mod common;
use common::{pool, target, ConnectBehavior, MockHub};

#[tokio::test(start_paused = true)]
async fn test_reuses_session_for_same_target() {
    let hub = MockHub::new();
    let pool = pool(&hub, 4);
    let web = target("web-1");

    let first = pool.acquire(&web).await.unwrap();
    pool.release(&web.id).await;
    let second = pool.acquire(&web).await.unwrap();
    pool.release(&web.id).await;

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(hub.creations("web-1"), 1);

    let stats = pool.stats().await;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.avg_use_count, 2.0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_acquire_creates_single_session() {
    let hub = MockHub::new();
    hub.set_connect("web-1", ConnectBehavior::Delay(Duration::from_secs(1)));
    let pool = pool(&hub, 4);
    let web = target("web-1");

    let (a, b) = tokio::join!(pool.acquire(&web), pool.acquire(&web));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(hub.creations("web-1"), 1);
    assert_eq!(pool.stats().await.in_use, 1);
}

#[tokio::test(start_paused = true)]
async fn test_evicts_least_recently_used_idle_session() {
    let hub = MockHub::new();
    let pool = pool(&hub, 2);
    let (a, b, c) = (target("a"), target("b"), target("c"));

    pool.acquire(&a).await.unwrap();
    pool.release(&a.id).await;
    tokio::time::advance(Duration::from_secs(1)).await;

    pool.acquire(&b).await.unwrap();
    pool.release(&b.id).await;
    tokio::time::advance(Duration::from_secs(1)).await;

    // a 重新被使用，b 成为最久未使用
    pool.acquire(&a).await.unwrap();
    pool.release(&a.id).await;
    tokio::time::advance(Duration::from_secs(1)).await;

    pool.acquire(&c).await.unwrap();

    assert!(pool.contains("a").await);
    assert!(!pool.contains("b").await);
    assert!(pool.contains("c").await);
    assert_eq!(hub.disconnects("b"), 1);
    assert_eq!(pool.stats().await.total, 2);
}

#[tokio::test(start_paused = true)]
async fn test_pool_full_when_all_sessions_in_use() {
    let hub = MockHub::new();
    let pool = pool(&hub, 1);

    let _held = pool.acquire(&target("a")).await.unwrap();
    let result = pool.acquire(&target("b")).await;

    assert!(matches!(result, Err(AppError::PoolFull { capacity: 1 })));
    assert_eq!(hub.creations("b"), 0);
    assert!(pool.contains("a").await);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_connect_returns_capacity() {
    let hub = MockHub::new();
    hub.set_connect("slow", ConnectBehavior::Delay(Duration::from_secs(5)));
    let pool = pool(&hub, 1);

    let abandoned = tokio::time::timeout(Duration::from_secs(1), pool.acquire(&target("slow"))).await;
    assert!(abandoned.is_err());
    assert_eq!(pool.stats().await.total, 0);

    pool.acquire(&target("other")).await.unwrap();
    assert!(pool.contains("other").await);
    assert!(!pool.contains("slow").await);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_backs_off_then_gives_up() {
    let hub = MockHub::new();
    hub.set_connect("flaky", ConnectBehavior::Refuse);
    let pool = pool(&hub, 4);
    let start = Instant::now();

    let result = pool.acquire(&target("flaky")).await;
    assert!(matches!(result, Err(AppError::ConnectionRefused(_))));
    assert!(!pool.contains("flaky").await);
    assert!(pool.reconnection("flaky").await.is_some());

    tokio::time::sleep(Duration::from_secs(20)).await;

    let offsets: Vec<u64> = hub
        .open_attempts("flaky")
        .iter()
        .map(|at| at.duration_since(start).as_secs_f64().round() as u64)
        .collect();
    assert_eq!(offsets, vec![0, 2, 6, 14]);
    assert_eq!(
        pool.health("flaky").await,
        Some(SessionHealth::Unrecoverable)
    );
    assert!(pool.reconnection("flaky").await.is_none());

    // 耗尽后不再自动尝试
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(hub.open_attempts("flaky").len(), 4);

    // 调用方再次 acquire 会重新开始
    hub.set_connect("flaky", ConnectBehavior::Succeed);
    pool.acquire(&target("flaky")).await.unwrap();
    assert_eq!(pool.health("flaky").await, Some(SessionHealth::Healthy));
}

#[tokio::test(start_paused = true)]
async fn test_reconnection_registers_session_when_host_recovers() {
    let hub = MockHub::new();
    hub.set_connect("db", ConnectBehavior::Refuse);
    let pool = pool(&hub, 4);

    assert!(pool.acquire(&target("db")).await.is_err());
    hub.set_connect("db", ConnectBehavior::Succeed);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(pool.contains("db").await);
    assert_eq!(pool.health("db").await, Some(SessionHealth::Healthy));
    assert!(pool.reconnection("db").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_health_check_marks_broken_session_and_reconnects_in_place() {
    let hub = MockHub::new();
    let pool = pool(&hub, 4);
    let web = target("web-1");

    let handle = pool.acquire(&web).await.unwrap();
    pool.release(&web.id).await;

    hub.set_broken("web-1", true);
    assert_eq!(pool.run_health_check().await, 1);
    assert_eq!(pool.health("web-1").await, Some(SessionHealth::Unhealthy));
    assert_eq!(pool.stats().await.healthy, 0);

    hub.set_broken("web-1", false);
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(pool.health("web-1").await, Some(SessionHealth::Healthy));
    assert_eq!(hub.creations("web-1"), 2);

    // 已发出的句柄指向替换后的会话
    let again = pool.acquire(&web).await.unwrap();
    assert!(Arc::ptr_eq(&handle, &again));
    assert!(again.lock().await.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_health_check_skips_sessions_in_use() {
    let hub = MockHub::new();
    let pool = pool(&hub, 4);

    let _held = pool.acquire(&target("busy")).await.unwrap();
    hub.set_broken("busy", true);

    assert_eq!(pool.run_health_check().await, 0);
    assert!(!hub.executed("busy").iter().any(|c| c == "echo ping"));
}

#[tokio::test(start_paused = true)]
async fn test_acquire_replaces_unhealthy_idle_session() {
    let hub = MockHub::new();
    let pool = pool(&hub, 4);
    let web = target("web-1");

    pool.acquire(&web).await.unwrap();
    pool.release(&web.id).await;
    hub.set_broken("web-1", true);
    pool.run_health_check().await;
    hub.set_broken("web-1", false);

    pool.acquire(&web).await.unwrap();

    assert_eq!(pool.health("web-1").await, Some(SessionHealth::Healthy));
    assert!(pool.reconnection("web-1").await.is_none());
    assert_eq!(hub.creations("web-1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_removes_only_expired_idle_sessions() {
    let hub = MockHub::new();
    let pool = pool(&hub, 4);

    pool.acquire(&target("idle")).await.unwrap();
    pool.release("idle").await;
    let _held = pool.acquire(&target("busy")).await.unwrap();

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(pool.cleanup_idle().await, 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(pool.cleanup_idle().await, 1);

    assert!(!pool.contains("idle").await);
    assert!(pool.contains("busy").await);
    assert_eq!(hub.disconnects("idle"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stats_reflect_usage() {
    let hub = MockHub::new();
    let pool = pool(&hub, 4);

    let _held = pool.acquire(&target("a")).await.unwrap();
    pool.acquire(&target("b")).await.unwrap();
    pool.release("b").await;

    let stats = pool.stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.in_use, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.healthy, 2);
    assert_eq!(stats.avg_use_count, 1.0);
    assert_eq!(stats.utilization, 25.0);
    assert_eq!(stats.health_rate, 100.0);
}

#[tokio::test(start_paused = true)]
async fn test_evict_and_shutdown_disconnect_sessions() {
    let hub = MockHub::new();
    let pool = pool(&hub, 4);

    pool.acquire(&target("a")).await.unwrap();
    pool.release("a").await;
    pool.acquire(&target("b")).await.unwrap();
    pool.release("b").await;

    assert!(pool.evict("a").await);
    assert!(!pool.evict("a").await);
    assert_eq!(hub.disconnects("a"), 1);

    pool.shutdown().await;
    assert_eq!(pool.stats().await.total, 0);
    assert_eq!(hub.disconnects("b"), 1);
}
