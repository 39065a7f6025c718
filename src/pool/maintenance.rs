//! 连接池后台维护：定时健康检查与空闲清理

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ConnectionPool;

/// 启动维护任务，`shutdown` 取消后退出
pub fn spawn_maintenance(pool: ConnectionPool, shutdown: CancellationToken) -> JoinHandle<()> {
    let health_every = pool.config().health_check_interval;
    let cleanup_every = pool.config().cleanup_interval;

    tokio::spawn(async move {
        // 首次触发推迟一个周期，避免刚建立的会话立即被探测
        let mut health_tick = interval_at(Instant::now() + health_every, health_every);
        let mut cleanup_tick = interval_at(Instant::now() + cleanup_every, cleanup_every);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            health_check_secs = health_every.as_secs(),
            cleanup_secs = cleanup_every.as_secs(),
            "Pool maintenance started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Pool maintenance stopped");
                    break;
                }
                _ = health_tick.tick() => {
                    let unhealthy = pool.run_health_check().await;
                    if unhealthy > 0 {
                        debug!(unhealthy, "Health check flagged sessions");
                    }
                }
                _ = cleanup_tick.tick() => {
                    let removed = pool.cleanup_idle().await;
                    if removed > 0 {
                        debug!(removed, "Idle cleanup removed sessions");
                    }
                }
            }
        }
    })
}
