//! 日志与追踪系统
//! 初始化结构化日志和指标收集

use crate::config::AppConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 初始化日志与追踪系统
pub fn init_telemetry(config: &AppConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // 部署输出写到 stdout，日志统一走 stderr
    let log_layer = match config.logging.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
            .boxed(),
        "pretty" => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.logging.level,
        format = %config.logging.format,
        "Telemetry initialized"
    );
}

/// 初始化指标
///
/// 指标在首次使用时创建，这里只登记描述，未安装 recorder 时为空操作
pub fn init_metrics() {
    metrics::describe_gauge!("ssh_pool_sessions", "Sessions currently held by the pool");
    metrics::describe_counter!("ssh_pool_evictions_total", "Sessions evicted from the pool");
    metrics::describe_counter!(
        "ssh_pool_reconnect_attempts_total",
        "Background reconnection attempts"
    );
    metrics::describe_counter!("deploy_groups_executed_total", "Command groups completed");
    metrics::describe_counter!("deploy_runs_total", "Deployment runs by final status");
    tracing::debug!("Metrics initialized");
}
