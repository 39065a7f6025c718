use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use vps_deploy::{
    config::AppConfig,
    deploy::DeploymentExecutor,
    models::{DeploymentRequest, LogLevel, TaskStatus},
    pool::{spawn_maintenance, ConnectionPool},
    repository::InMemoryTaskStore,
    services::{DeploymentService, StaticTemplateCatalog},
    ssh::RusshTransportFactory,
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let plan_path = match args.get(1).map(String::as_str) {
        Some("--version") => {
            println!("vps-deploy {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") | None => {
            print_help();
            return Ok(());
        }
        Some("run") => match args.get(2) {
            Some(path) => path.clone(),
            None => {
                eprintln!("缺少部署计划文件");
                print_help();
                std::process::exit(1);
            }
        },
        Some(other) => {
            eprintln!("未知参数: {}", other);
            print_help();
            std::process::exit(1);
        }
    };

    if let Ok(env) = std::env::var("VPS_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::dotenv().ok();
    }

    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    telemetry::init_telemetry(&config);
    telemetry::init_metrics();

    let request = load_plan(&plan_path, &config).await?;

    let mut factory = RusshTransportFactory::new();
    if let Some(path) = &config.ssh.known_hosts_file {
        let known_hosts = RusshTransportFactory::load_known_hosts_file(path).await?;
        tracing::info!(path = %path, entries = known_hosts.len(), "Loaded known_hosts");
        factory = factory.with_known_hosts(known_hosts);
    }

    let pool = ConnectionPool::new(config.pool_config(), Arc::new(factory));
    let maintenance_token = CancellationToken::new();
    let maintenance = spawn_maintenance(pool.clone(), maintenance_token.clone());

    let templates = match std::env::var("VPS_TEMPLATES_FILE") {
        Ok(path) => {
            let json = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read template catalog {}", path))?;
            StaticTemplateCatalog::from_json(&json)?
        }
        Err(_) => StaticTemplateCatalog::new(),
    };

    let service = DeploymentService::new(
        DeploymentExecutor::new(pool.clone(), config.executor_options()),
        Arc::new(InMemoryTaskStore::new()),
        Arc::new(templates),
    );

    let task_id = service.submit(request).await?;
    tracing::info!(task_id = %task_id, "Deployment started");

    let finished = service.wait(task_id);
    tokio::pin!(finished);
    let task = tokio::select! {
        task = &mut finished => task?,
        _ = signal::ctrl_c() => {
            tracing::warn!(task_id = %task_id, "Received Ctrl+C, cancelling deployment");
            service.cancel(task_id).await?;
            finished.await?
        }
    };

    for entry in &task.logs {
        let marker = match entry.level {
            LogLevel::Info => "INFO",
            LogLevel::Success => " OK ",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "FAIL",
        };
        println!("[{}] {}", marker, entry.message);
        if let Some(command) = &entry.command {
            println!("       $ {}", command);
        }
        if let Some(output) = &entry.output {
            for line in output.lines() {
                println!("       {}", line);
            }
        }
    }

    let stats = service.pool_stats().await;
    tracing::info!(
        total = stats.total,
        healthy = stats.healthy,
        avg_use_count = stats.avg_use_count,
        "Pool stats at exit"
    );

    maintenance_token.cancel();
    service.shutdown().await;
    maintenance.await.ok();

    match task.status {
        TaskStatus::Completed => {
            println!("Deployment {} completed", task.id);
            Ok(())
        }
        status => {
            eprintln!(
                "Deployment {} finished with status {:?}: {}",
                task.id,
                status,
                task.error.as_deref().unwrap_or("no error recorded")
            );
            std::process::exit(1);
        }
    }
}

/// 读取部署计划；目标未声明主机密钥策略时使用配置中的策略
async fn load_plan(path: &str, config: &AppConfig) -> anyhow::Result<DeploymentRequest> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read plan file {}", path))?;
    let raw: serde_json::Value =
        serde_json::from_str(&content).with_context(|| format!("Invalid plan file {}", path))?;
    let explicit_policy = raw
        .get("target")
        .and_then(|target| target.get("host_key_verification"))
        .is_some();

    let mut request: DeploymentRequest = serde_json::from_value(raw)?;
    if !explicit_policy {
        request.target.host_key_verification = config.host_key_verification();
    }
    Ok(request)
}

fn print_help() {
    println!(
        r#"VPS 部署工具 {}

用法:
  vps-deploy run <plan.json>   执行部署计划
  vps-deploy --version         显示版本信息
  vps-deploy --help            显示帮助信息

部署计划格式:
  {{
    "target": {{"id": "web-1", "address": "10.0.0.5", "username": "deploy",
               "credential": {{"password": {{"password": "..."}}}}}},
    "commands": ["sudo apt-get update", "echo VERSION=1.2"],
    "variables": {{"APP": "demo"}}
  }}

环境变量:
  VPS_LOGGING__LEVEL             日志级别 (默认: info)
  VPS_LOGGING__FORMAT            日志格式 json/pretty/compact (默认: pretty)
  VPS_SSH__CONNECT_TIMEOUT_SECS  连接超时 (默认: 10)
  VPS_SSH__HOST_KEY_VERIFICATION 主机密钥策略 strict/accept/disabled
  VPS_SSH__KNOWN_HOSTS_FILE      known_hosts 文件 (每行: host:port fingerprint)
  VPS_POOL__MAX_SIZE             连接池容量 (默认: 8)
  VPS_TEMPLATES_FILE             部署模板 JSON 文件
"#,
        env!("CARGO_PKG_VERSION")
    );
}
