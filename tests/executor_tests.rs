//! 部署执行器集成测试

use std::collections::HashMap;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use tokio_util::sync::CancellationToken;
use vps_deploy::{
    deploy::{parse, DeploymentExecutor, ExecutorOptions, TaskReporter},
    error::AppError,
    models::{DeploymentTask, LogLevel},
    pool::ConnectionPool,
};

mod common;
use common::{
    eventually, fail, ok, pool, pool_config, probe, target, ConnectBehavior, MockHub, Reply,
    PROBE_MARKER,
};

fn lines(input: &[&str]) -> Vec<String> {
    input.iter().map(|s| s.to_string()).collect()
}

fn reporter() -> TaskReporter {
    TaskReporter::new(DeploymentTask::new("web-1", Vec::new(), HashMap::new()))
}

fn executor(pool: ConnectionPool) -> DeploymentExecutor {
    DeploymentExecutor::new(pool, ExecutorOptions::default())
}

#[tokio::test]
async fn test_variables_flow_between_groups() {
    let hub = MockHub::new();
    hub.respond("web-1", "echo VERSION", ok("VERSION=1.2\n"));
    let executor = executor(pool(&hub, 4));
    let groups = parse(&lines(&[
        "echo VERSION=1.2",
        "deploy-app --version $VERSION",
        "echo ${APP}",
    ]));
    let variables = HashMap::from([("APP".to_string(), "demo".to_string())]);
    let mut reporter = reporter();

    let outputs = executor
        .run(&target("web-1"), &groups, variables, &mut reporter, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outputs.len(), 3);
    let executed = hub.executed("web-1");
    assert!(executed.contains(&"deploy-app --version 1.2".to_string()));
    assert!(executed.contains(&"echo demo".to_string()));

    let task = reporter.task();
    assert_eq!(task.count_logs(LogLevel::Success), 3);
    let first = task
        .logs
        .iter()
        .find(|entry| entry.level == LogLevel::Success)
        .unwrap();
    assert_eq!(first.command.as_deref(), Some("echo VERSION=1.2"));
    assert_eq!(first.output.as_deref(), Some("VERSION=1.2"));
    assert!(task.progress >= 0.95 - f64::EPSILON);

    assert_eq!(executor.pool().stats().await.in_use, 0);
}

#[tokio::test]
async fn test_script_block_uploaded_and_executed() {
    let hub = MockHub::new();
    let mut config = pool_config(4);
    config.session.upload_chunk_size = 16;
    let executor = executor(ConnectionPool::new(config, hub.factory()));
    let groups = parse(&lines(&[
        "#!/bin/bash",
        "set -e",
        "echo from-script",
        "EOF",
    ]));
    let mut reporter = reporter();

    executor
        .run(&target("web-1"), &groups, HashMap::new(), &mut reporter, &CancellationToken::new())
        .await
        .unwrap();

    let executed = hub.executed("web-1");

    let encoded: String = executed
        .iter()
        .filter_map(|cmd| cmd.strip_prefix("printf '%s' "))
        .filter_map(|rest| rest.split(" >> ").next())
        .map(|chunk| chunk.trim_matches('\''))
        .collect();
    let uploaded = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
    assert_eq!(uploaded, "#!/bin/bash\nset -e\necho from-script");

    let script_path = executed
        .iter()
        .find(|cmd| cmd.starts_with("base64 -d"))
        .and_then(|cmd| cmd.split(" > ").nth(1))
        .unwrap()
        .trim_matches('\'')
        .to_string();
    assert!(script_path.starts_with("/tmp/deploy_script_"));

    assert!(executed
        .iter()
        .any(|cmd| cmd.starts_with("chmod +x") && cmd.contains(&script_path)));
    assert!(executed
        .iter()
        .any(|cmd| cmd.starts_with("rm -f") && cmd.contains(&script_path)));
    assert!(executed
        .iter()
        .any(|cmd| cmd.starts_with("rm -f") && cmd.contains(".upload-")));

    let task = reporter.task();
    let entry = task
        .logs
        .iter()
        .find(|entry| entry.level == LogLevel::Success)
        .unwrap();
    assert!(entry.command.as_deref().unwrap().starts_with("script (4 lines)"));
}

#[tokio::test]
async fn test_root_host_drops_sudo_prefix() {
    let hub = MockHub::new();
    hub.set_probe("web-1", probe("root", 0, true, true, "debian", "apt-get"));
    let executor = executor(pool(&hub, 4));
    let groups = parse(&lines(&["sudo apt-get update"]));
    let mut reporter = reporter();

    executor
        .run(&target("web-1"), &groups, HashMap::new(), &mut reporter, &CancellationToken::new())
        .await
        .unwrap();

    let executed = hub.executed("web-1");
    assert!(executed.contains(&"apt-get update".to_string()));
    assert!(!executed.iter().any(|cmd| cmd.starts_with("sudo ")));
}

#[tokio::test]
async fn test_sudo_failure_repaired_and_retried_once() {
    let hub = MockHub::new();
    // 首次探测：有 sudo 但无权限；修复后的探测使用默认输出（有权限）
    hub.respond_once(
        "web-1",
        PROBE_MARKER,
        ok(&probe("deploy", 1000, true, false, "ubuntu", "apt-get")),
    );
    hub.respond_once(
        "web-1",
        "systemctl restart nginx",
        fail(1, "su: Authentication failure"),
    );
    let executor = executor(pool(&hub, 4));
    let groups = parse(&lines(&["sudo systemctl restart nginx"]));
    let mut reporter = reporter();

    executor
        .run(&target("web-1"), &groups, HashMap::new(), &mut reporter, &CancellationToken::new())
        .await
        .unwrap();

    let executed = hub.executed("web-1");
    assert!(executed
        .iter()
        .any(|cmd| cmd.contains("usermod -aG sudo deploy")));
    assert!(executed
        .iter()
        .any(|cmd| cmd.contains("/etc/sudoers.d/90-deploy")));
    assert_eq!(
        executed.last().map(String::as_str),
        Some("sudo systemctl restart nginx")
    );

    let task = reporter.task();
    assert!(task
        .logs
        .iter()
        .any(|entry| entry.level == LogLevel::Warning
            && entry.message.contains("no sudo privileges")));
    assert!(task
        .logs
        .iter()
        .any(|entry| entry.message.contains("Privileges repaired")));
    assert_eq!(task.count_logs(LogLevel::Success), 1);
    assert_eq!(task.count_logs(LogLevel::Error), 0);
}

#[tokio::test]
async fn test_manual_sudo_problem_fails_with_instructions() {
    let hub = MockHub::new();
    hub.set_probe("web-1", probe("deploy", 1000, false, false, "", ""));
    hub.respond("web-1", "make install", fail(1, "Permission denied"));
    let executor = executor(pool(&hub, 4));
    let groups = parse(&lines(&["sudo make install", "echo after"]));
    let mut reporter = reporter();

    let result = executor
        .run(&target("web-1"), &groups, HashMap::new(), &mut reporter, &CancellationToken::new())
        .await;

    match result {
        Err(AppError::CommandFailed { exit_code, stderr, .. }) => {
            assert_eq!(exit_code, 1);
            assert_eq!(stderr, "Permission denied");
        }
        other => panic!("expected command failure, got {:?}", other.map(|o| o.len())),
    }

    let executed = hub.executed("web-1");
    assert!(executed.contains(&"make install".to_string()));
    assert!(!executed.contains(&"echo after".to_string()));

    let task = reporter.task();
    assert!(task
        .logs
        .iter()
        .any(|entry| entry.message.starts_with("Manual step required")));
    assert_eq!(task.count_logs(LogLevel::Error), 1);
    assert_eq!(executor.pool().stats().await.in_use, 0);
}

#[tokio::test]
async fn test_cancelled_before_start_acquires_nothing() {
    let hub = MockHub::new();
    let executor = executor(pool(&hub, 4));
    let groups = parse(&lines(&["echo hi"]));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut reporter = reporter();

    let result = executor
        .run(&target("web-1"), &groups, HashMap::new(), &mut reporter, &cancel)
        .await;

    assert!(matches!(result, Err(AppError::Cancelled)));
    assert_eq!(hub.creations("web-1"), 0);
}

#[tokio::test]
async fn test_cancelled_upload_removes_remote_files() {
    let hub = MockHub::new();
    hub.respond("web-1", "printf '%s'", Reply::Hang);
    let executor = executor(pool(&hub, 4));
    let groups = parse(&lines(&["#!/bin/bash", "echo from-script", "EOF"]));
    let cancel = CancellationToken::new();
    let mut reporter = reporter();

    let tgt = target("web-1");
    let (result, _) = tokio::join!(
        executor.run(&tgt, &groups, HashMap::new(), &mut reporter, &cancel),
        async {
            assert!(
                eventually(|| hub
                    .executed("web-1")
                    .iter()
                    .any(|cmd| cmd.starts_with("printf '%s'")))
                .await
            );
            cancel.cancel();
        }
    );

    assert!(matches!(result, Err(AppError::Cancelled)));
    let executed = hub.executed("web-1");
    assert!(executed
        .iter()
        .any(|cmd| cmd.starts_with("rm -f") && cmd.contains(".upload-")));
    assert!(executed
        .iter()
        .any(|cmd| cmd.starts_with("rm -f") && cmd.contains("deploy_script_")));
    assert!(!executed.iter().any(|cmd| cmd.starts_with("chmod +x")));
    assert_eq!(executor.pool().stats().await.in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_slow_connect_frees_pool_slot() {
    let hub = MockHub::new();
    hub.set_connect("slow", ConnectBehavior::Delay(Duration::from_secs(5)));
    let executor = executor(pool(&hub, 1));
    let groups = parse(&lines(&["uptime"]));
    let cancel = CancellationToken::new();
    let mut reporter = reporter();

    let tgt = target("slow");
    let (result, _) = tokio::join!(
        executor.run(&tgt, &groups, HashMap::new(), &mut reporter, &cancel),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    );

    assert!(matches!(result, Err(AppError::Cancelled)));
    assert_eq!(executor.pool().stats().await.total, 0);

    let other = executor.pool().acquire(&target("other")).await;
    assert!(other.is_ok());
}
