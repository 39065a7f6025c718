//! 部署执行器
//!
//! 在单台主机上按顺序执行命令组：变量替换、脚本上传执行、
//! 输出变量回收、sudo 失败自动修复（仅一次），首个未恢复的失败即终止。

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{ExecutionResult, LogEntry, SystemEnvironmentInfo, Target};
use crate::output::{is_meaningless_output, summarize, DEFAULT_SUMMARY_LENGTH};
use crate::pool::ConnectionPool;
use crate::ssh::{quote, SessionClient};

use super::environment::{detect_environment, EnvironmentMap};
use super::parser::CommandGroup;
use super::reporter::TaskReporter;
use super::sudo::{self, SudoProblem};

/// 执行器配置
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// 单个命令组的超时
    pub command_timeout: Duration,
    /// 脚本上传目录
    pub temp_dir: String,
    /// 命令组执行阶段占用的进度区间
    pub progress_window: (f64, f64),
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(300),
            temp_dir: "/tmp".to_string(),
            progress_window: (0.1, 0.95),
        }
    }
}

/// 单个命令组的执行结果
#[derive(Debug, Clone, Serialize)]
pub struct GroupOutput {
    pub index: usize,
    /// 实际执行的命令（脚本为描述）
    pub command: String,
    pub result: ExecutionResult,
}

/// 部署执行器
#[derive(Clone)]
pub struct DeploymentExecutor {
    pool: ConnectionPool,
    options: ExecutorOptions,
}

impl DeploymentExecutor {
    pub fn new(pool: ConnectionPool, options: ExecutorOptions) -> Self {
        Self { pool, options }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// 获取会话、探测环境并执行全部命令组，结束后归还会话（取消时同样归还）
    pub async fn run(
        &self,
        target: &Target,
        groups: &[CommandGroup],
        variables: HashMap<String, String>,
        reporter: &mut TaskReporter,
        cancel: &CancellationToken,
    ) -> Result<Vec<GroupOutput>> {
        let shared = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            acquired = self.pool.acquire(target) => acquired?,
        };

        reporter
            .log(LogEntry::info(format!("Connected to {}", target.endpoint())))
            .await;

        let outcome = async {
            let mut session = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                guard = shared.lock() => guard,
            };
            // 共享会话可能在等待期间失效
            if !session.is_connected() {
                session.establish().await?;
            }
            self.run_on_session(&mut session, groups, variables, reporter, cancel)
                .await
        }
        .await;

        self.pool.release(&target.id).await;
        outcome
    }

    /// 在已建立的会话上执行命令组
    pub async fn run_on_session(
        &self,
        session: &mut SessionClient,
        groups: &[CommandGroup],
        variables: HashMap<String, String>,
        reporter: &mut TaskReporter,
        cancel: &CancellationToken,
    ) -> Result<Vec<GroupOutput>> {
        let mut host = detect_environment(session).await?;
        let mut env = EnvironmentMap::from(variables);

        let (window_start, window_end) = self.options.progress_window;
        reporter.progress(window_start, None).await;

        let total = groups.len();
        let mut outputs = Vec::with_capacity(total);

        for (index, group) in groups.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let step = format!("Step {}/{}", index + 1, total);
            let text = env.substitute(group.text());
            let label = match group {
                CommandGroup::Single { .. } => text.clone(),
                CommandGroup::Script { .. } => group.label(),
            };
            debug!(step = %step, command = %label, "Executing command group");

            let executed = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AppError::Cancelled),
                executed = self.execute_with_repair(session, group, &text, &mut host, reporter) => executed,
            };
            if matches!(executed, Err(AppError::Cancelled)) {
                // 被中途放弃的上传或脚本执行不会走到自己的清理步骤
                session.remove_scratch_files().await;
            }

            match executed {
                Ok(result) => {
                    env.absorb_output(&result.stdout);

                    let mut entry = LogEntry::success(format!("{} completed", step))
                        .with_command(label.clone());
                    if !is_meaningless_output(&result.stdout) {
                        entry = entry.with_output(summarize(&result.stdout, DEFAULT_SUMMARY_LENGTH));
                    }
                    reporter.log(entry).await;
                    metrics::counter!("deploy_groups_executed_total").increment(1);

                    let fraction = window_start
                        + (window_end - window_start) * (index + 1) as f64 / total as f64;
                    reporter.progress(fraction, Some(result.clone())).await;

                    outputs.push(GroupOutput {
                        index,
                        command: label,
                        result,
                    });
                }
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    let mut entry = LogEntry::error(format!("{} failed: {}", step, e))
                        .with_command(label);
                    if let AppError::CommandFailed { stderr, .. } = &e {
                        if !stderr.trim().is_empty() {
                            entry = entry.with_output(summarize(stderr, DEFAULT_SUMMARY_LENGTH));
                        }
                    }
                    reporter.log(entry).await;
                    warn!(step = %step, error = %e, "Command group failed, aborting plan");
                    return Err(e);
                }
            }
        }

        info!(
            target_id = %session.target().id,
            groups = total,
            variables = env.len(),
            "All command groups completed"
        );
        Ok(outputs)
    }

    /// 执行命令组；sudo 相关失败且主机无特权时尝试修复一次并重试
    async fn execute_with_repair(
        &self,
        session: &mut SessionClient,
        group: &CommandGroup,
        text: &str,
        host: &mut SystemEnvironmentInfo,
        reporter: &mut TaskReporter,
    ) -> Result<ExecutionResult> {
        let error = match self.execute_group(session, group, text, host).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        let sudo_related = group.text().lines().any(sudo::is_sudo_command);
        let stderr = match &error {
            AppError::CommandFailed { stderr, .. } => Some(stderr.clone()),
            _ => None,
        };
        let Some(stderr) = stderr else {
            return Err(error);
        };
        if !sudo_related || host.is_root || host.has_sudo_privilege {
            return Err(error);
        }

        let problem = sudo::diagnose_failure(host, &stderr);
        let solution = sudo::solve(problem, host);
        warn!(
            target_id = %session.target().id,
            problem = ?problem,
            automatic = solution.is_automatic,
            "Privilege failure detected"
        );
        reporter
            .log(LogEntry::warning(format!(
                "Privilege problem detected ({}): {}",
                problem_name(problem),
                solution.description
            )))
            .await;

        if !solution.is_automatic {
            for step in &solution.manual_steps {
                reporter
                    .log(LogEntry::warning(format!("Manual step required: {}", step)))
                    .await;
            }
            return Err(error);
        }

        for command in &solution.commands {
            let privileged = sudo::privileged(command, host);
            let repaired = session
                .execute_with_timeout(&privileged, self.options.command_timeout)
                .await?;
            if !repaired.is_success() {
                reporter
                    .log(
                        LogEntry::warning("Automatic privilege repair failed")
                            .with_command(privileged)
                            .with_output(summarize(&repaired.stderr, DEFAULT_SUMMARY_LENGTH)),
                    )
                    .await;
                return Err(error);
            }
        }

        *host = detect_environment(session).await?;
        reporter
            .log(LogEntry::info("Privileges repaired, retrying step"))
            .await;

        self.execute_group(session, group, text, host).await
    }

    async fn execute_group(
        &self,
        session: &mut SessionClient,
        group: &CommandGroup,
        text: &str,
        host: &SystemEnvironmentInfo,
    ) -> Result<ExecutionResult> {
        match group {
            CommandGroup::Single { .. } => {
                let command = sudo::adapt_command(text, host);
                let result = session
                    .execute_with_timeout(&command, self.options.command_timeout)
                    .await?;
                check_exit(command, result)
            }
            CommandGroup::Script { .. } => {
                let script = if host.is_root {
                    sudo::strip_sudo_lines(text)
                } else {
                    text.to_string()
                };
                let path = format!(
                    "{}/deploy_script_{}.sh",
                    self.options.temp_dir.trim_end_matches('/'),
                    Uuid::new_v4().simple()
                );

                session.track_scratch_file(&path);
                let result = match session.write_file(script.as_bytes(), &path).await {
                    Ok(()) => self.run_script(session, &path, &script).await,
                    Err(e) => Err(e),
                };
                session.remove_scratch_file(&path).await;

                check_exit(group.label(), result?)
            }
        }
    }

    async fn run_script(
        &self,
        session: &mut SessionClient,
        path: &str,
        script: &str,
    ) -> Result<ExecutionResult> {
        let quoted = quote(path);
        session.run_checked(&format!("chmod +x {}", quoted)).await?;

        let command = if script.starts_with("#!") {
            quoted
        } else {
            format!("bash {}", quoted)
        };
        session
            .execute_with_timeout(&command, self.options.command_timeout)
            .await
    }
}

fn check_exit(command: String, result: ExecutionResult) -> Result<ExecutionResult> {
    if result.is_success() {
        Ok(result)
    } else {
        Err(AppError::CommandFailed {
            command,
            exit_code: result.exit_code,
            stderr: result.stderr,
        })
    }
}

fn problem_name(problem: SudoProblem) -> &'static str {
    match problem {
        SudoProblem::RootUser => "root user",
        SudoProblem::NotInstalled => "sudo not installed",
        SudoProblem::NoPrivileges => "no sudo privileges",
        SudoProblem::ConfigurationError => "sudoers configuration error",
        SudoProblem::Unknown => "unknown",
    }
}
