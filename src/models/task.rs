//! 部署任务模型
//!
//! 一次部署运行的记录：状态、进度与日志。
//! 仅在运行期间由执行器修改，之后交给外部存储持久化。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

use super::execution::ExecutionResult;
use super::target::Target;

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 待执行
    Pending,
    /// 执行中
    Running,
    /// 已完成
    Completed,
    /// 已失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// 日志条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            command: None,
            output: None,
            timestamp: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// 部署任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentTask {
    pub id: Uuid,
    pub target_id: String,
    /// 来源模板（临时命令为 None）
    pub template_id: Option<String>,
    /// 原始命令列表
    pub commands: Vec<String>,
    /// 变量替换表
    pub variables: HashMap<String, String>,
    pub status: TaskStatus,
    /// 进度 0.0 - 1.0，单次运行内单调不减
    pub progress: f64,
    pub logs: Vec<LogEntry>,
    pub last_result: Option<ExecutionResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeploymentTask {
    /// 创建待执行任务
    pub fn new(
        target_id: impl Into<String>,
        commands: Vec<String>,
        variables: HashMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id: target_id.into(),
            template_id: None,
            commands,
            variables,
            status: TaskStatus::Pending,
            progress: 0.0,
            logs: Vec::new(),
            last_result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// pending -> running
    pub fn start(&mut self) {
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Running;
            self.progress = 0.0;
            self.started_at = Some(Utc::now());
        }
    }

    pub fn append_log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }

    /// 更新进度（只增不减，限制在 0..=1）
    pub fn set_progress(&mut self, fraction: f64) -> f64 {
        let clamped = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        if clamped > self.progress {
            self.progress = clamped;
        }
        self.progress
    }

    pub fn complete(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = TaskStatus::Completed;
        self.progress = 1.0;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// 按级别统计日志条目
    pub fn count_logs(&self, level: LogLevel) -> usize {
        self.logs.iter().filter(|entry| entry.level == level).count()
    }
}

/// 部署提交请求
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DeploymentRequest {
    #[validate(nested)]
    pub target: Target,
    /// 临时命令（与 template_id 二选一）
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    /// 模板占位符与 shell 变量的初始值
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl DeploymentRequest {
    pub fn commands(target: Target, commands: Vec<String>) -> Self {
        Self {
            target,
            commands,
            template_id: None,
            variables: HashMap::new(),
        }
    }

    pub fn template(target: Target, template_id: impl Into<String>) -> Self {
        Self {
            target,
            commands: Vec::new(),
            template_id: Some(template_id.into()),
            variables: HashMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> DeploymentTask {
        DeploymentTask::new("web-1", vec!["echo hi".to_string()], HashMap::new())
    }

    #[test]
    fn test_task_lifecycle() {
        let mut task = task();
        assert_eq!(task.status, TaskStatus::Pending);

        task.start();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());

        task.complete();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 1.0);

        // 终态不可再变更
        task.fail("late failure");
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut task = task();
        task.start();
        assert_eq!(task.set_progress(0.4), 0.4);
        assert_eq!(task.set_progress(0.2), 0.4);
        assert_eq!(task.set_progress(7.0), 1.0);
        assert_eq!(task.set_progress(f64::NAN), 1.0);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_request_validation() {
        use crate::models::Credential;

        let target = Target::new("web-1", "", "deploy", Credential::password("pw"));
        let request = DeploymentRequest::commands(target, vec!["uptime".to_string()]);
        assert!(request.validate().is_err());

        let target = Target::new("web-1", "10.0.0.5", "deploy", Credential::password("pw"));
        let request = DeploymentRequest::template(target, "nginx").with_variable("port", "80");
        assert!(request.validate().is_ok());
        assert_eq!(request.variables.get("port").map(String::as_str), Some("80"));
    }

    #[test]
    fn test_log_entry_serialization() {
        let entry = LogEntry::success("done").with_command("echo hi");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"level\":\"success\""));
        assert!(json.contains("\"command\":\"echo hi\""));
        assert!(!json.contains("output"));
    }
}
