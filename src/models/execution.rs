//! 统一执行结果模型
//!
//! 定义单条远程命令的执行结果

use serde::{Deserialize, Serialize};

/// 执行结果 - 通用的命令执行结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    /// 退出码
    pub exit_code: i32,

    /// 标准输出
    pub stdout: String,

    /// 标准错误
    pub stderr: String,

    /// 执行时长（秒）
    pub duration_secs: f64,

    /// 是否超时
    pub timed_out: bool,
}

impl ExecutionResult {
    /// 创建成功结果
    pub fn success(stdout: impl Into<String>, duration_secs: f64) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            duration_secs,
            timed_out: false,
        }
    }

    /// 创建失败结果
    pub fn failure(
        exit_code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        duration_secs: f64,
    ) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration_secs,
            timed_out: false,
        }
    }

    /// 创建超时结果
    pub fn timeout(duration_secs: f64) -> Self {
        Self {
            exit_code: 124, // timeout 退出码
            stdout: String::new(),
            stderr: "Execution timed out".to_string(),
            duration_secs,
            timed_out: true,
        }
    }

    /// 判断是否成功
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// 获取完整输出（stdout + stderr）
    pub fn full_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr).trim().to_string()
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration_secs: 0.0,
            timed_out: false,
        }
    }
}
