//! 统一错误模型
//! 定义连接池、会话与部署执行的所有错误类型

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 应用错误类型
#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Command failed (exit code {exit_code}): {command}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Invalid remote path: {0}")]
    InvalidPath(String),

    #[error("Connection pool is full (capacity: {capacity})")]
    PoolFull { capacity: usize },

    #[error("Session is not connected")]
    NotConnected,

    #[error("Reconnection exhausted for {target_id} after {attempts} attempts")]
    Unrecoverable { target_id: String, attempts: u32 },

    #[error("Deployment cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// 失败原因分类
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// 网络错误
    NetworkError,
    /// 认证失败
    AuthFailed,
    /// 连接超时
    ConnectionTimeout,
    /// 命令执行失败（非零退出码）
    CommandFailed,
    /// 权限不足（sudo 相关）
    PrivilegeError,
    /// 连接池容量不足
    PoolExhausted,
    /// 已取消
    Cancelled,
    /// 未知错误
    Unknown,
}

impl AppError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Timeout(_) => "TIMEOUT",
            AppError::NetworkUnreachable(_) => "NETWORK_UNREACHABLE",
            AppError::ConnectionRefused(_) => "CONNECTION_REFUSED",
            AppError::ConnectionFailed(_) => "CONNECTION_FAILED",
            AppError::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            AppError::CommandFailed { .. } => "COMMAND_FAILED",
            AppError::InvalidPath(_) => "INVALID_PATH",
            AppError::PoolFull { .. } => "POOL_FULL",
            AppError::NotConnected => "NOT_CONNECTED",
            AppError::Unrecoverable { .. } => "UNRECOVERABLE",
            AppError::Cancelled => "CANCELLED",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::Timeout(_) => "Remote operation timed out".to_string(),
            AppError::NetworkUnreachable(_) => "Host is unreachable".to_string(),
            AppError::ConnectionRefused(_) => "Connection refused by host".to_string(),
            AppError::ConnectionFailed(_) => "SSH connection failed".to_string(),
            AppError::AuthenticationFailed(_) => "SSH authentication failed".to_string(),
            AppError::CommandFailed { command, exit_code, .. } => {
                format!("Command exited with code {}: {}", exit_code, command)
            }
            AppError::InvalidPath(path) => format!("Invalid remote path: {}", path),
            AppError::PoolFull { .. } => "All pooled sessions are busy".to_string(),
            AppError::NotConnected => "Session is not connected".to_string(),
            AppError::Unrecoverable { .. } => "Host could not be reconnected".to_string(),
            AppError::Cancelled => "Deployment cancelled".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Validation(msg) => msg.clone(),
            AppError::NotFound(msg) => format!("Resource not found: {}", msg),
            AppError::Internal(msg) => format!("Internal error: {}", msg),
        }
    }

    /// 按错误类型分类失败原因
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            AppError::Timeout(_) => FailureReason::ConnectionTimeout,
            AppError::NetworkUnreachable(_)
            | AppError::ConnectionRefused(_)
            | AppError::ConnectionFailed(_)
            | AppError::NotConnected
            | AppError::Unrecoverable { .. } => FailureReason::NetworkError,
            AppError::AuthenticationFailed(_) => FailureReason::AuthFailed,
            AppError::CommandFailed { stderr, .. } => {
                let lower = stderr.to_lowercase();
                if lower.contains("sudo") || lower.contains("permission denied") {
                    FailureReason::PrivilegeError
                } else {
                    FailureReason::CommandFailed
                }
            }
            AppError::PoolFull { .. } => FailureReason::PoolExhausted,
            AppError::Cancelled => FailureReason::Cancelled,
            _ => FailureReason::Unknown,
        }
    }

    /// 是否属于会话层错误（可由重连机制恢复）
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            AppError::Timeout(_)
                | AppError::NetworkUnreachable(_)
                | AppError::ConnectionRefused(_)
                | AppError::ConnectionFailed(_)
                | AppError::NotConnected
        )
    }

    // 便捷方法
    pub fn not_found(msg: &str) -> Self {
        AppError::NotFound(msg.to_string())
    }

    pub fn validation(msg: &str) -> Self {
        AppError::Validation(msg.to_string())
    }

    pub fn internal_error(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }

    pub fn timeout(msg: &str) -> Self {
        AppError::Timeout(msg.to_string())
    }
}

impl FailureReason {
    /// 失败后的诊断提示
    pub fn diagnostic_hint(&self) -> &'static str {
        match self {
            FailureReason::NetworkError => {
                "Check that the host is online and the SSH port is reachable"
            }
            FailureReason::AuthFailed => "Check the username, password or private key",
            FailureReason::ConnectionTimeout => {
                "The host did not answer in time; check firewall rules and latency"
            }
            FailureReason::CommandFailed => "Inspect the command output above for the cause",
            FailureReason::PrivilegeError => {
                "The user lacks root or sudo privileges; grant sudo access or log in as root"
            }
            FailureReason::PoolExhausted => {
                "Too many concurrent deployments; retry once a session is released"
            }
            FailureReason::Cancelled => "The deployment was cancelled by the caller",
            FailureReason::Unknown => "Unexpected error; see logs for details",
        }
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

/// 从 validator::ValidationErrors 转换
impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(e.to_string())
    }
}
