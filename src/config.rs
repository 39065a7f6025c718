//! 配置系统
//! 从环境变量加载所有配置（前缀 VPS_，层级分隔符 __）

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::time::Duration;

use crate::deploy::executor::ExecutorOptions;
use crate::models::target::HostKeyVerification;
use crate::pool::{PoolConfig, ReconnectPolicy};
use crate::ssh::SessionOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty, compact
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// TCP 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 握手与认证超时（秒）
    pub handshake_timeout_secs: u64,
    /// 命令执行默认超时（秒）
    pub command_timeout_secs: u64,
    /// 健康探测超时（秒）
    pub health_probe_timeout_secs: u64,
    /// 主机密钥验证策略（strict/accept/disabled）
    #[serde(default = "default_host_key_verification")]
    pub host_key_verification: String,
    /// known_hosts 文件路径（可选，格式: host:port fingerprint）
    #[serde(default)]
    pub known_hosts_file: Option<String>,
}

/// 默认主机密钥验证策略：accept（首次连接时接受新密钥）
fn default_host_key_verification() -> String {
    "accept".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSettings {
    /// 连接池容量
    pub max_size: usize,
    /// 最大空闲时间（秒）
    pub max_idle_secs: u64,
    /// 健康检查间隔（秒）
    pub health_check_interval_secs: u64,
    /// 空闲清理间隔（秒）
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSettings {
    /// 最大重连次数
    pub max_attempts: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 退避倍数
    pub multiplier: f64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSettings {
    /// 文件上传时每个 base64 分块的大小
    pub upload_chunk_size: usize,
    /// 远程临时目录
    pub temp_dir: String,
    /// 命令组执行阶段的进度窗口起点
    pub progress_start: f64,
    /// 命令组执行阶段的进度窗口终点
    pub progress_end: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub ssh: SshConfig,
    pub pool: PoolSettings,
    pub reconnect: ReconnectSettings,
    pub executor: ExecutorSettings,
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // SSH 默认配置
            .set_default("ssh.connect_timeout_secs", 10)?
            .set_default("ssh.handshake_timeout_secs", 10)?
            .set_default("ssh.command_timeout_secs", 300)?
            .set_default("ssh.health_probe_timeout_secs", 5)?
            .set_default("ssh.host_key_verification", "accept")?
            // 连接池默认配置
            .set_default("pool.max_size", 8)?
            .set_default("pool.max_idle_secs", 600)?
            .set_default("pool.health_check_interval_secs", 30)?
            .set_default("pool.cleanup_interval_secs", 120)?
            // 重连默认配置
            .set_default("reconnect.max_attempts", 3)?
            .set_default("reconnect.base_delay_ms", 2000)?
            .set_default("reconnect.multiplier", 2.0)?
            .set_default("reconnect.max_delay_ms", 30000)?
            // 执行器默认配置
            .set_default("executor.upload_chunk_size", 4096)?
            .set_default("executor.temp_dir", "/tmp")?
            .set_default("executor.progress_start", 0.1)?
            .set_default("executor.progress_end", 0.95)?;

        settings = settings.add_source(
            Environment::with_prefix("VPS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty, compact",
                    self.logging.format
                )))
            }
        }

        if self.ssh.host_key_verification.parse::<HostKeyVerification>().is_err() {
            return Err(ConfigError::Message(format!(
                "Invalid host key verification mode: {}",
                self.ssh.host_key_verification
            )));
        }

        if self.pool.max_size == 0 {
            return Err(ConfigError::Message("pool.max_size must be at least 1".to_string()));
        }

        if self.pool.health_check_interval_secs == 0 || self.pool.cleanup_interval_secs == 0 {
            return Err(ConfigError::Message(
                "pool maintenance intervals must be at least 1 second".to_string(),
            ));
        }

        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::Message(
                "reconnect.multiplier must be >= 1.0".to_string(),
            ));
        }

        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Message(
                "reconnect.base_delay_ms must be <= reconnect.max_delay_ms".to_string(),
            ));
        }

        if self.executor.upload_chunk_size == 0 || self.executor.upload_chunk_size > 65536 {
            return Err(ConfigError::Message(
                "executor.upload_chunk_size must be between 1 and 65536".to_string(),
            ));
        }

        let window = (self.executor.progress_start, self.executor.progress_end);
        if !(0.0..=1.0).contains(&window.0)
            || !(0.0..=1.0).contains(&window.1)
            || window.0 > window.1
        {
            return Err(ConfigError::Message(
                "executor progress window must satisfy 0 <= start <= end <= 1".to_string(),
            ));
        }

        Ok(())
    }

    /// 连接池配置
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool.max_size,
            max_idle_time: Duration::from_secs(self.pool.max_idle_secs),
            health_check_interval: Duration::from_secs(self.pool.health_check_interval_secs),
            cleanup_interval: Duration::from_secs(self.pool.cleanup_interval_secs),
            session: self.session_options(),
            reconnect: ReconnectPolicy {
                max_attempts: self.reconnect.max_attempts,
                base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                multiplier: self.reconnect.multiplier,
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            },
        }
    }

    /// 会话配置
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(self.ssh.handshake_timeout_secs),
            auth_timeout: Duration::from_secs(self.ssh.handshake_timeout_secs),
            command_timeout: Duration::from_secs(self.ssh.command_timeout_secs),
            health_probe_timeout: Duration::from_secs(self.ssh.health_probe_timeout_secs),
            upload_chunk_size: self.executor.upload_chunk_size,
            temp_dir: self.executor.temp_dir.clone(),
        }
    }

    /// 执行器配置
    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            command_timeout: Duration::from_secs(self.ssh.command_timeout_secs),
            temp_dir: self.executor.temp_dir.clone(),
            progress_window: (self.executor.progress_start, self.executor.progress_end),
        }
    }

    /// 主机密钥验证策略
    pub fn host_key_verification(&self) -> HostKeyVerification {
        self.ssh
            .host_key_verification
            .parse()
            .unwrap_or_default()
    }
}
