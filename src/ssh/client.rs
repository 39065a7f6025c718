//! SSH 会话客户端
//!
//! 对单个目标主机的一条已认证会话进行封装，维护连接状态机：
//! `Disconnected -> Connecting -> Authenticating -> Connected -> Disconnected`。
//! 每个网络阶段单独限时，超时或失败一律回到 `Disconnected`。

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{ExecutionResult, Target};

use super::transport::SshTransport;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

/// 会话参数
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// TCP 连接超时
    pub connect_timeout: Duration,
    /// 协议握手超时
    pub handshake_timeout: Duration,
    /// 认证超时
    pub auth_timeout: Duration,
    /// 命令默认超时
    pub command_timeout: Duration,
    /// 健康探测超时
    pub health_probe_timeout: Duration,
    /// 上传时每次追加的 base64 字符数
    pub upload_chunk_size: usize,
    /// 上传临时文件所在目录
    pub temp_dir: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(300),
            health_probe_timeout: Duration::from_secs(5),
            upload_chunk_size: 4096,
            temp_dir: "/tmp".to_string(),
        }
    }
}

/// 单主机 SSH 会话
pub struct SessionClient {
    target: Target,
    transport: Box<dyn SshTransport>,
    state: SessionState,
    options: SessionOptions,
    /// 尚未删除的远端临时文件
    scratch_files: Vec<String>,
}

impl SessionClient {
    pub fn new(target: Target, transport: Box<dyn SshTransport>, options: SessionOptions) -> Self {
        Self {
            target,
            transport,
            state: SessionState::Disconnected,
            options,
            scratch_files: Vec::new(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// 建立 TCP 连接并完成握手，成功后进入 `Authenticating`
    pub async fn connect(&mut self) -> Result<()> {
        match self.state {
            SessionState::Connected | SessionState::Authenticating => return Ok(()),
            // 持有 &mut self 时仍处于 Connecting，说明上一次尝试被中途取消
            SessionState::Connecting => self.reset().await,
            SessionState::Disconnected => {}
        }

        debug!(endpoint = %self.target.endpoint(), "Connecting");
        self.state = SessionState::Connecting;

        let target = self.target.clone();
        let connect_timeout = self.options.connect_timeout;
        let opened = time_boxed(connect_timeout, "TCP connect", self.transport.open(&target)).await;
        if let Err(e) = opened {
            self.reset().await;
            return Err(e);
        }

        let handshake_timeout = self.options.handshake_timeout;
        let handshaked =
            time_boxed(handshake_timeout, "SSH handshake", self.transport.handshake(&target)).await;
        if let Err(e) = handshaked {
            self.reset().await;
            return Err(e);
        }

        self.state = SessionState::Authenticating;
        Ok(())
    }

    /// 认证，成功后进入 `Connected`
    pub async fn authenticate(&mut self) -> Result<()> {
        match self.state {
            SessionState::Connected => return Ok(()),
            SessionState::Authenticating => {}
            _ => return Err(AppError::NotConnected),
        }

        let target = self.target.clone();
        let auth_timeout = self.options.auth_timeout;
        let authenticated =
            time_boxed(auth_timeout, "SSH authentication", self.transport.authenticate(&target))
                .await;

        match authenticated {
            Ok(()) => {
                self.state = SessionState::Connected;
                info!(endpoint = %self.target.endpoint(), "SSH session established");
                Ok(())
            }
            Err(e) => {
                self.reset().await;
                Err(e)
            }
        }
    }

    /// connect + authenticate
    pub async fn establish(&mut self) -> Result<()> {
        self.connect().await?;
        self.authenticate().await
    }

    /// 以默认超时执行命令
    pub async fn execute(&mut self, command: &str) -> Result<ExecutionResult> {
        let timeout = self.options.command_timeout;
        self.execute_with_timeout(command, timeout).await
    }

    /// 执行命令；非零退出码通过 [`ExecutionResult`] 返回，不视为错误
    pub async fn execute_with_timeout(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        if !self.is_connected() {
            return Err(AppError::NotConnected);
        }

        debug!(endpoint = %self.target.endpoint(), command = %command, "Executing command");

        match tokio::time::timeout(timeout, self.transport.exec(command)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                // 传输层错误意味着会话已不可用
                if e.is_session_error() {
                    self.reset().await;
                }
                Err(e)
            }
            Err(_) => {
                warn!(
                    endpoint = %self.target.endpoint(),
                    timeout_secs = timeout.as_secs(),
                    "Command timed out, resetting session"
                );
                self.reset().await;
                Err(AppError::Timeout(format!(
                    "command exceeded {}s: {}",
                    timeout.as_secs(),
                    command
                )))
            }
        }
    }

    /// 执行命令，非零退出码转换为 `CommandFailed`
    pub async fn run_checked(&mut self, command: &str) -> Result<ExecutionResult> {
        let result = self.execute(command).await?;
        if result.is_success() {
            Ok(result)
        } else {
            Err(AppError::CommandFailed {
                command: command.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            })
        }
    }

    /// 仅通过命令执行写入远程文件
    ///
    /// 内容先 base64 编码后分块追加到临时文件，再在远端解码到目标路径并校验存在。
    /// 临时文件总会尝试删除。
    pub async fn write_file(&mut self, content: &[u8], remote_path: &str) -> Result<()> {
        validate_remote_path(remote_path)?;
        validate_remote_path(&self.options.temp_dir)?;
        if !self.is_connected() {
            return Err(AppError::NotConnected);
        }

        let temp_path = format!(
            "{}/.upload-{}.b64",
            self.options.temp_dir.trim_end_matches('/'),
            Uuid::new_v4().simple()
        );
        let encoded = STANDARD.encode(content);

        self.track_scratch_file(&temp_path);
        let uploaded = self.upload_encoded(&encoded, &temp_path, remote_path).await;
        self.remove_scratch_file(&temp_path).await;

        if uploaded.is_ok() {
            debug!(
                endpoint = %self.target.endpoint(),
                remote_path = %remote_path,
                bytes = content.len(),
                "File written"
            );
        }
        uploaded
    }

    /// 登记一个需要在结束时删除的远端文件
    pub fn track_scratch_file(&mut self, path: &str) {
        self.scratch_files.push(path.to_string());
    }

    pub fn scratch_files(&self) -> &[String] {
        &self.scratch_files
    }

    /// 删除远端文件（尽力而为），并取消登记
    pub async fn remove_scratch_file(&mut self, path: &str) {
        self.scratch_files.retain(|tracked| tracked != path);
        if !self.is_connected() {
            return;
        }
        let timeout = self.options.health_probe_timeout;
        if let Err(e) = self
            .execute_with_timeout(&format!("rm -f {}", quote(path)), timeout)
            .await
        {
            debug!(error = %e, path = %path, "Scratch file cleanup failed");
        }
    }

    /// 删除所有仍登记的远端文件；上传或脚本执行被中途放弃后调用
    pub async fn remove_scratch_files(&mut self) {
        for path in std::mem::take(&mut self.scratch_files) {
            self.remove_scratch_file(&path).await;
        }
    }

    async fn upload_encoded(&mut self, encoded: &str, temp_path: &str, remote_path: &str) -> Result<()> {
        let temp = quote(temp_path);
        self.run_checked(&format!(": > {}", temp)).await?;

        let chunk_size = self.options.upload_chunk_size.max(1);
        // base64 输出只含 ASCII，按字节切分不会破坏字符
        for chunk in encoded.as_bytes().chunks(chunk_size) {
            let chunk = String::from_utf8_lossy(chunk);
            self.run_checked(&format!("printf '%s' {} >> {}", quote(&chunk), temp))
                .await?;
        }

        let remote = quote(remote_path);
        self.run_checked(&format!("base64 -d {} > {}", temp, remote))
            .await?;
        self.run_checked(&format!("test -f {}", remote)).await?;
        Ok(())
    }

    /// 健康探测
    pub async fn health_probe(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let timeout = self.options.health_probe_timeout;
        match self.execute_with_timeout("echo ping", timeout).await {
            Ok(result) => result.is_success() && result.stdout.contains("ping"),
            Err(e) => {
                debug!(endpoint = %self.target.endpoint(), error = %e, "Health probe failed");
                false
            }
        }
    }

    /// 断开连接
    pub async fn disconnect(&mut self) {
        if self.state != SessionState::Disconnected {
            info!(endpoint = %self.target.endpoint(), "Disconnecting SSH session");
        }
        self.reset().await;
    }

    async fn reset(&mut self) {
        self.transport.disconnect().await;
        self.state = SessionState::Disconnected;
    }
}

/// 网络操作与计时器竞速，超时统一映射为 `Timeout`
async fn time_boxed<F>(limit: Duration, phase: &str, operation: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(format!(
            "{} exceeded {}s",
            phase,
            limit.as_secs()
        ))),
    }
}

/// 校验远程路径：必须为绝对路径，且不含 `..` 段
pub fn validate_remote_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(AppError::InvalidPath(format!("{} (must be absolute)", path)));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(AppError::InvalidPath(format!("{} (contains '..')", path)));
    }
    if path.contains('\0') || path.contains('\n') {
        return Err(AppError::InvalidPath(format!("{:?} (control characters)", path)));
    }
    Ok(())
}

/// 为 POSIX shell 引用参数
pub fn quote(value: &str) -> String {
    shell_escape::unix::escape(Cow::from(value)).into_owned()
}
