//! 基于 russh 的传输层实现

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::ChannelMsg;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use secrecy::ExposeSecret;
use sha2::Digest;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result};
use crate::models::{Credential, ExecutionResult, HostKeyVerification, Target};

use super::transport::{SshTransport, TransportFactory};

/// russh 传输实例
pub struct RusshTransport {
    config: Arc<Config>,
    handler: HostKeyHandler,
    stream: Option<TcpStream>,
    handle: Option<Handle<HostKeyHandler>>,
}

impl RusshTransport {
    fn new(config: Arc<Config>, handler: HostKeyHandler) -> Self {
        Self {
            config,
            handler,
            stream: None,
            handle: None,
        }
    }

    fn handle_mut(&mut self) -> Result<&mut Handle<HostKeyHandler>> {
        self.handle.as_mut().ok_or(AppError::NotConnected)
    }
}

#[async_trait]
impl SshTransport for RusshTransport {
    async fn open(&mut self, target: &Target) -> Result<()> {
        debug!(host = %target.address, port = target.port, "Opening TCP connection");

        let stream = TcpStream::connect((target.address.as_str(), target.port))
            .await
            .map_err(|e| map_io_error(target, e))?;
        let _ = stream.set_nodelay(true);
        self.stream = Some(stream);
        Ok(())
    }

    async fn handshake(&mut self, target: &Target) -> Result<()> {
        let stream = self.stream.take().ok_or(AppError::NotConnected)?;
        // 每次握手使用新的处理器，会话断开后可重新建立
        let handler = self.handler.clone();

        let handle = client::connect_stream(self.config.clone(), stream, handler)
            .await
            .map_err(|e| {
                error!(error = %e, endpoint = %target.endpoint(), "SSH handshake failed");
                match e {
                    russh::Error::UnknownKey => AppError::ConnectionFailed(format!(
                        "Host key verification failed for {}",
                        target.host_key()
                    )),
                    other => AppError::ConnectionFailed(format!("SSH handshake failed: {}", other)),
                }
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    async fn authenticate(&mut self, target: &Target) -> Result<()> {
        let username = target.username.clone();
        let handle = self.handle_mut()?;

        let auth_result = match &target.credential {
            Credential::Password { password } => {
                handle
                    .authenticate_password(username, password.expose_secret().as_str())
                    .await
            }
            Credential::Key {
                private_key,
                passphrase,
            } => {
                let key = russh_keys::decode_secret_key(
                    private_key.expose_secret(),
                    passphrase.as_ref().map(|p| p.expose_secret().as_str()),
                )
                .map_err(|e| {
                    error!(error = %e, "Failed to decode private key");
                    AppError::AuthenticationFailed(format!("Failed to load private key: {}", e))
                })?;

                handle.authenticate_publickey(username, Arc::new(key)).await
            }
        };

        match auth_result {
            Ok(true) => {
                info!(
                    endpoint = %target.endpoint(),
                    method = target.credential.method(),
                    "SSH authentication succeeded"
                );
                Ok(())
            }
            Ok(false) => Err(AppError::AuthenticationFailed(format!(
                "{} rejected by server",
                target.credential.method()
            ))),
            Err(e) => Err(AppError::AuthenticationFailed(e.to_string())),
        }
    }

    async fn exec(&mut self, command: &str) -> Result<ExecutionResult> {
        let start_time = std::time::Instant::now();
        let handle = self.handle_mut()?;

        let mut channel = handle.channel_open_session().await.map_err(|e| {
            error!(error = %e, "Failed to open SSH channel");
            AppError::ConnectionFailed(format!("Failed to open SSH channel: {}", e))
        })?;

        channel.exec(true, command).await.map_err(|e| {
            error!(error = %e, "Failed to start command");
            AppError::ConnectionFailed(format!("Failed to start command: {}", e))
        })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        // 读取至通道关闭，退出码可能早于剩余输出到达
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } => {
                    // SSH_EXTENDED_DATA_STDERR
                    if ext == 1 {
                        stderr.extend_from_slice(data);
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
                _ => {}
            }
        }

        let _ = channel.close().await;

        let exit_code = exit_code.unwrap_or_else(|| {
            warn!(command = %command, "Channel closed without exit status");
            -1
        });

        Ok(ExecutionResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            duration_secs: start_time.elapsed().as_secs_f64(),
            timed_out: false,
        })
    }

    async fn disconnect(&mut self) {
        self.stream = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "English")
                .await;
        }
    }
}

fn map_io_error(target: &Target, e: std::io::Error) -> AppError {
    let endpoint = format!("{}:{}", target.address, target.port);
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => AppError::ConnectionRefused(endpoint),
        std::io::ErrorKind::TimedOut => AppError::Timeout(format!("TCP connect to {}", endpoint)),
        _ => {
            let message = e.to_string().to_lowercase();
            if message.contains("unreachable")
                || message.contains("lookup")
                || message.contains("name or service not known")
            {
                AppError::NetworkUnreachable(format!("{}: {}", endpoint, e))
            } else {
                AppError::ConnectionFailed(format!("{}: {}", endpoint, e))
            }
        }
    }
}

/// 计算主机公钥的 SHA-256 指纹
pub fn calculate_fingerprint(public_key_base64: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(public_key_base64.as_bytes());
    hex::encode(hasher.finalize())
}

/// SSH 客户端会话处理器（主机密钥校验）
#[derive(Clone)]
pub struct HostKeyHandler {
    verification_mode: HostKeyVerification,
    known_hosts: Option<HashMap<String, String>>,
    host_key: String,
}

impl HostKeyHandler {
    pub fn new(
        verification_mode: HostKeyVerification,
        known_hosts: Option<HashMap<String, String>>,
        host_key: String,
    ) -> Self {
        Self {
            verification_mode,
            known_hosts,
            host_key,
        }
    }

    /// 按策略校验指纹
    pub fn verify_fingerprint(&self, fingerprint: &str) -> bool {
        let stored = self
            .known_hosts
            .as_ref()
            .and_then(|known| known.get(&self.host_key));

        match (&self.verification_mode, stored) {
            (HostKeyVerification::Disabled, _) => {
                warn!(host = %self.host_key, "Host key verification DISABLED - accepting all keys");
                true
            }
            (_, Some(stored)) if stored == fingerprint => {
                debug!(host = %self.host_key, "Host key verified");
                true
            }
            (_, Some(stored)) => {
                error!(
                    host = %self.host_key,
                    expected = %stored,
                    actual = %fingerprint,
                    "Host key mismatch - REJECTING CONNECTION"
                );
                false
            }
            (HostKeyVerification::Accept, None) => {
                info!(
                    host = %self.host_key,
                    fingerprint = %fingerprint,
                    "First time connecting - accepting host key"
                );
                true
            }
            (HostKeyVerification::Strict, None) => {
                error!(host = %self.host_key, "Unknown host in strict mode - rejecting connection");
                false
            }
        }
    }
}

#[async_trait]
impl client::Handler for HostKeyHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = calculate_fingerprint(&server_public_key.public_key_base64());
        Ok(self.verify_fingerprint(&fingerprint))
    }
}

/// russh 传输工厂
pub struct RusshTransportFactory {
    config: Arc<Config>,
    known_hosts: Option<HashMap<String, String>>,
}

impl RusshTransportFactory {
    pub fn new() -> Self {
        let config = Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            known_hosts: None,
        }
    }

    /// 设置全局 known_hosts（目标主机自带的优先）
    pub fn with_known_hosts(mut self, known_hosts: HashMap<String, String>) -> Self {
        self.known_hosts = Some(known_hosts);
        self
    }

    /// 从文件加载 known_hosts（每行: host:port fingerprint）
    pub async fn load_known_hosts_file(path: &str) -> Result<HashMap<String, String>> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::Config(format!("Failed to read known_hosts file {}: {}", path, e))
        })?;
        Ok(parse_known_hosts(&content))
    }
}

impl Default for RusshTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for RusshTransportFactory {
    fn create(&self, target: &Target) -> Box<dyn SshTransport> {
        let known_hosts = target.known_hosts.clone().or_else(|| self.known_hosts.clone());
        let handler = HostKeyHandler::new(
            target.host_key_verification.clone(),
            known_hosts,
            target.host_key(),
        );
        Box::new(RusshTransport::new(self.config.clone(), handler))
    }
}

/// 解析 known_hosts 文本
pub fn parse_known_hosts(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let host = parts.next()?;
            let fingerprint = parts.next()?;
            Some((host.to_string(), fingerprint.to_lowercase()))
        })
        .collect()
}
