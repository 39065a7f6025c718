//! 目标主机模型
//!
//! 目标主机的身份与凭据，由调用方持有，连接池仅引用

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

/// 主机密钥验证策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyVerification {
    /// 严格模式：只接受已知的主机密钥
    Strict,
    /// 接受模式：首次连接时接受新密钥，之后验证
    #[default]
    Accept,
    /// 禁用验证（不安全，仅用于开发/测试）
    Disabled,
}

impl std::str::FromStr for HostKeyVerification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "accept" => Ok(Self::Accept),
            "disabled" | "none" | "false" => Ok(Self::Disabled),
            _ => Err(format!("Unknown host key verification mode: {}", s)),
        }
    }
}

/// SSH 凭据（使用 Secret 包装，防止日志泄露）
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Credential {
    /// 密码认证
    Password { password: Secret<String> },
    /// 私钥认证
    Key {
        /// 私钥内容（PEM/OpenSSH 格式）
        private_key: Secret<String>,
        /// 私钥密码（如果有）
        passphrase: Option<Secret<String>>,
    },
}

impl Credential {
    /// 创建密码凭据
    pub fn password(password: impl Into<String>) -> Self {
        Credential::Password {
            password: Secret::new(password.into()),
        }
    }

    /// 创建私钥凭据
    pub fn key(private_key: impl Into<String>, passphrase: Option<String>) -> Self {
        Credential::Key {
            private_key: Secret::new(private_key.into()),
            passphrase: passphrase.map(Secret::new),
        }
    }

    /// 认证方式名称（用于日志）
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Password { .. } => "password",
            Credential::Key { .. } => "publickey",
        }
    }

    /// 凭据是否为空
    pub fn is_empty(&self) -> bool {
        match self {
            Credential::Password { password } => password.expose_secret().is_empty(),
            Credential::Key { private_key, .. } => private_key.expose_secret().trim().is_empty(),
        }
    }
}

/// 目标主机
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Target {
    /// 唯一标识
    #[validate(length(min = 1, message = "target id must not be empty"))]
    pub id: String,

    /// 主机地址
    #[validate(length(min = 1, message = "address must not be empty"))]
    pub address: String,

    /// 端口
    #[serde(default = "default_ssh_port")]
    #[validate(range(min = 1, message = "port must be between 1 and 65535"))]
    pub port: u16,

    /// 用户名
    #[validate(length(min = 1, message = "username must not be empty"))]
    pub username: String,

    /// 凭据
    pub credential: Credential,

    /// 主机密钥验证策略
    #[serde(default)]
    pub host_key_verification: HostKeyVerification,

    /// 已知的主机密钥指纹（host:port -> sha256 hex）
    #[serde(default)]
    pub known_hosts: Option<HashMap<String, String>>,
}

fn default_ssh_port() -> u16 {
    22
}

impl Target {
    /// 创建新的目标主机
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        username: impl Into<String>,
        credential: Credential,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port: default_ssh_port(),
            username: username.into(),
            credential,
            host_key_verification: HostKeyVerification::default(),
            known_hosts: None,
        }
    }

    /// 设置端口
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// 设置主机密钥验证策略
    pub fn with_host_key_verification(mut self, verification: HostKeyVerification) -> Self {
        self.host_key_verification = verification;
        self
    }

    /// 设置已知主机密钥
    pub fn with_known_hosts(mut self, known_hosts: HashMap<String, String>) -> Self {
        self.known_hosts = Some(known_hosts);
        self
    }

    /// 获取目标地址字符串
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.address, self.port)
    }

    /// known_hosts 查找键
    pub fn host_key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}
