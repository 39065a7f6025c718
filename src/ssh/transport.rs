//! SSH 传输层抽象
//!
//! 底层会话原语：TCP 连接、协议握手、认证、执行、断开。
//! 会话状态机与超时控制由 [`SessionClient`](super::client::SessionClient) 负责，
//! 传输层只负责单次网络操作本身。

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ExecutionResult, Target};

/// 底层 SSH 会话原语
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// 建立 TCP 连接
    async fn open(&mut self, target: &Target) -> Result<()>;

    /// SSH 协议握手（包含主机密钥校验）
    async fn handshake(&mut self, target: &Target) -> Result<()>;

    /// 用户认证
    async fn authenticate(&mut self, target: &Target) -> Result<()>;

    /// 执行命令并收集输出，非零退出码不视为错误
    async fn exec(&mut self, command: &str) -> Result<ExecutionResult>;

    /// 断开连接（尽力而为）
    async fn disconnect(&mut self);
}

/// 为每个目标主机创建新的传输实例
pub trait TransportFactory: Send + Sync {
    fn create(&self, target: &Target) -> Box<dyn SshTransport>;
}
