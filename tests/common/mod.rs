//! 测试公共模块
//! 按目标主机脚本化的模拟 SSH 传输，以及常用构造函数

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use vps_deploy::{
    error::{AppError, Result},
    models::{Credential, ExecutionResult, Target},
    pool::{ConnectionPool, PoolConfig, ReconnectPolicy},
    ssh::{SessionOptions, SshTransport, TransportFactory},
};

/// 环境探测命令输出中的标记
pub const PROBE_MARKER: &str = "PROBE_USER";

/// 连接行为
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectBehavior {
    Succeed,
    Refuse,
    Hang,
    Delay(Duration),
}

/// 命令应答
#[derive(Debug, Clone)]
pub enum Reply {
    Result(ExecutionResult),
    /// 永不返回
    Hang,
    /// 传输层断开
    Drop,
}

pub fn ok(stdout: &str) -> Reply {
    Reply::Result(ExecutionResult::success(stdout.to_string(), 0.01))
}

pub fn fail(exit_code: i32, stderr: &str) -> Reply {
    Reply::Result(ExecutionResult::failure(
        exit_code,
        String::new(),
        stderr.to_string(),
        0.01,
    ))
}

/// 单台模拟主机
#[derive(Debug)]
pub struct Host {
    pub connect: ConnectBehavior,
    /// 环境探测的默认输出
    pub probe_output: String,
    /// 按子串匹配的固定应答（按顺序匹配）
    pub rules: Vec<(String, Reply)>,
    /// 只生效一次的应答，优先于 rules
    pub once: VecDeque<(String, Reply)>,
    /// 执行命令失败时模拟连接已断开
    pub broken: bool,
    pub executed: Vec<String>,
    /// 每次创建传输实例的时间
    pub creations: Vec<Instant>,
    /// 每次尝试 TCP 连接的时间
    pub open_attempts: Vec<Instant>,
    pub disconnects: usize,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            connect: ConnectBehavior::Succeed,
            probe_output: probe("deploy", 1000, true, true, "ubuntu", "apt-get"),
            rules: Vec::new(),
            once: VecDeque::new(),
            broken: false,
            executed: Vec::new(),
            creations: Vec::new(),
            open_attempts: Vec::new(),
            disconnects: 0,
        }
    }
}

/// 构造环境探测输出
pub fn probe(user: &str, uid: u32, sudo: bool, sudo_ok: bool, os_id: &str, pkg: &str) -> String {
    let flag = |value: bool| if value { "1" } else { "0" };
    let mut output = format!(
        "PROBE_USER={}\nPROBE_UID={}\nPROBE_SUDO={}\nPROBE_SUDO_OK={}\nPROBE_OS_ID={}\nPROBE_OS_LIKE=\n",
        user,
        uid,
        flag(sudo),
        flag(sudo_ok),
        os_id
    );
    if !pkg.is_empty() {
        output.push_str(&format!("PROBE_PKG={}\n", pkg));
    }
    output
}

/// 所有模拟主机的共享状态
#[derive(Clone, Default)]
pub struct MockHub {
    hosts: Arc<Mutex<HashMap<String, Host>>>,
}

impl MockHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 修改（必要时创建）目标主机脚本
    pub fn host<R>(&self, target_id: &str, f: impl FnOnce(&mut Host) -> R) -> R {
        let mut hosts = self.hosts.lock().unwrap();
        f(hosts.entry(target_id.to_string()).or_default())
    }

    pub fn set_connect(&self, target_id: &str, behavior: ConnectBehavior) {
        self.host(target_id, |h| h.connect = behavior);
    }

    pub fn set_broken(&self, target_id: &str, broken: bool) {
        self.host(target_id, |h| h.broken = broken);
    }

    pub fn set_probe(&self, target_id: &str, output: String) {
        self.host(target_id, |h| h.probe_output = output);
    }

    pub fn respond(&self, target_id: &str, pattern: &str, reply: Reply) {
        self.host(target_id, |h| h.rules.push((pattern.to_string(), reply)));
    }

    pub fn respond_once(&self, target_id: &str, pattern: &str, reply: Reply) {
        self.host(target_id, |h| h.once.push_back((pattern.to_string(), reply)));
    }

    pub fn executed(&self, target_id: &str) -> Vec<String> {
        self.host(target_id, |h| h.executed.clone())
    }

    pub fn creations(&self, target_id: &str) -> usize {
        self.host(target_id, |h| h.creations.len())
    }

    pub fn open_attempts(&self, target_id: &str) -> Vec<Instant> {
        self.host(target_id, |h| h.open_attempts.clone())
    }

    pub fn disconnects(&self, target_id: &str) -> usize {
        self.host(target_id, |h| h.disconnects)
    }

    pub fn factory(&self) -> Arc<dyn TransportFactory> {
        Arc::new(MockFactory { hub: self.clone() })
    }

    fn reply(&self, target_id: &str, command: &str) -> Reply {
        self.host(target_id, |h| {
            h.executed.push(command.to_string());

            if h.broken {
                return Reply::Drop;
            }
            if let Some(pos) = h.once.iter().position(|(p, _)| command.contains(p.as_str())) {
                if let Some((_, reply)) = h.once.remove(pos) {
                    return reply;
                }
            }
            if let Some((_, reply)) = h.rules.iter().find(|(p, _)| command.contains(p.as_str())) {
                return reply.clone();
            }
            if command == "echo ping" {
                return ok("ping\n");
            }
            if command.contains(PROBE_MARKER) {
                return ok(&h.probe_output);
            }
            ok("")
        })
    }
}

pub struct MockFactory {
    hub: MockHub,
}

impl TransportFactory for MockFactory {
    fn create(&self, target: &Target) -> Box<dyn SshTransport> {
        self.hub.host(&target.id, |h| h.creations.push(Instant::now()));
        Box::new(MockTransport {
            hub: self.hub.clone(),
            target_id: target.id.clone(),
            open: false,
        })
    }
}

pub struct MockTransport {
    hub: MockHub,
    target_id: String,
    open: bool,
}

#[async_trait]
impl SshTransport for MockTransport {
    async fn open(&mut self, target: &Target) -> Result<()> {
        let behavior = self.hub.host(&self.target_id, |h| {
            h.open_attempts.push(Instant::now());
            h.connect
        });
        match behavior {
            ConnectBehavior::Succeed => {}
            ConnectBehavior::Refuse => {
                return Err(AppError::ConnectionRefused(target.host_key()));
            }
            ConnectBehavior::Hang => std::future::pending::<()>().await,
            ConnectBehavior::Delay(delay) => tokio::time::sleep(delay).await,
        }
        self.open = true;
        Ok(())
    }

    async fn handshake(&mut self, _target: &Target) -> Result<()> {
        Ok(())
    }

    async fn authenticate(&mut self, _target: &Target) -> Result<()> {
        Ok(())
    }

    async fn exec(&mut self, command: &str) -> Result<ExecutionResult> {
        if !self.open {
            return Err(AppError::NotConnected);
        }
        match self.hub.reply(&self.target_id, command) {
            Reply::Result(result) => Ok(result),
            Reply::Hang => std::future::pending().await,
            Reply::Drop => Err(AppError::ConnectionFailed("channel closed".to_string())),
        }
    }

    async fn disconnect(&mut self) {
        if self.open {
            self.hub.host(&self.target_id, |h| h.disconnects += 1);
        }
        self.open = false;
    }
}

pub fn target(id: &str) -> Target {
    Target::new(id, format!("{}.example.internal", id), "deploy", Credential::password("secret"))
}

/// 测试用连接池配置：小容量、短退避
pub fn pool_config(max_size: usize) -> PoolConfig {
    PoolConfig {
        max_size,
        max_idle_time: Duration::from_secs(60),
        health_check_interval: Duration::from_secs(30),
        cleanup_interval: Duration::from_secs(60),
        session: SessionOptions::default(),
        reconnect: ReconnectPolicy::default(),
    }
}

pub fn pool(hub: &MockHub, max_size: usize) -> ConnectionPool {
    ConnectionPool::new(pool_config(max_size), hub.factory())
}

/// 等待条件成立（真实时间，最多约 5 秒）
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
