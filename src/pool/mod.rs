//! SSH 连接池
//!
//! 每个目标主机最多持有一个会话。所有池状态（登记、驱逐、健康标记、重连记录）
//! 都在同一把互斥锁内修改；连接、认证、探测等网络操作在锁外进行，
//! 完成后再短暂进入临界区应用结果，慢主机不会阻塞其他主机。
//! 同一目标的建连过程由按目标划分的连接锁串行化。

pub mod maintenance;
pub mod reconnect;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::models::Target;
use crate::ssh::{SessionClient, SessionOptions, TransportFactory};

pub use maintenance::spawn_maintenance;
pub use reconnect::{ReconnectPolicy, ReconnectionAttempt};

/// 池内共享的会话句柄；持有锁即独占该会话
pub type SharedSession = Arc<Mutex<SessionClient>>;

/// 连接池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// 最大会话数
    pub max_size: usize,
    /// 空闲超过该时长的会话会被清理
    pub max_idle_time: Duration,
    /// 健康检查间隔
    pub health_check_interval: Duration,
    /// 空闲清理间隔
    pub cleanup_interval: Duration,
    /// 新建会话使用的参数
    pub session: SessionOptions,
    pub reconnect: ReconnectPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            max_idle_time: Duration::from_secs(600),
            health_check_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(120),
            session: SessionOptions::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// 会话健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealth {
    Healthy,
    Unhealthy,
    /// 重连次数耗尽，等待调用方再次 acquire
    Unrecoverable,
}

/// 连接池条目
pub struct PooledSession {
    pub target: Target,
    pub session: SharedSession,
    pub created_at: Instant,
    /// 首次使用前为 None
    pub last_used_at: Option<Instant>,
    pub use_count: u64,
    pub is_connected: bool,
    pub health: SessionHealth,
    leases: usize,
}

impl PooledSession {
    fn new(target: Target, client: SessionClient) -> Self {
        Self {
            target,
            session: Arc::new(Mutex::new(client)),
            created_at: Instant::now(),
            last_used_at: None,
            use_count: 0,
            is_connected: true,
            health: SessionHealth::Healthy,
            leases: 0,
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.leases > 0
    }

    pub fn is_healthy(&self) -> bool {
        self.health == SessionHealth::Healthy && self.is_connected
    }

    fn last_activity(&self) -> Instant {
        self.last_used_at.unwrap_or(self.created_at)
    }

    fn lease(&mut self) -> SharedSession {
        self.leases += 1;
        self.use_count += 1;
        self.last_used_at = Some(Instant::now());
        self.session.clone()
    }
}

/// 连接池统计
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PoolStats {
    pub total: usize,
    pub healthy: usize,
    pub in_use: usize,
    pub idle: usize,
    pub avg_use_count: f64,
    /// 使用中会话占容量的百分比
    pub utilization: f64,
    /// 健康会话占总数的百分比
    pub health_rate: f64,
}

struct ReconnectHandle {
    generation: u64,
    handle: JoinHandle<()>,
    attempt: ReconnectionAttempt,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, PooledSession>,
    reconnections: HashMap<String, ReconnectHandle>,
    /// 未登记但重连已耗尽的目标
    unrecoverable: HashSet<String>,
    next_generation: u64,
}

impl PoolState {
    /// 选出最久未使用且未占用的条目（相同时取最早创建的）
    fn lru_candidate(&self) -> Option<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_in_use())
            .min_by_key(|(_, entry)| (entry.last_activity(), entry.created_at))
            .map(|(id, _)| id.clone())
    }

    fn cancel_reconnection(&mut self, target_id: &str) {
        if let Some(reconnection) = self.reconnections.remove(target_id) {
            reconnection.handle.abort();
            debug!(target_id = %target_id, "Cancelled in-flight reconnection");
        }
    }

    fn is_current(&self, target_id: &str, generation: u64) -> bool {
        self.reconnections
            .get(target_id)
            .map(|r| r.generation == generation)
            .unwrap_or(false)
    }

    fn record_size(&self) {
        metrics::gauge!("ssh_pool_sessions").set(self.entries.len() as f64);
    }
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<PoolState>,
    connect_locks: DashMap<String, Arc<Mutex<()>>>,
    /// 已预留容量、正在建连的数量；只在持有状态锁时读取与增加
    pending_connects: AtomicUsize,
}

/// 建连期间占用的一个容量名额
///
/// 建连结束或调用方中途放弃 `acquire` 时归还。
struct ConnectReservation {
    inner: Arc<PoolInner>,
}

impl ConnectReservation {
    /// 调用方须持有状态锁
    fn reserve(inner: &Arc<PoolInner>) -> Self {
        inner.pending_connects.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: inner.clone(),
        }
    }
}

impl Drop for ConnectReservation {
    fn drop(&mut self) {
        self.inner.pending_connects.fetch_sub(1, Ordering::AcqRel);
    }
}

/// SSH 连接池
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn TransportFactory>) -> Self {
        info!(
            max_size = config.max_size,
            max_idle_secs = config.max_idle_time.as_secs(),
            "SSH connection pool created"
        );
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state: Mutex::new(PoolState::default()),
                connect_locks: DashMap::new(),
                pending_connects: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// 获取目标主机的会话
    ///
    /// 优先复用健康会话；否则在容量不足时驱逐最久未使用的空闲会话，
    /// 全部占用时返回 `PoolFull`。建连失败不登记会话，而是安排后台重连。
    pub async fn acquire(&self, target: &Target) -> Result<SharedSession> {
        let connect_lock = self.inner.connect_lock(&target.id);
        let _serialized = connect_lock.lock().await;

        let (stale, victim, reservation) = {
            let mut state = self.inner.state.lock().await;

            let existing = state
                .entries
                .get(&target.id)
                .map(|entry| (entry.is_healthy(), entry.is_in_use()));

            let mut stale = None;
            match existing {
                // 健康会话直接复用；不健康但仍被占用的会话由持有者与重连任务处理
                Some((healthy, in_use)) if healthy || in_use => {
                    if let Some(entry) = state.entries.get_mut(&target.id) {
                        debug!(
                            target_id = %target.id,
                            use_count = entry.use_count + 1,
                            "Reusing pooled session"
                        );
                        return Ok(entry.lease());
                    }
                }
                Some(_) => {
                    stale = state.entries.remove(&target.id).map(|entry| entry.session);
                }
                None => {}
            }

            // 调用方显式 acquire 会重新开始重连计数
            state.cancel_reconnection(&target.id);
            state.unrecoverable.remove(&target.id);

            let mut victim = None;
            if state.entries.len() + self.inner.pending() >= self.inner.config.max_size {
                let Some(victim_id) = state.lru_candidate() else {
                    warn!(
                        target_id = %target.id,
                        capacity = self.inner.config.max_size,
                        "Connection pool is full"
                    );
                    state.record_size();
                    drop(state);
                    if let Some(session) = stale {
                        shutdown_session(session).await;
                    }
                    return Err(AppError::PoolFull {
                        capacity: self.inner.config.max_size,
                    });
                };
                state.cancel_reconnection(&victim_id);
                victim = state.entries.remove(&victim_id).map(|entry| {
                    info!(evicted = %victim_id, for_target = %target.id, "Evicting least recently used session");
                    metrics::counter!("ssh_pool_evictions_total").increment(1);
                    entry.session
                });
            }

            let reservation = ConnectReservation::reserve(&self.inner);
            state.record_size();
            (stale, victim, reservation)
        };

        for session in stale.into_iter().chain(victim) {
            shutdown_session(session).await;
        }

        let mut client = self.inner.new_client(target);
        let established = client.establish().await;

        let mut state = self.inner.state.lock().await;
        // 先登记结果再归还名额，其间容量只会被高估
        let outcome = match established {
            Ok(()) => {
                let mut entry = PooledSession::new(target.clone(), client);
                let session = entry.lease();
                state.entries.insert(target.id.clone(), entry);
                state.record_size();
                info!(target_id = %target.id, endpoint = %target.endpoint(), "Pooled new SSH session");
                Ok(session)
            }
            Err(e) => {
                warn!(target_id = %target.id, error = %e, "Connection failed, scheduling reconnection");
                self.inner.schedule_reconnection(&mut state, target.clone());
                Err(e)
            }
        };
        drop(reservation);
        outcome
    }

    /// 归还会话；若会话已失效则安排重连
    pub async fn release(&self, target_id: &str) {
        let mut state = self.inner.state.lock().await;

        let Some(entry) = state.entries.get_mut(target_id) else {
            debug!(target_id = %target_id, "Release for unknown session ignored");
            return;
        };

        entry.leases = entry.leases.saturating_sub(1);
        entry.last_used_at = Some(Instant::now());

        // 持有者已释放锁；若锁仍被占用，说明另一个租约正在使用，保持原状
        let connected = entry.session.try_lock().map(|client| client.is_connected()).ok();
        if connected == Some(false) {
            entry.is_connected = false;
            if entry.health == SessionHealth::Healthy {
                entry.health = SessionHealth::Unhealthy;
            }
        }

        let needs_reconnect = entry.health == SessionHealth::Unhealthy;
        let target = entry.target.clone();
        if needs_reconnect && !state.reconnections.contains_key(target_id) {
            warn!(target_id = %target_id, "Released session is unhealthy, scheduling reconnection");
            self.inner.schedule_reconnection(&mut state, target);
        }
    }

    /// 强制断开并移除目标会话，同时取消进行中的重连
    pub async fn evict(&self, target_id: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.lock().await;
            state.cancel_reconnection(target_id);
            state.unrecoverable.remove(target_id);
            let removed = state.entries.remove(target_id);
            state.record_size();
            removed
        };

        match removed {
            Some(entry) => {
                info!(target_id = %target_id, "Evicted session");
                metrics::counter!("ssh_pool_evictions_total").increment(1);
                shutdown_session(entry.session).await;
                true
            }
            None => false,
        }
    }

    /// 对所有空闲且健康的会话进行探测，返回判定为不健康的数量
    pub async fn run_health_check(&self) -> usize {
        let candidates: Vec<(String, SharedSession)> = {
            let state = self.inner.state.lock().await;
            state
                .entries
                .iter()
                .filter(|(_, entry)| !entry.is_in_use() && entry.health == SessionHealth::Healthy)
                .map(|(id, entry)| (id.clone(), entry.session.clone()))
                .collect()
        };

        if candidates.is_empty() {
            return 0;
        }

        let probes = candidates.into_iter().map(|(id, shared)| async move {
            let healthy = match shared.clone().try_lock_owned() {
                Ok(mut client) => client.health_probe().await,
                // 正被使用，由实际命令流量检验
                Err(_) => true,
            };
            (id, shared, healthy)
        });
        let results = join_all(probes).await;

        let mut state = self.inner.state.lock().await;
        let mut unhealthy = 0;
        for (id, shared, healthy) in results {
            if healthy {
                continue;
            }
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            // 探测期间条目可能已被替换或重新租出
            if !Arc::ptr_eq(&entry.session, &shared) || entry.is_in_use() {
                continue;
            }
            entry.health = SessionHealth::Unhealthy;
            entry.is_connected = false;
            unhealthy += 1;
            let target = entry.target.clone();
            warn!(target_id = %id, "Health probe failed, scheduling reconnection");
            self.inner.schedule_reconnection(&mut state, target);
        }

        debug!(unhealthy, "Health check completed");
        unhealthy
    }

    /// 清理空闲超时的会话（无论健康与否），返回清理数量
    pub async fn cleanup_idle(&self) -> usize {
        let expired: Vec<(String, SharedSession)> = {
            let mut state = self.inner.state.lock().await;
            let max_idle = self.inner.config.max_idle_time;
            let now = Instant::now();

            let ids: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    !entry.is_in_use() && now.duration_since(entry.last_activity()) > max_idle
                })
                .map(|(id, _)| id.clone())
                .collect();

            let mut expired = Vec::with_capacity(ids.len());
            for id in ids {
                state.cancel_reconnection(&id);
                if let Some(entry) = state.entries.remove(&id) {
                    expired.push((id, entry.session));
                }
            }
            state.record_size();
            expired
        };

        let count = expired.len();
        for (id, session) in expired {
            info!(target_id = %id, "Removing idle session");
            metrics::counter!("ssh_pool_evictions_total").increment(1);
            shutdown_session(session).await;
        }
        count
    }

    /// 统计信息
    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        let total = state.entries.len();
        let healthy = state.entries.values().filter(|e| e.is_healthy()).count();
        let in_use = state.entries.values().filter(|e| e.is_in_use()).count();
        let total_uses: u64 = state.entries.values().map(|e| e.use_count).sum();

        let percent = |part: usize, whole: usize| {
            if whole == 0 {
                0.0
            } else {
                part as f64 / whole as f64 * 100.0
            }
        };

        PoolStats {
            total,
            healthy,
            in_use,
            idle: total - in_use,
            avg_use_count: if total == 0 {
                0.0
            } else {
                total_uses as f64 / total as f64
            },
            utilization: percent(in_use, self.inner.config.max_size),
            health_rate: percent(healthy, total),
        }
    }

    /// 目标的健康状态（未登记且未耗尽重连时为 None）
    pub async fn health(&self, target_id: &str) -> Option<SessionHealth> {
        let state = self.inner.state.lock().await;
        match state.entries.get(target_id) {
            Some(entry) => Some(entry.health),
            None if state.unrecoverable.contains(target_id) => Some(SessionHealth::Unrecoverable),
            None => None,
        }
    }

    /// 进行中的重连状态
    pub async fn reconnection(&self, target_id: &str) -> Option<ReconnectionAttempt> {
        let state = self.inner.state.lock().await;
        state.reconnections.get(target_id).map(|r| r.attempt.clone())
    }

    pub async fn contains(&self, target_id: &str) -> bool {
        self.inner.state.lock().await.entries.contains_key(target_id)
    }

    /// 断开全部会话并取消所有重连
    pub async fn shutdown(&self) {
        let sessions: Vec<SharedSession> = {
            let mut state = self.inner.state.lock().await;
            for (_, reconnection) in state.reconnections.drain() {
                reconnection.handle.abort();
            }
            let sessions = state.entries.drain().map(|(_, entry)| entry.session).collect();
            state.record_size();
            sessions
        };

        info!(sessions = sessions.len(), "Shutting down connection pool");
        for session in sessions {
            shutdown_session(session).await;
        }
    }
}

impl PoolInner {
    fn pending(&self) -> usize {
        self.pending_connects.load(Ordering::Acquire)
    }

    fn connect_lock(&self, target_id: &str) -> Arc<Mutex<()>> {
        self.connect_locks
            .entry(target_id.to_string())
            .or_default()
            .clone()
    }

    fn new_client(&self, target: &Target) -> SessionClient {
        SessionClient::new(
            target.clone(),
            self.factory.create(target),
            self.config.session.clone(),
        )
    }

    /// 启动新的重连任务，替换该目标已有的任务
    fn schedule_reconnection(self: &Arc<Self>, state: &mut PoolState, target: Target) {
        if self.config.reconnect.max_attempts == 0 {
            return;
        }

        state.cancel_reconnection(&target.id);
        state.next_generation += 1;
        let generation = state.next_generation;

        let target_id = target.id.clone();
        // 任务需先拿到状态锁才会读取登记信息，而调用方此刻持有该锁
        let handle = tokio::spawn(reconnect_loop(self.clone(), target, generation));
        state.reconnections.insert(
            target_id.clone(),
            ReconnectHandle {
                generation,
                handle,
                attempt: ReconnectionAttempt::new(target_id),
            },
        );
    }

    async fn record_attempt(&self, target_id: &str, generation: u64, attempt: u32, delay: Duration) -> bool {
        let mut state = self.state.lock().await;
        match state.reconnections.get_mut(target_id) {
            Some(r) if r.generation == generation => {
                r.attempt.attempt = attempt;
                r.attempt.delay_ms = delay.as_millis() as u64;
                true
            }
            _ => false,
        }
    }

    async fn record_error(&self, target_id: &str, generation: u64, error: &AppError) {
        let mut state = self.state.lock().await;
        if let Some(r) = state.reconnections.get_mut(target_id) {
            if r.generation == generation {
                r.attempt.last_error = Some(error.to_string());
            }
        }
    }

    async fn is_current(&self, target_id: &str, generation: u64) -> bool {
        self.state.lock().await.is_current(target_id, generation)
    }

    /// 将重连成功的会话装回池中
    async fn install_reconnected(&self, target: &Target, generation: u64, client: SessionClient) {
        let existing = {
            let mut state = self.state.lock().await;
            if !state.is_current(&target.id, generation) {
                drop(state);
                let mut client = client;
                client.disconnect().await;
                return;
            }

            let existing = state.entries.get(&target.id).map(|entry| entry.session.clone());
            match existing {
                Some(shared) => shared,
                None => {
                    self.register_reconnected(&mut state, target, client);
                    return;
                }
            }
        };

        {
            let shared = existing;
            // 原地替换，已发出的句柄随之可用
            let mut old = {
                let mut guard = shared.lock().await;
                std::mem::replace(&mut *guard, client)
            };
            old.disconnect().await;

            let mut state = self.state.lock().await;
            if state.is_current(&target.id, generation) {
                state.reconnections.remove(&target.id);
            }
            if let Some(entry) = state.entries.get_mut(&target.id) {
                if Arc::ptr_eq(&entry.session, &shared) {
                    entry.health = SessionHealth::Healthy;
                    entry.is_connected = true;
                }
            }
            info!(target_id = %target.id, "Session reconnected");
        }
    }

    /// 为未登记的目标登记重连成功的会话（容量不足时驱逐空闲会话或放弃）
    fn register_reconnected(&self, state: &mut PoolState, target: &Target, client: SessionClient) {
        state.reconnections.remove(&target.id);

        if state.entries.len() + self.pending() >= self.config.max_size {
            match state.lru_candidate() {
                Some(victim_id) => {
                    state.cancel_reconnection(&victim_id);
                    if let Some(entry) = state.entries.remove(&victim_id) {
                        info!(evicted = %victim_id, for_target = %target.id, "Evicting least recently used session");
                        metrics::counter!("ssh_pool_evictions_total").increment(1);
                        tokio::spawn(shutdown_session(entry.session));
                    }
                }
                None => {
                    warn!(target_id = %target.id, "Pool full, discarding reconnected session");
                    let mut client = client;
                    tokio::spawn(async move { client.disconnect().await });
                    return;
                }
            }
        }

        state
            .entries
            .insert(target.id.clone(), PooledSession::new(target.clone(), client));
        state.record_size();
        info!(target_id = %target.id, "Session reconnected and pooled");
    }

    async fn mark_unrecoverable(&self, target_id: &str, generation: u64, attempts: u32) {
        let mut state = self.state.lock().await;
        if !state.is_current(target_id, generation) {
            return;
        }
        state.reconnections.remove(target_id);

        match state.entries.get_mut(target_id) {
            Some(entry) => {
                entry.health = SessionHealth::Unrecoverable;
                entry.is_connected = false;
            }
            None => {
                state.unrecoverable.insert(target_id.to_string());
            }
        }

        let error = AppError::Unrecoverable {
            target_id: target_id.to_string(),
            attempts,
        };
        warn!(target_id = %target_id, error = %error, "Giving up on reconnection");
    }
}

async fn reconnect_loop(inner: Arc<PoolInner>, target: Target, generation: u64) {
    let policy = inner.config.reconnect.clone();

    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay(attempt);
        if !inner.record_attempt(&target.id, generation, attempt, delay).await {
            return;
        }

        debug!(
            target_id = %target.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Waiting before reconnection attempt"
        );
        tokio::time::sleep(delay).await;

        let connect_lock = inner.connect_lock(&target.id);
        let _serialized = connect_lock.lock().await;
        if !inner.is_current(&target.id, generation).await {
            return;
        }

        metrics::counter!("ssh_pool_reconnect_attempts_total").increment(1);
        let mut client = inner.new_client(&target);
        match client.establish().await {
            Ok(()) => {
                inner.install_reconnected(&target, generation, client).await;
                return;
            }
            Err(e) => {
                warn!(
                    target_id = %target.id,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Reconnection attempt failed"
                );
                inner.record_error(&target.id, generation, &e).await;
            }
        }
    }

    inner
        .mark_unrecoverable(&target.id, generation, policy.max_attempts)
        .await;
}

/// 断开会话；会话正被占用时在后台等待其释放后再断开
async fn shutdown_session(session: SharedSession) {
    match session.clone().try_lock_owned() {
        Ok(mut client) => client.disconnect().await,
        Err(_) => {
            tokio::spawn(async move {
                session.lock().await.disconnect().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_default_is_empty() {
        let stats = PoolStats::default();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.utilization, 0.0);
    }

    #[test]
    fn test_pool_config_defaults_within_recommended_ranges() {
        let config = PoolConfig::default();
        assert!((5..=10).contains(&config.max_size));
        assert!(config.max_idle_time >= Duration::from_secs(300));
        assert_eq!(config.reconnect.max_attempts, 3);
    }
}
