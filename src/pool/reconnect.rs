//! 重连退避策略

use serde::Serialize;
use std::time::Duration;

/// 指数退避重连策略
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 第一次尝试前的延迟
    pub base_delay: Duration,
    /// 退避倍数
    pub multiplier: f64,
    /// 延迟上限
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// 第 `attempt` 次尝试（从 1 开始）前的延迟：
    /// `min(base_delay * multiplier^(attempt-1), max_delay)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// 所有自动尝试的延迟序列
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts).map(|attempt| self.delay(attempt)).collect()
    }
}

/// 单个目标进行中的重连状态
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectionAttempt {
    pub target_id: String,
    /// 当前尝试序号（1..=max_attempts）
    pub attempt: u32,
    /// 本次尝试前的延迟（毫秒）
    pub delay_ms: u64,
    pub last_error: Option<String>,
}

impl ReconnectionAttempt {
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            attempt: 0,
            delay_ms: 0,
            last_error: None,
        }
    }
}
