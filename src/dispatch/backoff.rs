//! 指数退避：延迟计算与等待分离
//!
//! delay(attempt) = min(base * 2^(attempt-1), max)，纯函数；
//! 实际等待交给 Sleeper，生产用 tokio::time::sleep，测试用 RecordingSleeper（只记录不等待）。

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

/// 有界重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
        .normalized()
    }

    /// 至少一次尝试；max 不小于 base
    pub fn normalized(self) -> Self {
        let max_attempts = self.max_attempts.max(1);
        let max_delay = if self.max_delay < self.base_delay {
            self.base_delay
        } else {
            self.max_delay
        };
        Self {
            max_attempts,
            base_delay: self.base_delay,
            max_delay,
        }
    }

    /// 第 attempt 次（从 1 开始）失败后的等待时长
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let factor = 1_u128 << shift;
        let delay_ms = self
            .base_delay
            .as_millis()
            .saturating_mul(factor)
            .min(self.max_delay.as_millis());
        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// 退避等待的挂起点
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// 真实等待（不阻塞其他任务）
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// 测试用：记录每次请求的等待时长，立即返回
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, delay: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(delay);
        }
    }
}
