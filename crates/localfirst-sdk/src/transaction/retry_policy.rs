use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 退避方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// delay * attempt
    Linear,
    /// delay * 2^(attempt-1)
    #[default]
    Exponential,
}

/// 单个步骤的重试配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最多尝试次数（包含第一次），1 表示不重试
    pub max_attempts: u32,
    /// 基础延迟（毫秒）
    pub delay_ms: u64,
    pub backoff: Backoff,
    /// 延迟上限（毫秒）
    pub max_delay_ms: Option<u64>,
    /// 随机抖动因子 (0.0-1.0)，默认不抖动
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            backoff: Backoff::Exponential,
            max_delay_ms: None,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, delay_ms: u64, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay_ms,
            backoff,
            ..Default::default()
        }
    }

    pub fn linear(max_attempts: u32, delay_ms: u64) -> Self {
        Self::new(max_attempts, delay_ms, Backoff::Linear)
    }

    pub fn exponential(max_attempts: u32, delay_ms: u64) -> Self {
        Self::new(max_attempts, delay_ms, Backoff::Exponential)
    }

    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// 第 `attempt` 次失败后（从 1 开始）等待的时长
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = match self.backoff {
            Backoff::Linear => self.delay_ms.saturating_mul(attempt as u64),
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.delay_ms.saturating_mul(factor)
            }
        };

        let capped = match self.max_delay_ms {
            Some(max) => base.min(max),
            None => base,
        };

        if self.jitter_factor <= 0.0 {
            return Duration::from_millis(capped);
        }

        let capped = capped as f64;
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// 已尝试 `attempt` 次后是否还能再试
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
