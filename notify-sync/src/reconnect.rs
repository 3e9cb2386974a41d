//! 重连策略
//!
//! 控制器本身从不自动重连，由上层按断开原因决定是否、多久之后重试。

use notify_socket::DisconnectContext;
use rand::Rng;
use std::time::Duration;

pub trait ReconnectPolicy: Send + 'static {
    /// 下一次重连前的等待时间，None 表示放弃
    fn next_delay(&mut self, context: &DisconnectContext) -> Option<Duration>;

    /// 授权成功后调用，重新从第一次开始计数
    fn reset(&mut self);
}

/// 指数退避参数
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// 抖动比例，0.2 表示 ±20%
    pub jitter: f64,
    /// None 表示不限次数
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

/// 带抖动的指数退避，只对可重试的断开生效
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// 已经给出的重试次数
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn base_delay(&self) -> Duration {
        let exponent = self.attempt.min(i32::MAX as u32) as i32;
        let secs = self.config.initial.as_secs_f64() * self.config.multiplier.powi(exponent);
        // NaN.min(x) 返回 x
        let secs = secs.min(self.config.max.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.config.max)
    }

    fn jittered(&self, base: Duration) -> Duration {
        let jitter = self.config.jitter;
        if !jitter.is_finite() || jitter <= 0.0 {
            return base;
        }
        let jitter = jitter.min(1.0);
        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
        base.mul_f64(factor).min(self.config.max)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&mut self, context: &DisconnectContext) -> Option<Duration> {
        if !context.is_retryable() {
            return None;
        }
        if let Some(max) = self.config.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let delay = self.jittered(self.base_delay());
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// 从不重连
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReconnect;

impl ReconnectPolicy for NoReconnect {
    fn next_delay(&mut self, _context: &DisconnectContext) -> Option<Duration> {
        None
    }

    fn reset(&mut self) {}
}
