//! 重试策略：幂等门控、带抖动的指数退避、按错误值判定是否重试

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use reqwest::Method;

use crate::core::error::{AgentError, DEFAULT_RETRYABLE_STATUSES};

/// 重试策略（每个请求层实例不可变，可按调用覆盖）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 幂等请求的最大重试次数（总尝试次数 = max_retries + 1）
    pub max_retries: u32,
    pub base_delay: Duration,
    /// 单次退避上限
    pub max_delay: Duration,
    /// 随机抖动上界
    pub jitter: Duration,
    /// 视为瞬时故障的状态码
    pub retryable_statuses: HashSet<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: Duration::from_millis(1000),
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_statuses = statuses.into_iter().collect();
        self
    }

    /// 幂等请求的最大尝试次数；非幂等请求只尝试一次
    pub fn max_attempts(&self, idempotent: bool) -> u32 {
        if idempotent {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    /// 错误是否属于本策略下的瞬时故障
    pub fn should_retry(&self, err: &AgentError) -> bool {
        match err {
            AgentError::Timeout { .. } | AgentError::Connection { .. } => true,
            AgentError::Api { status, .. } => self.retryable_statuses.contains(status),
            _ => false,
        }
    }

    /// 第 `attempt` 次（从 0 计）失败后的等待时间，抖动由调用方给定
    pub fn backoff_delay(&self, attempt: u32, jitter_ms: u64) -> Duration {
        exponential_backoff(
            self.base_delay.as_millis() as u64,
            attempt,
            jitter_ms,
            self.max_delay.as_millis() as u64,
        )
    }

    /// 第 `attempt` 次失败后的等待时间（随机抖动）
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.backoff_delay(attempt, random_jitter_ms(self.jitter))
    }
}

/// min(base * 2^exponent + jitter, cap)
pub fn exponential_backoff(base_ms: u64, exponent: u32, jitter_ms: u64, cap_ms: u64) -> Duration {
    let factor = 2u64.checked_pow(exponent).unwrap_or(u64::MAX);
    let delay = base_ms.saturating_mul(factor).saturating_add(jitter_ms);
    Duration::from_millis(delay.min(cap_ms))
}

/// [0, upper] 内的随机毫秒数
pub fn random_jitter_ms(upper: Duration) -> u64 {
    let upper = upper.as_millis() as u64;
    if upper == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=upper)
    }
}

/// 读 / 更新 / 删除类方法默认幂等；创建类（POST）默认不重试，避免重复副作用
pub fn is_idempotent_method(method: &Method) -> bool {
    !matches!(*method, Method::POST | Method::CONNECT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(true), 4);
        assert_eq!(policy.max_attempts(false), 1);
        assert!(policy.retryable_statuses.contains(&503));
        assert!(!policy.retryable_statuses.contains(&500));
    }

    #[test]
    fn test_backoff_delay_within_window() {
        let policy = RetryPolicy::default();
        for attempt in 0..4u32 {
            let floor = 1000 * 2u64.pow(attempt);
            for _ in 0..20 {
                let delay = policy.next_delay(attempt).as_millis() as u64;
                assert!(delay >= floor, "attempt {} delay {} < {}", attempt, delay, floor);
                assert!(delay <= floor + 1000, "attempt {} delay {} too large", attempt, delay);
            }
        }
    }

    #[test]
    fn test_backoff_delay_capped() {
        let policy = RetryPolicy::default().with_max_delay(Duration::from_millis(5000));
        assert_eq!(policy.backoff_delay(10, 999), Duration::from_millis(5000));
        assert_eq!(policy.backoff_delay(63, 0), Duration::from_millis(5000));
        assert_eq!(policy.backoff_delay(200, 0), Duration::from_millis(5000));
    }

    #[test]
    fn test_should_retry_uses_policy_statuses() {
        let policy = RetryPolicy::default().with_retryable_statuses([500]);
        let api = |status| AgentError::Api {
            status,
            endpoint: "/x".into(),
            message: String::new(),
        };
        assert!(policy.should_retry(&api(500)));
        assert!(!policy.should_retry(&api(503)));
        assert!(policy.should_retry(&AgentError::timeout(10, "x")));
        assert!(!policy.should_retry(&AgentError::Auth("x".into())));
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(is_idempotent_method(&Method::GET));
        assert!(is_idempotent_method(&Method::PUT));
        assert!(is_idempotent_method(&Method::PATCH));
        assert!(is_idempotent_method(&Method::DELETE));
        assert!(!is_idempotent_method(&Method::POST));
    }
}
