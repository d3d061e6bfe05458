//! 重试策略 - 冲刷失败的分类与退避
//!
//! 失败分两类：瞬态（网络/超时/5xx，退避后重试）与终态（远端校验
//! 拒绝，重试只会原样再被拒，立刻标记失败离队）。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::MedisyncSDKError;

/// 冲刷失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FlushFailureReason {
    /// 网络超时 - 可重试
    NetworkTimeout,
    /// 网络不可用 - 等待恢复后重试
    NetworkUnavailable,
    /// 服务端错误 - 5xx 可重试，4xx 不重试
    ServerError(u16),
    /// 远端校验拒绝 - 不重试（重试只会卡死队列）
    ValidationRejected,
    /// 未知错误
    Unknown(String),
}

impl FlushFailureReason {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            FlushFailureReason::NetworkTimeout => true,
            FlushFailureReason::NetworkUnavailable => true,
            FlushFailureReason::ServerError(code) => *code >= 500 && *code < 600,
            FlushFailureReason::ValidationRejected => false,
            FlushFailureReason::Unknown(_) => true, // 保守策略：未知错误可重试
        }
    }
}

impl From<&MedisyncSDKError> for FlushFailureReason {
    fn from(error: &MedisyncSDKError) -> Self {
        match error {
            MedisyncSDKError::Network(msg) => {
                if msg.contains("timeout") {
                    FlushFailureReason::NetworkTimeout
                } else {
                    FlushFailureReason::NetworkUnavailable
                }
            }
            MedisyncSDKError::Validation(_) => FlushFailureReason::ValidationRejected,
            other => FlushFailureReason::Unknown(other.to_string()),
        }
    }
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大尝试次数（达到后标记终态失败）
    pub max_attempts: u32,
    /// 基础延迟时间（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟时间（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000, // 5分钟
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 是否还有重试额度
    pub fn should_retry(&self, attempts: u32, reason: &FlushFailureReason) -> bool {
        attempts < self.max_attempts && reason.is_retryable()
    }

    /// 第 n 次失败后的退避时长
    ///
    /// 基础延迟 = base_delay * (backoff_factor ^ (attempts - 1))，
    /// 封顶后叠加 ±jitter_factor/2 的随机抖动，避免所有操作同时重试。
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let base = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent as i32);
        let capped = base.min(self.max_delay_ms as f64);
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (capped + jitter).max(0.0);
        Duration::from_millis(final_delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_retryable() {
        assert!(FlushFailureReason::NetworkTimeout.is_retryable());
        assert!(FlushFailureReason::NetworkUnavailable.is_retryable());
        assert!(FlushFailureReason::ServerError(500).is_retryable());
        assert!(!FlushFailureReason::ServerError(404).is_retryable());
        assert!(!FlushFailureReason::ValidationRejected.is_retryable());
        assert!(FlushFailureReason::Unknown("?".to_string()).is_retryable());
    }

    #[test]
    fn test_from_error_classification() {
        let timeout = MedisyncSDKError::Network("timeout: deadline exceeded".to_string());
        assert_eq!(
            FlushFailureReason::from(&timeout),
            FlushFailureReason::NetworkTimeout
        );
        let refused = MedisyncSDKError::Network("connection refused".to_string());
        assert_eq!(
            FlushFailureReason::from(&refused),
            FlushFailureReason::NetworkUnavailable
        );
        let rejected = MedisyncSDKError::Validation("missing field".to_string());
        assert_eq!(
            FlushFailureReason::from(&rejected),
            FlushFailureReason::ValidationRejected
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        let first = policy.backoff_delay(1);
        let second = policy.backoff_delay(2);
        let huge = policy.backoff_delay(30);
        assert_eq!(first.as_millis(), 1_000);
        assert_eq!(second.as_millis(), 2_000);
        assert_eq!(huge.as_millis(), policy.max_delay_ms as u128);
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(4, &FlushFailureReason::NetworkTimeout));
        assert!(!policy.should_retry(5, &FlushFailureReason::NetworkTimeout));
        assert!(!policy.should_retry(0, &FlushFailureReason::ValidationRejected));
    }
}
