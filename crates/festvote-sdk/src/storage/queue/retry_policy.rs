use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::{ErrorKind, FestvoteSDKError};

/// 失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FailureReason {
    /// 网络超时 - 可重试
    NetworkTimeout,
    /// 网络不可用 - 等待恢复后重试
    NetworkUnavailable,
    /// 服务端错误 - 根据错误码决定
    ServerError(u16),
    /// 唯一约束冲突 - 由调用方解决，不重试
    Conflict,
    /// 目标不存在 - 不重试
    NotFound,
    /// 本地存储已满 - 不重试
    StorageQuota,
    /// 未知错误
    Unknown(String),
}

impl FailureReason {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureReason::NetworkTimeout => true,
            FailureReason::NetworkUnavailable => true,
            FailureReason::ServerError(code) => {
                // 5xx 服务端错误可重试，4xx 客户端错误不重试
                *code >= 500 && *code < 600
            }
            FailureReason::Conflict => false,
            FailureReason::NotFound => false,
            FailureReason::StorageQuota => false,
            FailureReason::Unknown(_) => true, // 保守策略：未知错误可重试
        }
    }

    /// 获取重试延迟倍数
    pub fn delay_multiplier(&self) -> f64 {
        match self {
            FailureReason::NetworkTimeout => 1.0,
            FailureReason::NetworkUnavailable => 2.0,
            FailureReason::ServerError(_) => 1.5,
            _ => 1.0,
        }
    }
}

/// 重试策略配置
///
/// 用于推送通道 `Error -> Connecting` 的重连退避。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数，0 表示不限
    pub max_retries: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 计算第 `retry_count` 次重试前的等待时间，不应再重试时返回 None
    pub fn next_delay(&self, retry_count: u32, failure_reason: &FailureReason) -> Option<Duration> {
        if !self.should_retry(retry_count, failure_reason) {
            return None;
        }

        // 基础延迟 = base_delay * (backoff_factor ^ retry_count)
        let base_delay = self.base_delay_ms as f64 * self.backoff_factor.powf(retry_count as f64);

        // 应用失败原因的延迟倍数
        let adjusted_delay = base_delay * failure_reason.delay_multiplier();

        // 限制最大延迟
        let capped_delay = adjusted_delay.min(self.max_delay_ms as f64);

        // 添加随机抖动
        let jitter = capped_delay * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (capped_delay + jitter).max(0.0);

        Some(Duration::from_millis(final_delay as u64))
    }

    /// 检查是否应该重试
    pub fn should_retry(&self, retry_count: u32, failure_reason: &FailureReason) -> bool {
        (self.max_retries == 0 || retry_count < self.max_retries) && failure_reason.is_retryable()
    }
}

/// 从错误转换为失败原因
impl From<&FestvoteSDKError> for FailureReason {
    fn from(error: &FestvoteSDKError) -> Self {
        match error {
            FestvoteSDKError::Timeout(_) => FailureReason::NetworkTimeout,
            FestvoteSDKError::Network(msg) => {
                match msg
                    .strip_prefix("HTTP ")
                    .and_then(|rest| rest.split(':').next())
                    .and_then(|code| code.trim().parse::<u16>().ok())
                {
                    Some(code) => FailureReason::ServerError(code),
                    None => FailureReason::NetworkUnavailable,
                }
            }
            other => match other.kind() {
                ErrorKind::Conflict => FailureReason::Conflict,
                ErrorKind::NotFound => FailureReason::NotFound,
                ErrorKind::StorageQuota => FailureReason::StorageQuota,
                _ => FailureReason::Unknown(other.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_retryable() {
        assert!(FailureReason::NetworkTimeout.is_retryable());
        assert!(FailureReason::NetworkUnavailable.is_retryable());
        assert!(FailureReason::ServerError(500).is_retryable());
        assert!(!FailureReason::ServerError(404).is_retryable());
        assert!(!FailureReason::Conflict.is_retryable());
        assert!(!FailureReason::NotFound.is_retryable());
        assert!(!FailureReason::StorageQuota.is_retryable());
    }

    #[test]
    fn test_next_delay_backoff_and_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 250,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
        };

        assert_eq!(policy.next_delay(0, &FailureReason::NetworkTimeout), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(1, &FailureReason::NetworkTimeout), Some(Duration::from_millis(200)));
        // 超过上限
        assert_eq!(policy.next_delay(2, &FailureReason::NetworkTimeout), Some(Duration::from_millis(250)));
        // 超过最大重试次数
        assert_eq!(policy.next_delay(3, &FailureReason::NetworkTimeout), None);
        // 不可重试的错误
        assert_eq!(policy.next_delay(0, &FailureReason::Conflict), None);
    }

    #[test]
    fn test_unlimited_retries() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1_000, &FailureReason::NetworkUnavailable));
    }

    #[test]
    fn test_from_error() {
        assert_eq!(
            FailureReason::from(&FestvoteSDKError::Timeout("10s".into())),
            FailureReason::NetworkTimeout
        );
        assert_eq!(
            FailureReason::from(&FestvoteSDKError::from_status(503, "busy")),
            FailureReason::ServerError(503)
        );
        assert_eq!(
            FailureReason::from(&FestvoteSDKError::Network("reset".into())),
            FailureReason::NetworkUnavailable
        );
        assert_eq!(
            FailureReason::from(&FestvoteSDKError::Conflict("dup".into())),
            FailureReason::Conflict
        );
    }
}
