use thiserror::Error;

/// SDK 统一错误类型
#[derive(Debug, Error)]
pub enum FestvoteSDKError {
    // 远端数据源错误
    #[error("Network error: {0}")]
    Network(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Timeout: {0}")]
    Timeout(String),

    // 本地持久化错误
    #[error("Storage quota exceeded: {0}")]
    StorageQuota(String),
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    IO(String),

    // SDK 相关错误
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not initialized: {0}")]
    NotInitialized(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
    #[error("Authentication required")]
    AuthRequired,
    #[error("Config error: {0}")]
    Config(String),
    #[error("Other error: {0}")]
    Other(String),
}

/// 错误分类（对应同步层的四类处理策略）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 暂时性错误，等待重连后重试
    Network,
    /// 唯一约束冲突，优先保留远端记录
    Conflict,
    /// 目标已在服务端删除，丢弃本地乐观状态
    NotFound,
    /// 本地持久化失败，降级为仅在线模式
    StorageQuota,
    /// 其余错误（参数、配置、序列化等），不可重试
    Fatal,
}

impl FestvoteSDKError {
    /// 获取错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            FestvoteSDKError::Network(_) | FestvoteSDKError::Timeout(_) => ErrorKind::Network,
            FestvoteSDKError::Conflict(_) => ErrorKind::Conflict,
            FestvoteSDKError::NotFound(_) => ErrorKind::NotFound,
            FestvoteSDKError::StorageQuota(_) => ErrorKind::StorageQuota,
            _ => ErrorKind::Fatal,
        }
    }

    /// 是否可以在重连后重试
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Network
    }

    /// 根据 HTTP 状态码构造错误
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            404 => FestvoteSDKError::NotFound(body),
            409 => FestvoteSDKError::Conflict(body),
            // PostgREST 在唯一约束冲突时可能返回 400 + 23505
            400 if body.contains("23505") => FestvoteSDKError::Conflict(body),
            _ => FestvoteSDKError::Network(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<serde_json::Error> for FestvoteSDKError {
    fn from(error: serde_json::Error) -> Self {
        FestvoteSDKError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for FestvoteSDKError {
    fn from(error: std::io::Error) -> Self {
        FestvoteSDKError::IO(error.to_string())
    }
}

impl From<sled::Error> for FestvoteSDKError {
    fn from(error: sled::Error) -> Self {
        FestvoteSDKError::KvStore(error.to_string())
    }
}

impl From<reqwest::Error> for FestvoteSDKError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return FestvoteSDKError::Timeout(error.to_string());
        }
        match error.status() {
            Some(status) => FestvoteSDKError::from_status(status.as_u16(), error.to_string()),
            None => FestvoteSDKError::Network(error.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, FestvoteSDKError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(FestvoteSDKError::Network("down".into()).kind(), ErrorKind::Network);
        assert_eq!(FestvoteSDKError::Timeout("10s".into()).kind(), ErrorKind::Network);
        assert_eq!(FestvoteSDKError::Conflict("dup".into()).kind(), ErrorKind::Conflict);
        assert_eq!(FestvoteSDKError::NotFound("set".into()).kind(), ErrorKind::NotFound);
        assert_eq!(FestvoteSDKError::StorageQuota("full".into()).kind(), ErrorKind::StorageQuota);
        assert_eq!(FestvoteSDKError::AuthRequired.kind(), ErrorKind::Fatal);

        assert!(FestvoteSDKError::Timeout("10s".into()).is_retryable());
        assert!(!FestvoteSDKError::Conflict("dup".into()).is_retryable());
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(FestvoteSDKError::from_status(404, "gone"), FestvoteSDKError::NotFound(_)));
        assert!(matches!(FestvoteSDKError::from_status(409, "dup"), FestvoteSDKError::Conflict(_)));
        assert!(matches!(
            FestvoteSDKError::from_status(400, r#"{"code":"23505"}"#),
            FestvoteSDKError::Conflict(_)
        ));
        assert!(matches!(FestvoteSDKError::from_status(503, "busy"), FestvoteSDKError::Network(_)));
    }
}
