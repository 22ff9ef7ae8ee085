//! 接入层错误类型
//!
//! 所有组件统一返回 AgentError；调用方按 `code()` 区分种类（而非字符串匹配），
//! 按 `is_retryable()` 决定是否重试。错误细节以字符串保存，使错误可 Clone，
//! 以便同一次认证失败分发给所有等待中的调用方。

use std::fmt;

use thiserror::Error;

/// 默认视为瞬时故障的 HTTP 状态码（网关类 5xx）
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 3] = [502, 503, 504];

/// 接入层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// 凭证错误，或强制刷新一次后仍未授权
    #[error("Auth error: {0}")]
    Auth(String),

    /// 非成功状态码
    #[error("API error {status} on {endpoint}: {message}")]
    Api {
        status: u16,
        endpoint: String,
        message: String,
    },

    /// 传输层建立失败或异常关闭
    #[error("Connection error: {reason}")]
    Connection { reason: String },

    /// 超时（与服务端失败区分）
    #[error("Timeout after {timeout_ms}ms: {target}")]
    Timeout { timeout_ms: u64, target: String },

    /// 构造参数缺失或非法
    #[error("Config error: {0}")]
    Config(String),

    /// 响应体或事件载荷无法解析
    #[error("Decode error: {0}")]
    Decode(String),

    /// 本地文件系统错误（身份锁注册表）
    #[error("IO error: {0}")]
    Io(String),
}

/// 可枚举的错误码，供调用方做分支判断
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Auth,
    Api,
    Connection,
    Timeout,
    Config,
    Decode,
    Io,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Auth => "auth",
            ErrorCode::Api => "api",
            ErrorCode::Connection => "connection",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Config => "config",
            ErrorCode::Decode => "decode",
            ErrorCode::Io => "io",
        };
        write!(f, "{}", s)
    }
}

impl AgentError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AgentError::Auth(_) => ErrorCode::Auth,
            AgentError::Api { .. } => ErrorCode::Api,
            AgentError::Connection { .. } => ErrorCode::Connection,
            AgentError::Timeout { .. } => ErrorCode::Timeout,
            AgentError::Config(_) => ErrorCode::Config,
            AgentError::Decode(_) => ErrorCode::Decode,
            AgentError::Io(_) => ErrorCode::Io,
        }
    }

    /// 是否为瞬时故障（超时、连接失败、网关类 5xx）
    ///
    /// 具体请求的重试判断以 `RetryPolicy::should_retry` 为准，它会使用策略自己的状态码集合。
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Timeout { .. } | AgentError::Connection { .. } => true,
            AgentError::Api { status, .. } => DEFAULT_RETRYABLE_STATUSES.contains(status),
            _ => false,
        }
    }

    /// API 错误的状态码
    pub fn status(&self) -> Option<u16> {
        match self {
            AgentError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn connection(reason: impl Into<String>) -> Self {
        AgentError::Connection {
            reason: reason.into(),
        }
    }

    pub fn timeout(timeout_ms: u64, target: impl Into<String>) -> Self {
        AgentError::Timeout {
            timeout_ms,
            target: target.into(),
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct() {
        let errors = [
            AgentError::Auth("bad secret".into()),
            AgentError::Api {
                status: 404,
                endpoint: "/tasks".into(),
                message: "not found".into(),
            },
            AgentError::connection("reset"),
            AgentError::timeout(30000, "GET /tasks"),
            AgentError::Config("missing client_id".into()),
        ];
        let codes: std::collections::HashSet<_> = errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(AgentError::timeout(100, "x").is_retryable());
        assert!(AgentError::connection("refused").is_retryable());
        let unavailable = AgentError::Api {
            status: 503,
            endpoint: "/x".into(),
            message: String::new(),
        };
        assert!(unavailable.is_retryable());
        assert_eq!(unavailable.status(), Some(503));
        let bad_request = AgentError::Api {
            status: 400,
            endpoint: "/x".into(),
            message: String::new(),
        };
        assert!(!bad_request.is_retryable());
        assert!(!AgentError::Auth("nope".into()).is_retryable());
        assert!(!AgentError::Config("nope".into()).is_retryable());
    }

    #[test]
    fn test_error_display_carries_context() {
        let err = AgentError::timeout(250, "POST /auth/token");
        assert_eq!(err.to_string(), "Timeout after 250ms: POST /auth/token");
        assert_eq!(err.code().to_string(), "timeout");
    }
}
