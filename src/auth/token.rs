//! 会话令牌
//!
//! 认证成功时整体创建，刷新时整体替换，从不原地修改。
//! 过期时间预留 skew，使令牌在服务端真正拒绝之前就被视为过期。

use serde::Deserialize;

use crate::core::error::{AgentError, Result};

/// 过期预留（毫秒）
pub const DEFAULT_EXPIRY_SKEW_MS: i64 = 60_000;

/// `POST /auth/token` 的成功响应
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default = "default_token_type", alias = "tokenType")]
    pub token_type: String,
    #[serde(alias = "expiresIn")]
    pub expires_in: i64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// 缓存的会话令牌
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_in_seconds: i64,
    /// = issued_at + expires_in * 1000 - skew
    pub expires_at_epoch_ms: i64,
}

impl SessionToken {
    /// `expires_in` 来自服务端，溢出 i64 毫秒范围视为格式错误
    pub fn from_response(response: TokenResponse, issued_at_ms: i64, skew_ms: i64) -> Result<Self> {
        let expires_at_epoch_ms = response
            .expires_in
            .checked_mul(1000)
            .and_then(|ms| issued_at_ms.checked_add(ms))
            .and_then(|at| at.checked_sub(skew_ms))
            .ok_or_else(|| {
                AgentError::Auth(format!(
                    "malformed token response: expires_in {} out of range",
                    response.expires_in
                ))
            })?;
        Ok(Self {
            expires_at_epoch_ms,
            access_token: response.access_token,
            token_type: response.token_type,
            expires_in_seconds: response.expires_in,
        })
    }

    /// `now < expires_at` 时有效
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_epoch_ms
    }
}

/// 当前 Unix 毫秒时间
pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
