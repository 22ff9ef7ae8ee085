//! 认证层：会话令牌与凭证管理（client-credentials + 刷新去重）

pub mod credential;
pub mod token;

pub use credential::{CredentialConfig, CredentialManager, TokenSource};
pub use token::{SessionToken, TokenResponse, DEFAULT_EXPIRY_SKEW_MS};
