//! 弹性请求层：超时、幂等门控重试、401 透明重认证

pub mod client;
pub mod retry;

pub use client::{ApiClient, RequestOptions};
pub use retry::{exponential_backoff, is_idempotent_method, RetryPolicy};
