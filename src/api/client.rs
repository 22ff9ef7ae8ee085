//! 弹性请求层
//!
//! 包装任意 `{method, path, body}` 调用：
//! - 每次尝试先从 TokenSource 取令牌，带 Bearer 头与超时发出
//! - 瞬时故障（超时、连接失败、可重试状态码）仅对幂等请求按退避重试
//! - 首次尝试遇到 401 时强制刷新令牌并额外重试一次，不占用重试预算；再次 401 直接返回 Auth 错误

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::Instrument;

use super::retry::{is_idempotent_method, RetryPolicy};
use crate::auth::credential::validate_base_url;
use crate::auth::TokenSource;
use crate::core::error::{AgentError, Result};

/// 单次调用选项
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// 首次 401 时是否刷新令牌后重试
    pub retry_on_401: bool,
    /// 单次尝试超时
    pub timeout: Duration,
    /// 覆盖按方法推断的幂等性
    pub idempotent: Option<bool>,
    /// 覆盖实例级重试策略
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            retry_on_401: true,
            timeout: Duration::from_millis(30_000),
            idempotent: None,
            retry_policy: None,
        }
    }
}

impl RequestOptions {
    pub fn retry_on_401(mut self, enabled: bool) -> Self {
        self.retry_on_401 = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// 单次尝试的结果：401 单独区分，交给外层决定是否刷新
enum Attempt {
    Success(Value),
    Unauthorized,
}

/// 编排服务 REST 客户端
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    policy: RetryPolicy,
    default_timeout: Duration,
    span: tracing::Span,
}

impl ApiClient {
    pub fn new(base_url: &str, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: validate_base_url(base_url)?,
            tokens,
            policy: RetryPolicy::default(),
            default_timeout: Duration::from_millis(30_000),
            span: tracing::info_span!("api"),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 未显式指定选项时的默认超时
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 默认选项（使用实例默认超时）
    pub fn default_options(&self) -> RequestOptions {
        RequestOptions::default().timeout(self.default_timeout)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self
            .request(Method::GET, path, None, self.default_options())
            .await?;
        decode(path, value)
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let value = self
            .request(Method::POST, path, Some(encode(body)?), self.default_options())
            .await?;
        decode(path, value)
    }

    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let value = self
            .request(Method::PUT, path, Some(encode(body)?), self.default_options())
            .await?;
        decode(path, value)
    }

    pub async fn patch<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let value = self
            .request(Method::PATCH, path, Some(encode(body)?), self.default_options())
            .await?;
        decode(path, value)
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self
            .request(Method::DELETE, path, None, self.default_options())
            .await?;
        decode(path, value)
    }

    /// 发出请求并应用重试 / 401 恢复策略；空响应体返回 `Value::Null`
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        let policy = options.retry_policy.as_ref().unwrap_or(&self.policy);
        let idempotent = options
            .idempotent
            .unwrap_or_else(|| is_idempotent_method(&method));
        let max_attempts = policy.max_attempts(idempotent);
        let endpoint = format!("{} {}", method, path);

        async {
            let mut attempt: u32 = 0;
            let mut refreshed = false;
            loop {
                match self
                    .attempt_once(&method, path, body.as_ref(), options.timeout)
                    .await
                {
                    Ok(Attempt::Success(value)) => return Ok(value),
                    Ok(Attempt::Unauthorized) => {
                        if options.retry_on_401 && attempt == 0 && !refreshed {
                            refreshed = true;
                            tracing::info!("{} returned 401, refreshing token", endpoint);
                            self.tokens.refresh().await?;
                            continue;
                        }
                        tracing::error!("{} unauthorized after token refresh", endpoint);
                        return Err(AgentError::Auth(format!("{} unauthorized", endpoint)));
                    }
                    Err(err) => {
                        attempt += 1;
                        if attempt < max_attempts && policy.should_retry(&err) {
                            let delay = policy.next_delay(attempt - 1);
                            tracing::warn!(
                                "{} failed (attempt {}/{}): {}; retrying in {}ms",
                                endpoint,
                                attempt,
                                max_attempts,
                                err,
                                delay.as_millis()
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        if attempt > 1 {
                            tracing::error!("{} failed after {} attempts: {}", endpoint, attempt, err);
                        }
                        return Err(err);
                    }
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    async fn attempt_once(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Attempt> {
        let token = self.tokens.get_token().await?;
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method.clone(), &url).bearer_auth(token);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let timeout_ms = timeout.as_millis() as u64;
        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };
        let (status, text) = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) if e.is_timeout() => {
                return Err(AgentError::timeout(timeout_ms, format!("{} {}", method, path)))
            }
            Ok(Err(e)) => {
                return Err(AgentError::connection(format!("{} {}: {}", method, path, e)))
            }
            Err(_) => return Err(AgentError::timeout(timeout_ms, format!("{} {}", method, path))),
        };

        if status == StatusCode::UNAUTHORIZED {
            return Ok(Attempt::Unauthorized);
        }
        if !status.is_success() {
            return Err(AgentError::Api {
                status: status.as_u16(),
                endpoint: path.to_string(),
                message: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Attempt::Success(Value::Null));
        }
        serde_json::from_str(&text)
            .map(Attempt::Success)
            .map_err(|e| AgentError::Decode(format!("{} {}: {}", method, path, e)))
    }
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<Value> {
    serde_json::to_value(body).map_err(|e| AgentError::Decode(format!("request body: {}", e)))
}

fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| AgentError::Decode(format!("{}: {}", path, e)))
}
