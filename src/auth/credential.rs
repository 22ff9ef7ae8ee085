//! 凭证管理器（client-credentials 流程）
//!
//! 缓存会话令牌并负责续期。核心约束：无论多少并发调用方，同一时刻最多只有一个认证请求在途；
//! 令牌失效时后来的调用方等待同一个共享 future，而不是各自发起认证。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::Instrument;

use super::token::{now_epoch_ms, SessionToken, TokenResponse, DEFAULT_EXPIRY_SKEW_MS};
use crate::core::error::{AgentError, Result};

/// 令牌来源：请求层与连接管理器只依赖此 trait
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// 返回未过期的令牌，必要时认证
    async fn get_token(&self) -> Result<String>;

    /// 丢弃缓存并强制重新认证
    async fn refresh(&self) -> Result<String>;
}

/// 凭证管理器构造参数
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    /// 编排服务根地址，如 http://localhost:3000
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// 单次认证请求超时
    pub auth_timeout: Duration,
    /// 过期预留（毫秒）
    pub expiry_skew_ms: i64,
}

impl CredentialConfig {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_timeout: Duration::from_secs(30),
            expiry_skew_ms: DEFAULT_EXPIRY_SKEW_MS,
        }
    }
}

type AuthFuture = Shared<BoxFuture<'static, Result<SessionToken>>>;

struct InFlight {
    generation: u64,
    future: AuthFuture,
}

#[derive(Default)]
struct CredentialState {
    token: Option<SessionToken>,
    in_flight: Option<InFlight>,
    generation: u64,
}

/// 凭证管理器：持有令牌缓存与在途认证
pub struct CredentialManager {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    auth_timeout: Duration,
    expiry_skew_ms: i64,
    state: Mutex<CredentialState>,
    /// 累计发起的认证请求数
    auth_calls: AtomicU64,
    span: tracing::Span,
}

impl CredentialManager {
    /// 校验参数并构造；不做任何 I/O
    pub fn new(config: CredentialConfig) -> Result<Self> {
        let base_url = validate_base_url(&config.base_url)?;
        if config.client_id.trim().is_empty() {
            return Err(AgentError::Config("client_id is required".into()));
        }
        if config.client_secret.is_empty() {
            return Err(AgentError::Config("client_secret is required".into()));
        }

        let span = tracing::info_span!("credentials", client_id = %config.client_id);
        Ok(Self {
            http: reqwest::Client::new(),
            token_url: format!("{}/auth/token", base_url),
            client_id: config.client_id,
            client_secret: config.client_secret,
            auth_timeout: config.auth_timeout,
            expiry_skew_ms: config.expiry_skew_ms,
            state: Mutex::new(CredentialState::default()),
            auth_calls: AtomicU64::new(0),
            span,
        })
    }

    /// 指定日志 span（替代默认的 `credentials` span）
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// 返回未过期的令牌；缓存有效时不做 I/O
    pub async fn get_token(&self) -> Result<String> {
        let (generation, future) = {
            let mut state = self.lock_state();
            if let Some(token) = state.token.as_ref() {
                if token.is_valid_at(now_epoch_ms()) {
                    return Ok(token.access_token.clone());
                }
            }
            match state.in_flight.as_ref() {
                Some(in_flight) => (in_flight.generation, in_flight.future.clone()),
                None => {
                    state.generation += 1;
                    let generation = state.generation;
                    let future = self.authenticate().shared();
                    state.in_flight = Some(InFlight {
                        generation,
                        future: future.clone(),
                    });
                    self.auth_calls.fetch_add(1, Ordering::Relaxed);
                    (generation, future)
                }
            }
        };

        let result = future.await;

        let mut state = self.lock_state();
        // 只有本代在途请求仍挂着时才落缓存；期间 clear() 过则丢弃结果
        if state.in_flight.as_ref().map(|f| f.generation) == Some(generation) {
            state.in_flight = None;
            if let Ok(token) = &result {
                state.token = Some(token.clone());
            }
        }
        result.map(|token| token.access_token)
    }

    /// 丢弃缓存后按 get_token 流程重新认证（已有在途认证则复用）
    pub async fn refresh(&self) -> Result<String> {
        self.lock_state().token = None;
        self.span.in_scope(|| tracing::debug!("Forcing token refresh"));
        self.get_token().await
    }

    /// 丢弃缓存令牌与在途认证
    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.token = None;
        state.in_flight = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock_state()
            .token
            .as_ref()
            .map(|t| t.is_valid_at(now_epoch_ms()))
            .unwrap_or(false)
    }

    /// 累计认证请求数
    pub fn auth_call_count(&self) -> u64 {
        self.auth_calls.load(Ordering::Relaxed)
    }

    fn lock_state(&self) -> MutexGuard<'_, CredentialState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 构造一次认证请求；传输失败映射为 Connection/Timeout，由调用方决定是否重试
    fn authenticate(&self) -> BoxFuture<'static, Result<SessionToken>> {
        let http = self.http.clone();
        let url = self.token_url.clone();
        let body = serde_json::json!({
            "client_id": self.client_id,
            "client_secret": self.client_secret,
        });
        let timeout = self.auth_timeout;
        let skew = self.expiry_skew_ms;

        async move {
            tracing::info!("Authenticating with {}", url);
            let timeout_ms = timeout.as_millis() as u64;
            let exchange = async {
                let response = http.post(&url).json(&body).send().await?;
                let status = response.status();
                let text = response.text().await?;
                Ok::<_, reqwest::Error>((status, text))
            };
            let (status, text) = match tokio::time::timeout(timeout, exchange).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    tracing::warn!("Token request failed: {}", e);
                    return Err(AgentError::connection(format!("token request failed: {}", e)));
                }
                Err(_) => {
                    tracing::warn!("Token request timed out after {}ms", timeout_ms);
                    return Err(AgentError::timeout(timeout_ms, format!("POST {}", url)));
                }
            };

            if !status.is_success() {
                tracing::error!("Authentication failed: status {}", status.as_u16());
                let message = if text.trim().is_empty() {
                    format!("authentication rejected with status {}", status.as_u16())
                } else {
                    text
                };
                return Err(AgentError::Auth(message));
            }

            let parsed: TokenResponse = serde_json::from_str(&text)
                .map_err(|e| AgentError::Auth(format!("malformed token response: {}", e)))?;
            let token = SessionToken::from_response(parsed, now_epoch_ms(), skew)?;
            tracing::info!("Authentication successful, expires in {}s", token.expires_in_seconds);
            Ok(token)
        }
        .instrument(self.span.clone())
        .boxed()
    }
}

#[async_trait]
impl TokenSource for CredentialManager {
    async fn get_token(&self) -> Result<String> {
        CredentialManager::get_token(self).await
    }

    async fn refresh(&self) -> Result<String> {
        CredentialManager::refresh(self).await
    }
}

/// 校验根地址并去掉末尾 `/`
pub(crate) fn validate_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(AgentError::Config("base_url is required".into()));
    }
    let url = reqwest::Url::parse(trimmed)
        .map_err(|e| AgentError::Config(format!("invalid base_url '{}': {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AgentError::Config(format!(
            "base_url must be http(s), got '{}'",
            url.scheme()
        )));
    }
    Ok(trimmed.to_string())
}
