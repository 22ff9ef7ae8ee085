//! 持久连接管理器
//!
//! 显式状态机：disconnected → connecting → connected，异常断开后进入 reconnecting，
//! 由唯一一个可取消的重连定时器驱动下一次 connect。
//!
//! 每次 connect / disconnect 都会递增 epoch；读循环、定时器只在 epoch 未变时才生效，
//! 因此显式 `disconnect()` 之后不会再有任何重连触发。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::dispatch::{EventDispatcher, SubscriptionId};
use super::message::{
    AgentReadyPayload, AgentStatus, ConnectedPayload, ContextUpdatePayload, EventEnvelope,
    EventType, HeartbeatPayload, StatusUpdatePayload, TaskAssignedPayload, ToolRequestPayload,
    ToolResultPayload, WakeUpPayload,
};
use super::transport::{Transport, TransportEvent, TransportLink};
use crate::api::retry::{exponential_backoff, random_jitter_ms};
use crate::auth::TokenSource;
use crate::core::error::{AgentError, Result};

/// 连接状态；只能经由管理器内部的状态转换改变
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        write!(f, "{}", s)
    }
}

/// 连接管理器配置
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// 异常断开后是否自动重连
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_base: Duration,
    /// 重连间隔上限
    pub reconnect_max: Duration,
    pub reconnect_jitter: Duration,
    /// 连接超时守卫（应短于传输层握手超时）
    pub connect_timeout: Duration,
    /// agent_ready 中声明的能力
    pub capabilities: Vec<String>,
    pub version: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_base: Duration::from_millis(1000),
            reconnect_max: Duration::from_millis(30_000),
            reconnect_jitter: Duration::from_millis(1000),
            connect_timeout: Duration::from_millis(10_000),
            capabilities: Vec::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ConnectionConfig {
    /// 第 `attempt` 次（从 1 计）重连前的等待：min(base * 2^(attempt-1) + jitter, max)
    pub fn reconnect_delay(&self, attempt: u32, jitter_ms: u64) -> Duration {
        exponential_backoff(
            self.reconnect_base.as_millis() as u64,
            attempt.saturating_sub(1),
            jitter_ms,
            self.reconnect_max.as_millis() as u64,
        )
    }
}

/// connect 的发起方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectOrigin {
    Caller,
    /// 重连定时器，携带调度时的 epoch
    Timer { epoch: u64 },
}

#[derive(Default)]
struct Slot {
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<EventEnvelope>>,
    reader: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    reconnect_attempts: u32,
}

struct Inner {
    config: ConnectionConfig,
    tokens: Arc<dyn TokenSource>,
    transport: Arc<dyn Transport>,
    dispatcher: EventDispatcher,
    state_tx: watch::Sender<ConnectionState>,
    slot: Mutex<Slot>,
    pending_tools: Mutex<HashMap<String, oneshot::Sender<ToolResultPayload>>>,
    agent_id: Mutex<Option<String>>,
    span: tracing::Span,
}

/// 持久连接管理器
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        tokens: Arc<dyn TokenSource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                tokens,
                transport,
                dispatcher: EventDispatcher::new(),
                state_tx,
                slot: Mutex::new(Slot::default()),
                pending_tools: Mutex::new(HashMap::new()),
                agent_id: Mutex::new(None),
                span: tracing::info_span!("connection"),
            }),
        }
    }

    /// 指定日志 span；需在 connect 之前调用
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.span = span;
        }
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// 只读的状态订阅
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// 服务端在 connected 事件中分配的 Agent ID
    pub fn agent_id(&self) -> Option<String> {
        lock(&self.inner.agent_id).clone()
    }

    /// 当前连续重连次数
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.slot().reconnect_attempts
    }

    /// 建立连接；失败时返回错误，由调用方决定是否重试
    pub async fn connect(&self) -> Result<()> {
        Arc::clone(&self.inner).connect(ConnectOrigin::Caller).await
    }

    /// 显式断开：取消挂起的重连定时器、拆除传输，进入 disconnected
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// 等待状态落在 disconnected
    pub async fn wait_until_disconnected(&self) {
        let mut rx = self.watch_state();
        let _ = rx.wait_for(|s| *s == ConnectionState::Disconnected).await;
    }

    pub fn subscribe<F, Fut>(&self, event_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.dispatcher.subscribe(event_type, handler)
    }

    pub fn subscribe_all<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.dispatcher.subscribe_all(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.dispatcher.unsubscribe(id)
    }

    /// 订阅并把 payload 解析为强类型；解析失败计为处理器错误
    pub fn subscribe_typed<P, F, Fut>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner
            .dispatcher
            .subscribe(event_type.as_str(), move |env: EventEnvelope| -> BoxFuture<'static, anyhow::Result<()>> {
                match env.payload_as::<P>() {
                    Ok(payload) => handler(payload).boxed(),
                    Err(e) => future::ready(Err(anyhow::Error::new(e))).boxed(),
                }
            })
    }

    pub fn on_task_assigned<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(TaskAssignedPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_typed(EventType::TaskAssigned, handler)
    }

    pub fn on_context_update<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(ContextUpdatePayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_typed(EventType::ContextUpdate, handler)
    }

    pub fn on_wake_up<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(WakeUpPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_typed(EventType::WakeUp, handler)
    }

    pub fn on_tool_result<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(ToolResultPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_typed(EventType::ToolResult, handler)
    }

    /// 发送任意事件；未连接时返回 Connection 错误
    pub fn emit(&self, envelope: EventEnvelope) -> Result<()> {
        self.inner.send(envelope)
    }

    pub fn update_status(
        &self,
        status: AgentStatus,
        task_id: Option<String>,
        message: Option<String>,
    ) -> Result<()> {
        let payload = StatusUpdatePayload {
            status,
            task_id,
            message,
        };
        self.emit(EventEnvelope::typed(EventType::StatusUpdate, &payload)?)?;
        tracing::debug!(parent: &self.inner.span, "Status updated: {:?}", status);
        Ok(())
    }

    pub fn send_heartbeat(&self) -> Result<()> {
        self.emit(EventEnvelope::typed(EventType::Heartbeat, &HeartbeatPayload::ping())?)
    }

    /// 请求服务端执行工具并等待对应的 tool_result；超时或断线返回失败结果而非错误
    pub async fn request_tool(
        &self,
        tool: &str,
        action: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolResultPayload> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let payload = ToolRequestPayload {
            request_id: request_id.clone(),
            tool: tool.to_string(),
            action: action.to_string(),
            params,
        };
        let envelope = EventEnvelope::typed(EventType::ToolRequest, &payload)?;

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending_tools).insert(request_id.clone(), tx);
        if let Err(e) = self.emit(envelope) {
            lock(&self.inner.pending_tools).remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Ok(ToolResultPayload::failure(
                request_id,
                "Connection lost before tool result",
            )),
            Err(_) => {
                lock(&self.inner.pending_tools).remove(&request_id);
                Ok(ToolResultPayload::failure(request_id, "Tool request timed out"))
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // 后台任务持有 Inner 的 Arc；最后一个句柄释放时显式拆除
        self.inner.disconnect();
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        lock(&self.slot)
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// 唯一的状态写入点；调用方须持有 slot 锁
    fn transition(&self, _slot: &mut Slot, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            tracing::debug!(parent: &self.span, "Connection state {} -> {}", prev, next);
        }
    }

    fn connect(self: Arc<Self>, origin: ConnectOrigin) -> BoxFuture<'static, Result<()>> {
        let span = self.span.clone();
        async move {
            let epoch = {
                let mut slot = self.slot();
                if let ConnectOrigin::Timer { epoch } = origin {
                    if slot.epoch != epoch {
                        return Err(AgentError::connection("reconnect cancelled"));
                    }
                    // 定时器即当前任务，只解除关联不 abort
                    slot.reconnect_timer = None;
                }
                match self.state() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Connecting => {
                        return Err(AgentError::connection("connection attempt already in progress"))
                    }
                    ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
                }
                if let Some(timer) = slot.reconnect_timer.take() {
                    timer.abort();
                }
                slot.epoch += 1;
                self.transition(&mut slot, ConnectionState::Connecting);
                slot.epoch
            };

            tracing::info!("Connecting (origin: {:?})", origin);
            match self.establish().await {
                Ok(link) => self.on_established(epoch, link),
                Err(err) => {
                    tracing::error!("Connection attempt failed: {}", err);
                    let is_current = {
                        let mut slot = self.slot();
                        let is_current = slot.epoch == epoch;
                        if is_current && origin == ConnectOrigin::Caller {
                            self.transition(&mut slot, ConnectionState::Disconnected);
                        }
                        is_current
                    };
                    if is_current && origin != ConnectOrigin::Caller {
                        self.handle_disconnect(epoch, err.to_string());
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .boxed()
    }

    /// 取令牌并在连接超时守卫内打开传输
    async fn establish(&self) -> Result<TransportLink> {
        let token = self.tokens.get_token().await?;
        let timeout_ms = self.config.connect_timeout.as_millis() as u64;
        match tokio::time::timeout(self.config.connect_timeout, self.transport.open(&token)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::connection(format!(
                "connect timed out after {}ms",
                timeout_ms
            ))),
        }
    }

    fn on_established(self: &Arc<Self>, epoch: u64, link: TransportLink) -> Result<()> {
        let TransportLink { outbound, inbound } = link;
        {
            let mut slot = self.slot();
            if slot.epoch != epoch {
                // connect 期间被 disconnect；丢弃 link 即关闭
                return Err(AgentError::connection("connection attempt cancelled by disconnect"));
            }
            slot.outbound = Some(outbound);
            slot.reconnect_attempts = 0;
            slot.reader = Some(tokio::spawn(Arc::clone(self).read_loop(epoch, inbound)));
            self.transition(&mut slot, ConnectionState::Connected);
        }
        tracing::info!("Connected");

        let ready = AgentReadyPayload {
            capabilities: self.config.capabilities.clone(),
            version: self.config.version.clone(),
        };
        let sent = EventEnvelope::typed(EventType::AgentReady, &ready).and_then(|env| self.send(env));
        if let Err(e) = sent {
            tracing::warn!("Failed to send agent_ready: {}", e);
        }
        Ok(())
    }

    /// 逐条处理入站事件：上一条的全部处理器完成后才处理下一条
    fn read_loop(
        self: Arc<Self>,
        epoch: u64,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> BoxFuture<'static, ()> {
        let span = self.span.clone();
        async move {
            let reason = loop {
                match inbound.recv().await {
                    Some(TransportEvent::Message(envelope)) => self.handle_inbound(envelope).await,
                    Some(TransportEvent::Closed(reason)) => break reason,
                    None => break "transport closed".to_string(),
                }
            };
            self.handle_disconnect(epoch, reason);
        }
        .instrument(span)
        .boxed()
    }

    async fn handle_inbound(&self, envelope: EventEnvelope) {
        if envelope.is(EventType::Heartbeat) {
            let is_pong = envelope
                .payload_as::<HeartbeatPayload>()
                .map(|hb| hb.pong.unwrap_or(false))
                .unwrap_or(false);
            if !is_pong {
                let pong = EventEnvelope::typed(EventType::Heartbeat, &HeartbeatPayload::pong())
                    .and_then(|env| self.send(env));
                if let Err(e) = pong {
                    tracing::debug!("Failed to answer heartbeat: {}", e);
                }
            }
            // 心跳只交给显式订阅 heartbeat 的处理器
            self.dispatcher.dispatch_typed(&envelope).await;
            return;
        }

        if envelope.is(EventType::Connected) {
            match envelope.payload_as::<ConnectedPayload>() {
                Ok(ack) => {
                    tracing::info!("Server acknowledged connection, agent_id={}", ack.agent_id);
                    *lock(&self.agent_id) = Some(ack.agent_id);
                }
                Err(e) => tracing::warn!("Malformed connected event: {}", e),
            }
        } else if envelope.is(EventType::ToolResult) {
            if let Ok(result) = envelope.payload_as::<ToolResultPayload>() {
                let waiter = lock(&self.pending_tools).remove(&result.request_id);
                if let Some(tx) = waiter {
                    let _ = tx.send(result);
                }
            }
        }

        let report = self.dispatcher.dispatch(&envelope).await;
        if report.failed > 0 {
            tracing::warn!(
                "{} of {} handlers failed for '{}'",
                report.failed,
                report.invoked,
                envelope.event_type
            );
        }
    }

    /// 非显式断开：按重连预算调度定时器，否则落到 disconnected
    fn handle_disconnect(self: &Arc<Self>, epoch: u64, reason: String) {
        let mut slot = self.slot();
        if slot.epoch != epoch {
            return;
        }
        slot.outbound = None;
        // 可能就是当前读循环，只解除关联
        slot.reader = None;
        self.drop_pending_tools();

        if self.config.auto_reconnect && slot.reconnect_attempts < self.config.max_reconnect_attempts {
            slot.reconnect_attempts += 1;
            let attempt = slot.reconnect_attempts;
            let delay = self
                .config
                .reconnect_delay(attempt, random_jitter_ms(self.config.reconnect_jitter));
            tracing::warn!(
                parent: &self.span,
                "Disconnected ({}); reconnecting in {}ms (attempt {}/{})",
                reason,
                delay.as_millis(),
                attempt,
                self.config.max_reconnect_attempts
            );
            self.transition(&mut slot, ConnectionState::Reconnecting);
            let timer = Arc::clone(self).reconnect_after(epoch, delay);
            slot.reconnect_timer = Some(tokio::spawn(timer));
        } else {
            tracing::warn!(parent: &self.span, "Disconnected ({}); not reconnecting", reason);
            self.transition(&mut slot, ConnectionState::Disconnected);
        }
    }

    fn reconnect_after(self: Arc<Self>, epoch: u64, delay: Duration) -> BoxFuture<'static, ()> {
        async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = self.connect(ConnectOrigin::Timer { epoch }).await {
                tracing::debug!("Reconnect attempt did not succeed: {}", e);
            }
        }
        .boxed()
    }

    fn disconnect(&self) {
        let mut slot = self.slot();
        slot.epoch += 1;
        if let Some(timer) = slot.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(reader) = slot.reader.take() {
            reader.abort();
        }
        let was_open = slot.outbound.take().is_some();
        slot.reconnect_attempts = 0;
        self.drop_pending_tools();
        self.transition(&mut slot, ConnectionState::Disconnected);
        if was_open {
            tracing::info!(parent: &self.span, "Disconnected");
        }
    }

    fn send(&self, envelope: EventEnvelope) -> Result<()> {
        let slot = self.slot();
        match slot.outbound.as_ref() {
            Some(tx) if self.state() == ConnectionState::Connected => tx
                .send(envelope)
                .map_err(|_| AgentError::connection("transport closed")),
            _ => Err(AgentError::connection("not connected")),
        }
    }

    /// 丢弃等待中的工具请求；等待方收到 "Connection lost"
    fn drop_pending_tools(&self) {
        lock(&self.pending_tools).clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
