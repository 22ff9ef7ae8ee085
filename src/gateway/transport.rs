//! 双向传输抽象与 WebSocket 实现
//!
//! 连接管理器只通过 `Transport` 打开链路；链路以一对 channel 表示：
//! outbound 发送事件，inbound 接收事件或关闭通知。丢弃 outbound 即关闭链路。

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::message::EventEnvelope;
use crate::auth::credential::validate_base_url;
use crate::core::error::{AgentError, Result};

/// 链路上收到的内容
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(EventEnvelope),
    /// 对端关闭或链路出错，携带原因
    Closed(String),
}

/// 一条已建立的链路
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<EventEnvelope>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// 传输层：握手时携带令牌
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, token: &str) -> Result<TransportLink>;
}

/// WebSocket 传输（JSON 文本帧，每帧一个事件信封）
pub struct WebSocketTransport {
    url: String,
    /// 握手超时，独立于连接管理器的 connect timeout
    handshake_timeout: Duration,
}

impl WebSocketTransport {
    /// `base_url` 为 http(s) 地址，自动转换为 ws(s)
    pub fn new(base_url: &str, path: &str, handshake_timeout: Duration) -> Result<Self> {
        let base = validate_base_url(base_url)?;
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base
        };
        let path = if path.is_empty() || path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Ok(Self {
            url: format!("{}{}", ws_base, path),
            handshake_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, token: &str) -> Result<TransportLink> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::Config(format!("invalid websocket url {}: {}", self.url, e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| AgentError::Auth(format!("token is not a valid header value: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let timeout_ms = self.handshake_timeout.as_millis() as u64;
        let (ws, _response) =
            match tokio::time::timeout(self.handshake_timeout, tokio_tungstenite::connect_async(request)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    return Err(AgentError::connection(format!("websocket handshake failed: {}", e)))
                }
                Err(_) => {
                    return Err(AgentError::timeout(timeout_ms, format!("websocket handshake {}", self.url)))
                }
            };

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<EventEnvelope>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Dropping unserializable '{}' event: {}", envelope.event_type, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    tracing::debug!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<EventEnvelope>(&text) {
                            Ok(envelope) => {
                                if in_tx.send(TransportEvent::Message(envelope)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => tracing::warn!("Ignoring malformed event frame: {}", e),
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = in_tx.send(TransportEvent::Closed(reason));
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
