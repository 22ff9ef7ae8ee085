//! 事件协议定义
//!
//! 所有事件统一封装为 `{type, payload, timestamp}`；payload 字段在线上使用 camelCase。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::error::{AgentError, Result};

/// 已知事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // 服务端 → Agent
    TaskAssigned,
    ContextUpdate,
    WakeUp,
    ToolResult,
    /// 服务端握手确认，携带 agentId
    Connected,

    // 双向
    Heartbeat,

    // Agent → 服务端
    AgentReady,
    ToolRequest,
    StatusUpdate,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskAssigned => "task_assigned",
            EventType::ContextUpdate => "context_update",
            EventType::WakeUp => "wake_up",
            EventType::ToolResult => "tool_result",
            EventType::Connected => "connected",
            EventType::Heartbeat => "heartbeat",
            EventType::AgentReady => "agent_ready",
            EventType::ToolRequest => "tool_request",
            EventType::StatusUpdate => "status_update",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 事件信封；`event_type` 保留原始字符串，未知类型同样可分发
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// ISO-8601（UTC）
    #[serde(default)]
    pub timestamp: String,
}

impl EventEnvelope {
    /// 以当前时间创建事件
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: iso_now(),
        }
    }

    /// 从强类型 payload 创建
    pub fn typed<P: Serialize>(event_type: EventType, payload: &P) -> Result<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| AgentError::Decode(format!("{} payload: {}", event_type, e)))?;
        Ok(Self::new(event_type.as_str(), payload))
    }

    pub fn is(&self, event_type: EventType) -> bool {
        self.event_type == event_type.as_str()
    }

    /// 将 payload 解析为强类型
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| AgentError::Decode(format!("{} payload: {}", self.event_type, e)))
    }
}

/// 当前 UTC 时间，ISO-8601 毫秒精度
pub fn iso_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Agent 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Error,
}

impl std::str::FromStr for AgentStatus {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "working" => Ok(AgentStatus::Working),
            "error" => Ok(AgentStatus::Error),
            other => Err(AgentError::Decode(format!("unknown agent status '{}'", other))),
        }
    }
}

/// 唤醒原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeUpReason {
    Scheduled,
    Manual,
    Retry,
}

/// task_assigned：分配给 Agent 的新任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignedPayload {
    pub task_id: String,
    pub project_mapping_id: String,
    pub clickup_task_id: String,
    pub slack_channel_id: String,
    pub slack_thread_ts: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub assigned_at: String,
}

/// context_update：任务讨论串中的新消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUpdatePayload {
    pub task_id: String,
    pub slack_channel_id: String,
    pub slack_thread_ts: String,
    pub message_ts: String,
    pub author: String,
    pub content: String,
    pub is_human: bool,
}

/// wake_up：通用唤醒信号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeUpPayload {
    pub reason: WakeUpReason,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// tool_request：Agent 请求服务端执行工具
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRequestPayload {
    pub request_id: String,
    pub tool: String,
    pub action: String,
    pub params: serde_json::Value,
}

/// tool_result：工具执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPayload {
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolResultPayload {
    pub fn failure(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// heartbeat：ping / pong
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pong: Option<bool>,
    #[serde(default)]
    pub server_time: String,
}

impl HeartbeatPayload {
    pub fn ping() -> Self {
        Self {
            ping: Some(true),
            pong: None,
            server_time: String::new(),
        }
    }

    /// 携带本地时间的 pong
    pub fn pong() -> Self {
        Self {
            ping: None,
            pong: Some(true),
            server_time: iso_now(),
        }
    }

    pub fn is_ping(&self) -> bool {
        self.ping.unwrap_or(false)
    }
}

/// agent_ready：连接后声明能力
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReadyPayload {
    pub capabilities: Vec<String>,
    pub version: String,
}

/// status_update：Agent 状态变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdatePayload {
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// connected：服务端握手确认
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    #[serde(default)]
    pub message: String,
    pub agent_id: String,
    #[serde(default)]
    pub server_time: String,
}
