//! 持久连接层
//!
//! - **message**: 事件信封与各类强类型 payload
//! - **dispatch**: 事件类型 → 处理器集合（含通配），处理器错误隔离
//! - **transport**: 传输抽象与 WebSocket 实现
//! - **connection**: 连接状态机、重连定时器、心跳应答、工具请求

mod connection;
mod dispatch;
mod message;
mod transport;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use dispatch::{DispatchReport, EventDispatcher, EventHandler, SubscriptionId};
pub use message::{
    iso_now, AgentReadyPayload, AgentStatus, ConnectedPayload, ContextUpdatePayload,
    EventEnvelope, EventType, HeartbeatPayload, StatusUpdatePayload, TaskAssignedPayload,
    ToolRequestPayload, ToolResultPayload, WakeUpPayload, WakeUpReason,
};
pub use transport::{Transport, TransportEvent, TransportLink, WebSocketTransport};
