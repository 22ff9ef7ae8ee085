//! Oblivion - agent 韧性与身份层
//!
//! 模块划分：
//! - **auth**: 客户端凭据换取会话令牌，刷新去重
//! - **api**: 带超时、幂等感知重试与透明重新认证的请求层
//! - **gateway**: 持久双向连接、重连状态机、事件分发
//! - **identity**: 跨进程身份锁（profile 池认领，防 pid 复用）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、优雅关闭
//! - **observability**: 日志初始化

pub mod api;
pub mod auth;
pub mod config;
pub mod core;
pub mod gateway;
pub mod identity;
pub mod observability;

pub use crate::core::error::{AgentError, ErrorCode, Result};
