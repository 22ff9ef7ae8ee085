//! 事件分发
//!
//! 事件类型 → 处理器集合的显式映射，外加一组通配处理器。分发时先对处理器集合取快照，
//! 处理器在分发过程中订阅 / 退订不会影响本轮；每个处理器单独隔离，错误或 panic 只记日志。

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt};

use super::message::EventEnvelope;

/// 事件处理器
pub type EventHandler =
    Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// 订阅句柄，用于退订
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// 一次分发的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// 被调用的处理器数
    pub invoked: usize,
    /// 返回错误或 panic 的处理器数
    pub failed: usize,
}

#[derive(Default)]
struct Registry {
    by_type: HashMap<String, Vec<(SubscriptionId, EventHandler)>>,
    wildcard: Vec<(SubscriptionId, EventHandler)>,
}

/// 处理器注册表
#[derive(Default)]
pub struct EventDispatcher {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅指定类型的事件
    pub fn subscribe<F, Fut>(&self, event_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id();
        self.lock()
            .by_type
            .entry(event_type.to_string())
            .or_default()
            .push((id, boxed(handler)));
        id
    }

    /// 订阅所有事件（心跳除外，除非显式订阅 heartbeat）
    pub fn subscribe_all<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id();
        self.lock().wildcard.push((id, boxed(handler)));
        id
    }

    /// 退订；返回是否找到
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let before = registry.wildcard.len();
        registry.wildcard.retain(|(sid, _)| *sid != id);
        if registry.wildcard.len() != before {
            return true;
        }
        let mut found = false;
        registry.by_type.retain(|_, handlers| {
            let len = handlers.len();
            handlers.retain(|(sid, _)| *sid != id);
            found |= handlers.len() != len;
            !handlers.is_empty()
        });
        found
    }

    pub fn handler_count(&self) -> usize {
        let registry = self.lock();
        registry.wildcard.len() + registry.by_type.values().map(Vec::len).sum::<usize>()
    }

    /// 先调用该类型的处理器，再调用通配处理器
    pub async fn dispatch(&self, envelope: &EventEnvelope) -> DispatchReport {
        self.dispatch_inner(envelope, true).await
    }

    /// 只调用显式订阅该类型的处理器
    pub async fn dispatch_typed(&self, envelope: &EventEnvelope) -> DispatchReport {
        self.dispatch_inner(envelope, false).await
    }

    async fn dispatch_inner(&self, envelope: &EventEnvelope, include_wildcard: bool) -> DispatchReport {
        let snapshot: Vec<EventHandler> = {
            let registry = self.lock();
            let typed = registry
                .by_type
                .get(&envelope.event_type)
                .into_iter()
                .flatten();
            let wildcard = registry.wildcard.iter().filter(|_| include_wildcard);
            typed.chain(wildcard).map(|(_, h)| Arc::clone(h)).collect()
        };

        let mut report = DispatchReport::default();
        for handler in snapshot {
            report.invoked += 1;
            let env = envelope.clone();
            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(env))) {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::error!("Handler for '{}' failed: {}", envelope.event_type, e);
                }
                Err(_) => {
                    report.failed += 1;
                    tracing::error!("Handler for '{}' panicked", envelope.event_type);
                }
            }
        }
        report
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn boxed<F, Fut>(handler: F) -> EventHandler
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |env| handler(env).boxed())
}
