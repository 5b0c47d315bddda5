//! 事件总线实现
//!
//! 解耦各组件的发布/订阅中枢。投递对发布方而言是同步的：publish在返回前
//! 依次调用当前所有订阅者；单个订阅者的失败被隔离并记录日志，不影响其余
//! 订阅者。订阅通过显式句柄管理，组件销毁时必须释放自己的订阅，总线在
//! 释放时清除处理器，而不依赖发布时的隐式回收

use crate::types::TimestampMs;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// 核心发布的事件类型
pub mod event_types {
    pub const PLUGIN_HEALTH_CHANGED: &str = "plugin.health_changed";
    pub const IMPORT_PROGRESS: &str = "import.progress";
    pub const IMPORT_COMPLETED: &str = "import.completed";
    pub const STORAGE_QUARANTINED: &str = "storage.quarantined";
    pub const SHUTDOWN_STARTED: &str = "shutdown.started";
    pub const SHUTDOWN_COMPLETED: &str = "shutdown.completed";
}

/// 事件 - 瞬态数据，从不持久化，每个订阅者得到独立视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// 事件类型
    pub event_type: String,
    /// 事件载荷
    pub payload: serde_json::Value,
    /// 事件来源组件
    pub source: String,
    /// 事件时间戳（毫秒）
    pub timestamp: TimestampMs,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 事件处理器特征
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理事件
    async fn handle(&self, event: &Event) -> Result<()>;

    /// 事件处理器名称
    fn name(&self) -> &str;
}

/// 订阅句柄 - 持有方负责在自身销毁前调用unsubscribe释放
pub type SubscriptionId = u64;

/// 事件总线
pub struct EventBus {
    /// 按事件类型注册的处理器
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, Arc<dyn EventHandler>)>>>,
    /// 订阅句柄分配器
    next_id: AtomicU64,
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 订阅事件类型，返回显式订阅句柄
    pub async fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push((id, handler.clone()));

        debug!("Handler '{}' subscribed to '{}' (id={})", handler.name(), event_type, id);
        id
    }

    /// 释放订阅，清除对应处理器
    pub async fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().await;
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(id, _)| *id != subscription_id);
            removed |= list.len() != before;
        }
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    /// 发布事件，返回成功投递的订阅者数量
    ///
    /// 在返回前依次调用每个当前订阅者；处理器失败仅记录日志
    pub async fn publish(&self, event: Event) -> usize {
        let subscribers: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = {
            let handlers = self.handlers.read().await;
            handlers.get(&event.event_type).cloned().unwrap_or_default()
        };

        let mut delivered = 0;
        for (_, handler) in &subscribers {
            match handler.handle(&event).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        "Event handler '{}' failed on '{}': {}",
                        handler.name(),
                        event.event_type,
                        e
                    );
                }
            }
        }
        delivered
    }

    /// 当前订阅者总数
    pub async fn subscriber_count(&self) -> usize {
        let handlers = self.handlers.read().await;
        handlers.values().map(|v| v.len()).sum()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
