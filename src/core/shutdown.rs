//! 有序停机协调器
//!
//! 收集各组件注册的清理回调，在进程终止时按注册的严格逆序执行。
//! 触发是幂等的：第二次触发为空操作。单个清理失败记录日志后继续
//! 执行剩余清理，最终报告成功/失败计数

use crate::core::event_bus::{event_types, Event, EventBus};
use crate::Result;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// 清理回调 - 只执行一次的异步闭包
pub type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// 停机执行报告
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// 成功的清理数量
    pub succeeded: usize,
    /// 失败的清理数量
    pub failed: usize,
}

/// 停机协调器
pub struct ShutdownCoordinator {
    /// 注册顺序的清理列表
    cleanups: parking_lot::Mutex<Vec<(String, CleanupFn)>>,
    /// 是否已触发
    triggered: AtomicBool,
    /// 事件总线
    event_bus: Arc<EventBus>,
}

impl ShutdownCoordinator {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            cleanups: parking_lot::Mutex::new(Vec::new()),
            triggered: AtomicBool::new(false),
            event_bus,
        }
    }

    /// 注册命名清理回调
    pub fn register(&self, name: &str, cleanup: CleanupFn) {
        let mut cleanups = self.cleanups.lock();
        info!("Shutdown cleanup '{}' registered (position {})", name, cleanups.len());
        cleanups.push((name.to_string(), cleanup));
    }

    /// 是否已触发停机
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// 执行停机：按注册的严格逆序运行所有清理
    ///
    /// 幂等，重复触发直接返回空报告
    pub async fn run_shutdown(&self) -> ShutdownReport {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Shutdown already triggered, ignoring");
            return ShutdownReport::default();
        }

        self.event_bus
            .publish(Event::new(
                event_types::SHUTDOWN_STARTED,
                "shutdown_coordinator",
                serde_json::json!(null),
            ))
            .await;

        let cleanups: Vec<(String, CleanupFn)> = {
            let mut guard = self.cleanups.lock();
            std::mem::take(&mut *guard)
        };

        let mut report = ShutdownReport::default();
        for (name, cleanup) in cleanups.into_iter().rev() {
            info!("Running shutdown cleanup '{}'", name);
            match cleanup().await {
                Ok(()) => {
                    report.succeeded += 1;
                }
                Err(e) => {
                    error!("Shutdown cleanup '{}' failed: {}", name, e);
                    report.failed += 1;
                }
            }
        }

        self.event_bus
            .publish(Event::new(
                event_types::SHUTDOWN_COMPLETED,
                "shutdown_coordinator",
                serde_json::json!({
                    "succeeded": report.succeeded,
                    "failed": report.failed,
                }),
            ))
            .await;

        info!(
            "Shutdown completed: {} cleanups succeeded, {} failed",
            report.succeeded, report.failed
        );
        report
    }
}
