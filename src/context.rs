//! 运行上下文
//!
//! 显式组装全部组件并持有其所有权，协作者通过构造参数注入，
//! 不存在全局单例。停机清理按 存储关闭 → 导入排空 → 探测停止 的
//! 注册顺序登记，协调器逆序执行，保证探测先停、任务后排空、
//! 存储最后关闭

use crate::config::HubConfig;
use crate::core::event_bus::EventBus;
use crate::core::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::plugins::{
    core::PluginManifest, DataSourceRouter, HealthState, JsonFileStateStore, PluginHealthMonitor,
    PluginRegistry,
};
use crate::services::ImportEngine;
use crate::storage::AssetDatabaseRouter;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// 管线运行上下文
pub struct HubContext {
    pub config: HubConfig,
    pub event_bus: Arc<EventBus>,
    pub registry: Arc<PluginRegistry>,
    pub monitor: Arc<PluginHealthMonitor>,
    pub router: Arc<DataSourceRouter>,
    pub storage: Arc<AssetDatabaseRouter>,
    pub import_engine: Arc<ImportEngine>,
    pub shutdown: Arc<ShutdownCoordinator>,
}

impl HubContext {
    /// 组装并启动全部组件
    ///
    /// 清单中的插件完成注册与初始化，周期健康探测随即启动；
    /// 初始化失败的插件进入Failed，不阻塞其余组件
    pub async fn build(config: HubConfig, manifests: &[PluginManifest]) -> Result<Arc<Self>> {
        config.validate()?;

        let event_bus = Arc::new(EventBus::new());
        let state_store = Arc::new(JsonFileStateStore::new(&config.storage.plugin_state_path));
        let registry = Arc::new(PluginRegistry::new(state_store));
        let descriptors = registry.discover(manifests).await?;
        info!("Context assembled with {} plugin(s)", descriptors.len());

        let monitor = Arc::new(PluginHealthMonitor::new(
            registry.clone(),
            event_bus.clone(),
            config.health_monitor_config(),
        ));
        monitor.initialize_all(&config.plugin_configs).await?;
        let _ = monitor.start();

        let router = Arc::new(DataSourceRouter::new(
            config.fallback_chains.clone(),
            monitor.clone(),
        ));
        let storage = Arc::new(AssetDatabaseRouter::new(
            config.storage.base_path.clone(),
            event_bus.clone(),
        ));
        let import_engine = Arc::new(ImportEngine::new(
            router.clone(),
            registry.clone(),
            monitor.clone(),
            storage.clone(),
            event_bus.clone(),
            config.import_engine_config(),
        ));

        let shutdown = Arc::new(ShutdownCoordinator::new(event_bus.clone()));
        {
            let storage = storage.clone();
            shutdown.register(
                "storage_router",
                Box::new(move || {
                    Box::pin(async move {
                        storage.close_all().await;
                        Ok(())
                    })
                }),
            );
        }
        {
            let engine = import_engine.clone();
            shutdown.register(
                "import_engine",
                Box::new(move || {
                    Box::pin(async move {
                        engine.drain().await;
                        Ok(())
                    })
                }),
            );
        }
        {
            let monitor = monitor.clone();
            shutdown.register(
                "health_monitor",
                Box::new(move || {
                    Box::pin(async move {
                        monitor.stop();
                        Ok(())
                    })
                }),
            );
        }

        Ok(Arc::new(Self {
            config,
            event_bus,
            registry,
            monitor,
            router,
            storage,
            import_engine,
            shutdown,
        }))
    }

    /// 触发有序停机（幂等）
    pub async fn run_shutdown(&self) -> ShutdownReport {
        self.shutdown.run_shutdown().await
    }

    /// 手动重新启用插件并重走初始化（Failed状态的恢复路径）
    pub async fn reenable_plugin(&self, plugin_id: &str) -> Result<HealthState> {
        self.registry.set_enabled(plugin_id, true).await?;
        let empty = HashMap::new();
        let plugin_config = self.config.plugin_configs.get(plugin_id).unwrap_or(&empty);
        self.monitor.reinitialize_plugin(plugin_id, plugin_config).await
    }
}
