//! 插件注册表
//!
//! 消费插件清单完成注册，维护描述符与实例表。重复发现是幂等的：
//! 已注册的id只更新元数据，不会产生重复实例。启用/禁用标志通过
//! 外部键值存储协作者持久化，跨进程重启保留

use super::core::*;
use crate::types::{AssetClass, PluginId, TimestampMs};
use crate::{QuantHubError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 共享插件实例句柄
///
/// fetch/health_check走读锁可并发，initialize走写锁独占
pub type PluginHandle = Arc<RwLock<Box<dyn DataSourcePlugin>>>;

/// 启用状态持久化协作者 - 按插件id读写布尔标志
pub trait EnabledStateStore: Send + Sync {
    fn get(&self, plugin_id: &str) -> Option<bool>;
    fn set(&self, plugin_id: &str, enabled: bool) -> Result<()>;
}

/// 内存实现，测试用
#[derive(Default)]
pub struct MemoryStateStore {
    map: parking_lot::RwLock<HashMap<String, bool>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnabledStateStore for MemoryStateStore {
    fn get(&self, plugin_id: &str) -> Option<bool> {
        self.map.read().get(plugin_id).copied()
    }

    fn set(&self, plugin_id: &str, enabled: bool) -> Result<()> {
        self.map.write().insert(plugin_id.to_string(), enabled);
        Ok(())
    }
}

/// JSON文件实现 - 整表读入，写时全量落盘
pub struct JsonFileStateStore {
    path: PathBuf,
    map: parking_lot::RwLock<HashMap<String, bool>>,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Plugin state file {:?} unreadable ({}), starting empty", path, e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            map: parking_lot::RwLock::new(map),
        }
    }

    fn persist(&self, map: &HashMap<String, bool>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(map)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl EnabledStateStore for JsonFileStateStore {
    fn get(&self, plugin_id: &str) -> Option<bool> {
        self.map.read().get(plugin_id).copied()
    }

    fn set(&self, plugin_id: &str, enabled: bool) -> Result<()> {
        let mut map = self.map.write();
        map.insert(plugin_id.to_string(), enabled);
        self.persist(&map)
    }
}

/// 已注册插件
pub struct RegisteredPlugin {
    /// 描述符（注册后仅enabled可变）
    pub descriptor: PluginDescriptor,
    /// 插件实例
    pub instance: PluginHandle,
    /// 注册时间
    pub registered_at: TimestampMs,
}

/// 注册表统计快照
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// 总插件数
    pub total_plugins: usize,
    /// 启用插件数
    pub enabled_plugins: usize,
    /// 按资产类别分组
    pub by_category: HashMap<AssetClass, usize>,
}

/// 插件注册表
pub struct PluginRegistry {
    /// 已注册的插件
    plugins: Arc<RwLock<HashMap<PluginId, RegisteredPlugin>>>,
    /// 启用状态持久化
    state_store: Arc<dyn EnabledStateStore>,
}

impl PluginRegistry {
    /// 创建新的插件注册表
    pub fn new(state_store: Arc<dyn EnabledStateStore>) -> Self {
        Self {
            plugins: Arc::new(RwLock::new(HashMap::new())),
            state_store,
        }
    }

    /// 消费清单列表完成发现注册，返回全部描述符
    ///
    /// 幂等：已存在的id更新元数据并保留实例与启用状态
    pub async fn discover(&self, manifests: &[PluginManifest]) -> Result<Vec<PluginDescriptor>> {
        let mut plugins = self.plugins.write().await;

        for manifest in manifests {
            if let Some(existing) = plugins.get_mut(&manifest.id) {
                // 重复发现只刷新元数据
                existing.descriptor.display_name = manifest.display_name.clone();
                existing.descriptor.category = manifest.category;
                existing.descriptor.capability_version = manifest.capability_version.clone();
                debug!("Plugin '{}' re-discovered, metadata refreshed", manifest.id);
                continue;
            }

            let enabled = self.state_store.get(&manifest.id).unwrap_or(true);
            let instance: PluginHandle = Arc::new(RwLock::new((manifest.factory)()));

            plugins.insert(
                manifest.id.clone(),
                RegisteredPlugin {
                    descriptor: PluginDescriptor::from_manifest(manifest, enabled),
                    instance,
                    registered_at: chrono::Utc::now().timestamp_millis(),
                },
            );
            info!(
                "Plugin '{}' registered (category={}, enabled={})",
                manifest.id, manifest.category, enabled
            );
        }

        Ok(plugins.values().map(|p| p.descriptor.clone()).collect())
    }

    /// 获取插件实例；禁用的插件返回PluginDisabled
    pub async fn get(&self, plugin_id: &str) -> Result<PluginHandle> {
        let plugins = self.plugins.read().await;
        let registered = plugins
            .get(plugin_id)
            .ok_or_else(|| QuantHubError::PluginNotFound { plugin_id: plugin_id.to_string() })?;

        if !registered.descriptor.enabled {
            return Err(QuantHubError::PluginDisabled { plugin_id: plugin_id.to_string() });
        }
        Ok(registered.instance.clone())
    }

    /// 获取描述符
    pub async fn descriptor(&self, plugin_id: &str) -> Result<PluginDescriptor> {
        let plugins = self.plugins.read().await;
        plugins
            .get(plugin_id)
            .map(|p| p.descriptor.clone())
            .ok_or_else(|| QuantHubError::PluginNotFound { plugin_id: plugin_id.to_string() })
    }

    /// 全部描述符
    pub async fn descriptors(&self) -> Vec<PluginDescriptor> {
        let plugins = self.plugins.read().await;
        plugins.values().map(|p| p.descriptor.clone()).collect()
    }

    /// 设置启用状态并持久化
    pub async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<()> {
        {
            let mut plugins = self.plugins.write().await;
            let registered = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| QuantHubError::PluginNotFound { plugin_id: plugin_id.to_string() })?;
            registered.descriptor.enabled = enabled;
        }

        self.state_store.set(plugin_id, enabled)?;
        info!("Plugin '{}' {}", plugin_id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// 注册表统计快照
    pub async fn registry_stats(&self) -> RegistryStats {
        let plugins = self.plugins.read().await;
        let mut stats = RegistryStats {
            total_plugins: plugins.len(),
            enabled_plugins: 0,
            by_category: HashMap::new(),
        };

        for plugin in plugins.values() {
            if plugin.descriptor.enabled {
                stats.enabled_plugins += 1;
            }
            *stats.by_category.entry(plugin.descriptor.category).or_insert(0) += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use semver::Version;
    use tempfile::TempDir;

    struct StubPlugin;

    #[async_trait]
    impl DataSourcePlugin for StubPlugin {
        async fn initialize(
            &mut self,
            _config: &HashMap<String, serde_json::Value>,
        ) -> Result<bool> {
            Ok(true)
        }

        async fn health_check(&self) -> Result<HealthResult> {
            Ok(HealthResult::healthy(1))
        }

        fn plugin_info(&self) -> PluginInfo {
            PluginInfo {
                name: "stub".to_string(),
                version: Version::new(1, 0, 0),
                category: AssetClass::Stock,
            }
        }
    }

    fn stub_factory() -> Box<dyn DataSourcePlugin> {
        Box::new(StubPlugin)
    }

    fn stub_manifest(id: &str) -> PluginManifest {
        PluginManifest::new(id, format!("Stub {}", id), AssetClass::Stock, Version::new(1, 0, 0), stub_factory)
    }

    #[tokio::test]
    async fn test_discover_registers_once() {
        let registry = PluginRegistry::new(Arc::new(MemoryStateStore::new()));

        let descriptors = registry
            .discover(&[stub_manifest("tushare"), stub_manifest("sina")])
            .await
            .unwrap();
        assert_eq!(descriptors.len(), 2);

        // 重复发现不产生重复注册
        let descriptors = registry.discover(&[stub_manifest("tushare")]).await.unwrap();
        assert_eq!(descriptors.len(), 2);

        let stats = registry.registry_stats().await;
        assert_eq!(stats.total_plugins, 2);
        assert_eq!(stats.enabled_plugins, 2);
        assert_eq!(stats.by_category.get(&AssetClass::Stock), Some(&2));
    }

    #[tokio::test]
    async fn test_rediscovery_updates_metadata_keeps_enabled() {
        let registry = PluginRegistry::new(Arc::new(MemoryStateStore::new()));
        registry.discover(&[stub_manifest("tushare")]).await.unwrap();
        registry.set_enabled("tushare", false).await.unwrap();

        let mut updated = stub_manifest("tushare");
        updated.display_name = "Tushare Pro".to_string();
        updated.capability_version = Version::new(2, 0, 0);
        registry.discover(&[updated]).await.unwrap();

        let descriptor = registry.descriptor("tushare").await.unwrap();
        assert_eq!(descriptor.display_name, "Tushare Pro");
        assert_eq!(descriptor.capability_version, Version::new(2, 0, 0));
        assert!(!descriptor.enabled);
    }

    #[tokio::test]
    async fn test_get_disabled_plugin() {
        let registry = PluginRegistry::new(Arc::new(MemoryStateStore::new()));
        registry.discover(&[stub_manifest("sina")]).await.unwrap();

        assert!(registry.get("sina").await.is_ok());

        registry.set_enabled("sina", false).await.unwrap();
        assert!(matches!(
            registry.get("sina").await,
            Err(QuantHubError::PluginDisabled { .. })
        ));

        assert!(matches!(
            registry.get("unknown").await,
            Err(QuantHubError::PluginNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_enabled_state_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let state_path = temp_dir.path().join("plugin_state.json");

        {
            let store = Arc::new(JsonFileStateStore::new(&state_path));
            let registry = PluginRegistry::new(store);
            registry.discover(&[stub_manifest("eastmoney")]).await.unwrap();
            registry.set_enabled("eastmoney", false).await.unwrap();
        }

        // 模拟重启：新注册表从同一文件读取状态
        let store = Arc::new(JsonFileStateStore::new(&state_path));
        let registry = PluginRegistry::new(store);
        let descriptors = registry.discover(&[stub_manifest("eastmoney")]).await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert!(!descriptors[0].enabled);
    }
}
