//! 插件系统核心特征定义
//!
//! 数据源能力契约统一为一个必须完整实现的trait，由编译器保证完整性，
//! 取代运行时的duck-typing探测。插件通过静态清单（manifest）注册：
//! 每个插件模块暴露一个描述符（id、类别、工厂函数），注册表消费清单
//! 列表而不是反射扫描任意代码——不完整的实现无法构造出清单

use crate::types::*;
use crate::{QuantHubError, Result};
use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 健康探测结果 - 提供者自报的存活状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResult {
    /// 是否健康
    pub is_healthy: bool,
    /// 状态消息
    pub message: String,
    /// 探测响应耗时（毫秒）
    pub response_time_ms: u64,
}

impl HealthResult {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            is_healthy: true,
            message: "ok".to_string(),
            response_time_ms,
        }
    }

    pub fn unhealthy(message: impl Into<String>, response_time_ms: u64) -> Self {
        Self {
            is_healthy: false,
            message: message.into(),
            response_time_ms,
        }
    }
}

/// 插件自描述信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// 插件名称
    pub name: String,
    /// 插件版本
    pub version: Version,
    /// 服务的资产类别
    pub category: AssetClass,
}

/// 数据源插件能力契约 - 所有提供者必须完整实现
///
/// fetch_*操作按数据类别划分；提供者只服务部分类别时，未覆盖的操作
/// 返回OperationUnsupported，由回退链保证该类别有其他可用提供者
#[async_trait]
pub trait DataSourcePlugin: Send + Sync {
    /// 初始化插件；返回false或出错均视为初始化失败
    async fn initialize(&mut self, config: &HashMap<String, serde_json::Value>) -> Result<bool>;

    /// 存活探测，区别于业务数据拉取
    async fn health_check(&self) -> Result<HealthResult>;

    /// 插件自描述
    fn plugin_info(&self) -> PluginInfo;

    /// 拉取证券列表
    async fn fetch_stock_list(&self) -> Result<Vec<MarketRecord>> {
        Err(QuantHubError::OperationUnsupported { category: DataCategory::StockList })
    }

    /// 拉取指定代码在日期范围内的K线
    async fn fetch_kline(&self, symbol: &str, range: &DateRange) -> Result<Vec<MarketRecord>> {
        let _ = (symbol, range);
        Err(QuantHubError::OperationUnsupported { category: DataCategory::Kline })
    }

    /// 拉取实时行情快照
    async fn fetch_realtime(&self, symbols: &[String]) -> Result<Vec<MarketRecord>> {
        let _ = symbols;
        Err(QuantHubError::OperationUnsupported { category: DataCategory::Realtime })
    }

    /// 拉取基本面数据
    async fn fetch_fundamental(&self, symbols: &[String]) -> Result<Vec<MarketRecord>> {
        let _ = symbols;
        Err(QuantHubError::OperationUnsupported { category: DataCategory::Fundamental })
    }
}

/// 插件工厂函数
pub type PluginFactory = fn() -> Box<dyn DataSourcePlugin>;

/// 插件静态清单 - 插件模块暴露的注册入口
pub struct PluginManifest {
    /// 插件ID
    pub id: PluginId,
    /// 展示名称
    pub display_name: String,
    /// 服务的资产类别
    pub category: AssetClass,
    /// 能力契约版本
    pub capability_version: Version,
    /// 实例工厂
    pub factory: PluginFactory,
}

impl PluginManifest {
    pub fn new(
        id: impl Into<PluginId>,
        display_name: impl Into<String>,
        category: AssetClass,
        capability_version: Version,
        factory: PluginFactory,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            category,
            capability_version,
            factory,
        }
    }
}

/// 插件描述符 - 发现时创建，注册后仅enabled可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// 插件ID
    pub id: PluginId,
    /// 展示名称
    pub display_name: String,
    /// 资产类别
    pub category: AssetClass,
    /// 能力契约版本
    pub capability_version: Version,
    /// 是否启用（跨进程重启持久化）
    pub enabled: bool,
}

impl PluginDescriptor {
    /// 从清单构建描述符
    pub fn from_manifest(manifest: &PluginManifest, enabled: bool) -> Self {
        Self {
            id: manifest.id.clone(),
            display_name: manifest.display_name.clone(),
            category: manifest.category,
            capability_version: manifest.capability_version.clone(),
            enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MinimalPlugin;

    #[async_trait]
    impl DataSourcePlugin for MinimalPlugin {
        async fn initialize(&mut self, _config: &HashMap<String, serde_json::Value>) -> Result<bool> {
            Ok(true)
        }

        async fn health_check(&self) -> Result<HealthResult> {
            Ok(HealthResult::healthy(1))
        }

        fn plugin_info(&self) -> PluginInfo {
            PluginInfo {
                name: "minimal".to_string(),
                version: Version::new(1, 0, 0),
                category: AssetClass::Stock,
            }
        }
    }

    #[tokio::test]
    async fn test_uncovered_operations_report_unsupported() {
        let plugin = MinimalPlugin;

        let result = plugin.fetch_stock_list().await;
        assert!(matches!(
            result,
            Err(QuantHubError::OperationUnsupported { category: DataCategory::StockList })
        ));

        let result = plugin.fetch_realtime(&["600000".to_string()]).await;
        assert!(matches!(result, Err(QuantHubError::OperationUnsupported { .. })));
    }

    #[test]
    fn test_descriptor_from_manifest() {
        fn factory() -> Box<dyn DataSourcePlugin> {
            Box::new(MinimalPlugin)
        }

        let manifest = PluginManifest::new(
            "minimal",
            "Minimal Source",
            AssetClass::Stock,
            Version::new(1, 2, 0),
            factory,
        );

        let descriptor = PluginDescriptor::from_manifest(&manifest, true);
        assert_eq!(descriptor.id, "minimal");
        assert_eq!(descriptor.category, AssetClass::Stock);
        assert_eq!(descriptor.capability_version, Version::new(1, 2, 0));
        assert!(descriptor.enabled);
    }

    #[test]
    fn test_descriptor_serialization() {
        let descriptor = PluginDescriptor {
            id: "sina".to_string(),
            display_name: "Sina Finance".to_string(),
            category: AssetClass::Stock,
            capability_version: Version::new(1, 0, 0),
            enabled: false,
        };

        let serialized = serde_json::to_string(&descriptor).unwrap();
        let deserialized: PluginDescriptor = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.id, descriptor.id);
        assert_eq!(deserialized.capability_version, descriptor.capability_version);
        assert!(!deserialized.enabled);
    }
}
