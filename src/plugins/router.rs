//! 数据源回退路由器
//!
//! 每个逻辑数据类别持有一条有序的提供者回退链，结合健康监控器状态
//! 解析当前最优提供者。链序编码优先级，健康状态只做过滤：
//! 健康的提供者按链序优先；降级的提供者宁可用也不让类别不可用，
//! 但永远不会被选在任何一个健康提供者之前

use super::health::{HealthState, PluginHealthMonitor};
use crate::types::{DataCategory, PluginId};
use crate::{QuantHubError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// 数据类别的提供者回退链 - 配置数据，运行期只读
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackChain {
    /// 数据类别
    pub category: DataCategory,
    /// 有序提供者列表（优先级从高到低，末位应为保底提供者）
    pub providers: Vec<PluginId>,
}

/// 数据源路由器
pub struct DataSourceRouter {
    /// 按类别的回退链
    chains: HashMap<DataCategory, Vec<PluginId>>,
    /// 健康监控器
    monitor: Arc<PluginHealthMonitor>,
}

impl DataSourceRouter {
    pub fn new(chains: Vec<FallbackChain>, monitor: Arc<PluginHealthMonitor>) -> Self {
        let chains = chains
            .into_iter()
            .map(|chain| (chain.category, chain.providers))
            .collect();
        Self { chains, monitor }
    }

    /// 解析类别当前最优的可用提供者
    ///
    /// 第一遍按链序找Healthy；没有任何健康提供者时，第二遍按链序找
    /// Degraded；两遍都落空返回NoProviderAvailable
    pub async fn resolve(&self, category: DataCategory) -> Result<PluginId> {
        let chain = self
            .chains
            .get(&category)
            .ok_or(QuantHubError::NoProviderAvailable { category })?;

        for plugin_id in chain {
            if self.monitor.state_of(plugin_id).await == Some(HealthState::Healthy) {
                debug!("Category '{}' routed to healthy provider '{}'", category, plugin_id);
                return Ok(plugin_id.clone());
            }
        }

        for plugin_id in chain {
            if self.monitor.state_of(plugin_id).await == Some(HealthState::Degraded) {
                warn!(
                    "Category '{}' has no healthy provider, falling back to degraded '{}'",
                    category, plugin_id
                );
                return Ok(plugin_id.clone());
            }
        }

        warn!("Category '{}' has no usable provider in chain {:?}", category, chain);
        Err(QuantHubError::NoProviderAvailable { category })
    }

    /// 类别配置的完整链（诊断用）
    pub fn chain_for(&self, category: DataCategory) -> Option<&[PluginId]> {
        self.chains.get(&category).map(|v| v.as_slice())
    }
}
