//! 配置管理系统
//!
//! YAML驱动的管线配置：存储路径、健康监控参数、导入引擎参数、
//! 按数据类别的回退链以及各插件的初始化配置。所有字段都有可运行的
//! 默认值，缺省配置文件也能启动

use crate::plugins::{FallbackChain, HealthMonitorConfig};
use crate::services::ImportEngineConfig;
use crate::types::{DataCategory, PluginId};
use crate::{QuantHubError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 分区文件根目录
    pub base_path: PathBuf,
    /// 插件启用状态文件
    pub plugin_state_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("data"),
            plugin_state_path: PathBuf::from("data/plugin_state.json"),
        }
    }
}

/// 健康监控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// 连续失败进入隔离的阈值
    pub quarantine_threshold: u32,
    /// 隔离冷却秒数
    pub quarantine_cooldown_secs: u64,
    /// 周期探测间隔秒数
    pub check_interval_secs: u64,
    /// 单次探测超时秒数
    pub check_timeout_secs: u64,
    /// 初始化超时秒数
    pub init_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            quarantine_threshold: 3,
            quarantine_cooldown_secs: 60,
            check_interval_secs: 30,
            check_timeout_secs: 10,
            init_timeout_secs: 30,
        }
    }
}

/// 导入引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// 并发分块上限；0表示按CPU核心数
    pub max_concurrent_chunks: usize,
    /// K线日期窗口天数
    pub chunk_days: i64,
    /// 快照类代码分组大小
    pub chunk_symbols: usize,
    /// 单分块最大尝试次数
    pub max_attempts: u32,
    /// 重试退避基数（毫秒）
    pub retry_backoff_ms: u64,
    /// 单次拉取超时秒数
    pub fetch_timeout_secs: u64,
    /// 停机排空窗口秒数
    pub drain_timeout_secs: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 0,
            chunk_days: 90,
            chunk_symbols: 50,
            max_attempts: 3,
            retry_backoff_ms: 500,
            fetch_timeout_secs: 30,
            drain_timeout_secs: 30,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别: trace/debug/info/warn/error
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// 管线总配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// 存储配置
    pub storage: StorageConfig,
    /// 健康监控配置
    pub health: HealthConfig,
    /// 导入引擎配置
    pub import: ImportConfig,
    /// 按数据类别的回退链
    pub fallback_chains: Vec<FallbackChain>,
    /// 各插件的初始化配置
    pub plugin_configs: HashMap<PluginId, HashMap<String, serde_json::Value>>,
    /// 日志配置
    pub logging: LoggingConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            health: HealthConfig::default(),
            import: ImportConfig::default(),
            fallback_chains: vec![
                FallbackChain {
                    category: DataCategory::StockList,
                    providers: vec!["synthetic".to_string()],
                },
                FallbackChain {
                    category: DataCategory::Kline,
                    providers: vec!["synthetic".to_string()],
                },
                FallbackChain {
                    category: DataCategory::Realtime,
                    providers: vec!["synthetic".to_string()],
                },
                FallbackChain {
                    category: DataCategory::Fundamental,
                    providers: vec!["synthetic".to_string()],
                },
            ],
            plugin_configs: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl HubConfig {
    /// 从YAML文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: HubConfig = serde_yaml::from_str(&content)
            .map_err(|e| QuantHubError::config(format!("invalid config {:?}: {}", path, e)))?;
        config.validate()?;
        info!("Config loaded from {:?}", path);
        Ok(config)
    }

    /// 保存配置到YAML文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)
            .map_err(|e| QuantHubError::config(format!("serialize config failed: {}", e)))?;
        std::fs::write(path, content)?;
        info!("Config saved to {:?}", path);
        Ok(())
    }

    /// 校验配置合法性
    pub fn validate(&self) -> Result<()> {
        if self.import.chunk_days <= 0 {
            return Err(QuantHubError::config("import.chunk_days must be positive"));
        }
        if self.import.max_attempts == 0 {
            return Err(QuantHubError::config("import.max_attempts must be at least 1"));
        }
        if self.health.quarantine_threshold == 0 {
            return Err(QuantHubError::config("health.quarantine_threshold must be at least 1"));
        }
        for chain in &self.fallback_chains {
            if chain.providers.is_empty() {
                return Err(QuantHubError::config(format!(
                    "fallback chain for '{}' has no providers",
                    chain.category
                )));
            }
        }
        Ok(())
    }

    /// 转换为健康监控器配置
    pub fn health_monitor_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            quarantine_threshold: self.health.quarantine_threshold,
            quarantine_cooldown: Duration::from_secs(self.health.quarantine_cooldown_secs),
            check_interval: Duration::from_secs(self.health.check_interval_secs),
            check_timeout: Duration::from_secs(self.health.check_timeout_secs),
            init_timeout: Duration::from_secs(self.health.init_timeout_secs),
        }
    }

    /// 转换为导入引擎配置
    pub fn import_engine_config(&self) -> ImportEngineConfig {
        let max_concurrent = if self.import.max_concurrent_chunks == 0 {
            num_cpus::get().max(2)
        } else {
            self.import.max_concurrent_chunks
        };
        ImportEngineConfig {
            max_concurrent_chunks: max_concurrent,
            chunk_days: self.import.chunk_days,
            chunk_symbols: self.import.chunk_symbols,
            max_attempts: self.import.max_attempts,
            retry_backoff: Duration::from_millis(self.import.retry_backoff_ms),
            fetch_timeout: Duration::from_secs(self.import.fetch_timeout_secs),
            drain_timeout: Duration::from_secs(self.import.drain_timeout_secs),
        }
    }
}

/// 生成默认配置文件
pub fn generate_default_config_file(path: impl AsRef<Path>) -> Result<()> {
    HubConfig::default().save(path)
}
