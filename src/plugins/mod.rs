//! 可插拔数据源层
//!
//! 能力契约、清单注册、健康状态机与回退路由

pub mod core;
pub mod health;
pub mod registry;
pub mod router;

pub use self::core::{
    DataSourcePlugin, HealthResult, PluginDescriptor, PluginFactory, PluginInfo, PluginManifest,
};
pub use health::{HealthMonitorConfig, HealthRecord, HealthState, PluginHealthMonitor};
pub use registry::{
    EnabledStateStore, JsonFileStateStore, MemoryStateStore, PluginHandle, PluginRegistry,
    RegistryStats,
};
pub use router::{DataSourceRouter, FallbackChain};
