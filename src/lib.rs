//! # QuantHub
//!
//! 可插拔的多市场行情数据采集管线：
//!
//! - **插件层**: 数据源以静态清单注册，能力契约由trait完整约束
//! - **健康层**: 状态机驱动的提供者健康监控，失败自动降级与隔离
//! - **路由层**: 按数据类别的有序回退链，永远优先健康的提供者
//! - **存储层**: 按资产类别分区的SQLite存储，键级幂等写入
//! - **导入层**: 分块并发、退避重试、任务级去重的导入引擎
//! - **事件层**: 组件间经事件总线解耦，订阅通过显式句柄管理
//!
//! 所有组件由[`HubContext`]显式组装，停机由协调器按注册逆序清理

pub mod config;
pub mod context;
pub mod core;
pub mod data;
pub mod error;
pub mod plugins;
pub mod services;
pub mod storage;
pub mod types;

pub use config::HubConfig;
pub use context::HubContext;
pub use error::{QuantHubError, Result};

/// 框架版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 框架名称
pub const FRAMEWORK_NAME: &str = "QuantHub";

/// 按配置初始化日志系统
///
/// 进程内只应调用一次；RUST_LOG环境变量优先于配置的级别
pub fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
