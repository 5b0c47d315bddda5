//! QuantHub 错误处理系统
//!
//! 统一的错误类型和错误处理机制：插件可恢复的故障在组件内部消化，
//! 只有不存在可用路径的错误才返回给调用方

use crate::types::{DataCategory, PluginId};
use thiserror::Error;

/// 框架统一错误类型
#[derive(Error, Debug)]
pub enum QuantHubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {message}")]
    Config { message: String },

    #[error("Plugin '{plugin_id}' initialization failed: {message}")]
    PluginInit { plugin_id: PluginId, message: String },

    #[error("Plugin '{plugin_id}' not found")]
    PluginNotFound { plugin_id: PluginId },

    #[error("Plugin '{plugin_id}' already registered")]
    PluginAlreadyRegistered { plugin_id: PluginId },

    #[error("Plugin '{plugin_id}' is disabled")]
    PluginDisabled { plugin_id: PluginId },

    #[error("Operation '{category}' not supported by this plugin")]
    OperationUnsupported { category: DataCategory },

    #[error("NoProviderAvailable")]
    NoProviderAvailable { category: DataCategory },

    #[error("Import chunk '{label}' failed: {message}")]
    ChunkFailed { label: String, message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage file corrupted: {path}")]
    StorageCorruption { path: String },

    #[error("Event bus error: {message}")]
    EventBus { message: String },

    #[error("Shutdown already in progress, task rejected")]
    ShutdownInProgress,

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl QuantHubError {
    /// 创建配置相关错误
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// 创建存储相关错误
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// 创建网络相关错误
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// 创建内部错误
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }
}

impl From<rusqlite::Error> for QuantHubError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage { message: e.to_string() }
    }
}

impl From<r2d2::Error> for QuantHubError {
    fn from(e: r2d2::Error) -> Self {
        Self::Storage { message: e.to_string() }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, QuantHubError>;
