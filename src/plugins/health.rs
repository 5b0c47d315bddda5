//! 插件健康监控器
//!
//! 为每个已注册插件维护一份健康记录，状态只通过监控器介导的探测迁移，
//! 外部代码不直接改写健康状态。探测自身的失败或异常从不向外传播，
//! 一律转化为状态迁移加last_error记录

use super::registry::PluginRegistry;
use crate::core::event_bus::{event_types, Event, EventBus};
use crate::types::{PluginId, TimestampMs};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 插件健康状态机
///
/// `Uninitialized → Initializing → {Healthy, Failed}`；
/// Healthy下探测失败1次进入Degraded，连续失败达到阈值进入Quarantined；
/// Degraded/Quarantined下单次探测成功直接回到Healthy；
/// Failed只能通过手动重新启用脱离
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Uninitialized,
    Initializing,
    Healthy,
    Degraded,
    Quarantined,
    Failed,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Uninitialized => "uninitialized",
            HealthState::Initializing => "initializing",
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Quarantined => "quarantined",
            HealthState::Failed => "failed",
        }
    }

    /// 该状态下插件可被路由使用
    pub fn is_usable(&self) -> bool {
        matches!(self, HealthState::Healthy | HealthState::Degraded)
    }
}

/// 健康记录 - 每个已注册插件一份，仅由监控器迁移
#[derive(Debug, Clone)]
pub struct HealthRecord {
    /// 插件ID
    pub plugin_id: PluginId,
    /// 当前状态
    pub state: HealthState,
    /// 最后探测时间
    pub last_checked_at: TimestampMs,
    /// 连续失败次数
    pub consecutive_failures: u32,
    /// 最后错误
    pub last_error: Option<String>,
    /// 最后探测响应耗时（毫秒）
    pub response_time_ms: u64,
    /// 进入隔离的时间点（冷却窗口计时）
    quarantined_at: Option<Instant>,
}

impl HealthRecord {
    fn new(plugin_id: PluginId) -> Self {
        Self {
            plugin_id,
            state: HealthState::Uninitialized,
            last_checked_at: 0,
            consecutive_failures: 0,
            last_error: None,
            response_time_ms: 0,
            quarantined_at: None,
        }
    }
}

/// 健康监控配置
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// 连续失败进入隔离的阈值
    pub quarantine_threshold: u32,
    /// 隔离冷却窗口
    pub quarantine_cooldown: Duration,
    /// 周期探测间隔
    pub check_interval: Duration,
    /// 单次探测超时
    pub check_timeout: Duration,
    /// 初始化超时
    pub init_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            quarantine_threshold: 3,
            quarantine_cooldown: Duration::from_secs(60),
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(10),
            init_timeout: Duration::from_secs(30),
        }
    }
}

/// 单次探测的归一化结果
enum ProbeOutcome {
    Success { response_time_ms: u64 },
    Failure { message: String },
}

/// 插件健康监控器
pub struct PluginHealthMonitor {
    /// 插件注册表
    registry: Arc<PluginRegistry>,
    /// 健康记录表
    records: Arc<RwLock<HashMap<PluginId, HealthRecord>>>,
    /// 正在探测中的插件（同一插件同一时刻最多一次探测在途）
    in_flight: parking_lot::Mutex<HashSet<PluginId>>,
    /// 配置
    config: HealthMonitorConfig,
    /// 事件总线
    event_bus: Arc<EventBus>,
    /// 周期探测取消令牌
    cancel: CancellationToken,
}

impl PluginHealthMonitor {
    pub fn new(
        registry: Arc<PluginRegistry>,
        event_bus: Arc<EventBus>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            registry,
            records: Arc::new(RwLock::new(HashMap::new())),
            in_flight: parking_lot::Mutex::new(HashSet::new()),
            config,
            event_bus,
            cancel: CancellationToken::new(),
        }
    }

    /// 初始化单个插件并建立健康记录
    ///
    /// initialize出错或返回false都直接进入Failed，错误被捕获而不是抛出；
    /// 返回最终到达的状态
    pub async fn initialize_plugin(
        &self,
        plugin_id: &str,
        config: &HashMap<String, serde_json::Value>,
    ) -> Result<HealthState> {
        self.ensure_record(plugin_id).await;
        self.transition(plugin_id, HealthState::Initializing, None).await;

        let instance = match self.registry.get(plugin_id).await {
            Ok(instance) => instance,
            Err(e) => {
                self.transition(plugin_id, HealthState::Failed, Some(e.to_string())).await;
                return Ok(HealthState::Failed);
            }
        };

        let init_result = tokio::time::timeout(self.config.init_timeout, async {
            let mut plugin = instance.write().await;
            plugin.initialize(config).await
        })
        .await;

        let state = match init_result {
            Ok(Ok(true)) => {
                info!("Plugin '{}' initialized successfully", plugin_id);
                self.transition(plugin_id, HealthState::Healthy, None).await;
                HealthState::Healthy
            }
            Ok(Ok(false)) => {
                warn!("Plugin '{}' initialize returned false", plugin_id);
                self.transition(
                    plugin_id,
                    HealthState::Failed,
                    Some("initialize returned false".to_string()),
                )
                .await;
                HealthState::Failed
            }
            Ok(Err(e)) => {
                warn!("Plugin '{}' initialization failed: {}", plugin_id, e);
                self.transition(plugin_id, HealthState::Failed, Some(e.to_string())).await;
                HealthState::Failed
            }
            Err(_) => {
                warn!("Plugin '{}' initialization timed out", plugin_id);
                self.transition(
                    plugin_id,
                    HealthState::Failed,
                    Some("initialization timed out".to_string()),
                )
                .await;
                HealthState::Failed
            }
        };
        Ok(state)
    }

    /// 初始化全部启用的插件
    pub async fn initialize_all(
        &self,
        plugin_configs: &HashMap<PluginId, HashMap<String, serde_json::Value>>,
    ) -> Result<()> {
        let empty = HashMap::new();
        for descriptor in self.registry.descriptors().await {
            if !descriptor.enabled {
                self.ensure_record(&descriptor.id).await;
                continue;
            }
            let config = plugin_configs.get(&descriptor.id).unwrap_or(&empty);
            self.initialize_plugin(&descriptor.id, config).await?;
        }
        Ok(())
    }

    /// 探测单个插件并迁移状态，返回探测后的状态
    ///
    /// Failed/未初始化的插件不参与探测；隔离中的插件在冷却窗口内跳过，
    /// 窗口结束后恰好放行一次探测
    pub async fn check_plugin(&self, plugin_id: &str) -> Option<HealthState> {
        let current = {
            let records = self.records.read().await;
            records.get(plugin_id)?.clone()
        };

        match current.state {
            HealthState::Uninitialized | HealthState::Initializing | HealthState::Failed => {
                return Some(current.state);
            }
            HealthState::Quarantined => {
                if let Some(at) = current.quarantined_at {
                    if at.elapsed() < self.config.quarantine_cooldown {
                        debug!("Plugin '{}' quarantined, cooldown not elapsed", plugin_id);
                        return Some(HealthState::Quarantined);
                    }
                }
            }
            _ => {}
        }

        // 同一插件不允许并发探测
        {
            let mut in_flight = self.in_flight.lock();
            if !in_flight.insert(plugin_id.to_string()) {
                return Some(current.state);
            }
        }

        let outcome = self.probe(plugin_id).await;
        let new_state = self.apply_probe_outcome(plugin_id, outcome).await;

        self.in_flight.lock().remove(plugin_id);
        new_state
    }

    /// 探测全部插件
    pub async fn run_checks(&self) {
        let ids: Vec<PluginId> = {
            let records = self.records.read().await;
            records.keys().cloned().collect()
        };
        for id in ids {
            self.check_plugin(&id).await;
        }
    }

    /// 启动周期探测任务
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        let interval = self.config.check_interval;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Health check loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor.run_checks().await;
                    }
                }
            }
        })
    }

    /// 停止周期探测
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// 查询插件当前状态
    pub async fn state_of(&self, plugin_id: &str) -> Option<HealthState> {
        let records = self.records.read().await;
        records.get(plugin_id).map(|r| r.state)
    }

    /// 插件当前是否可被路由使用
    pub async fn is_usable(&self, plugin_id: &str) -> bool {
        self.state_of(plugin_id).await.map(|s| s.is_usable()).unwrap_or(false)
    }

    /// 全部健康记录快照
    pub async fn health_snapshot(&self) -> Vec<HealthRecord> {
        let records = self.records.read().await;
        records.values().cloned().collect()
    }

    /// 手动重新启用后重走初始化（Failed状态的唯一出口）
    pub async fn reinitialize_plugin(
        &self,
        plugin_id: &str,
        config: &HashMap<String, serde_json::Value>,
    ) -> Result<HealthState> {
        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(plugin_id) {
                record.state = HealthState::Uninitialized;
                record.consecutive_failures = 0;
                record.last_error = None;
                record.quarantined_at = None;
            }
        }
        self.initialize_plugin(plugin_id, config).await
    }

    // 私有辅助方法

    async fn ensure_record(&self, plugin_id: &str) {
        let mut records = self.records.write().await;
        records
            .entry(plugin_id.to_string())
            .or_insert_with(|| HealthRecord::new(plugin_id.to_string()));
    }

    /// 初始化路径的直接状态迁移
    async fn transition(&self, plugin_id: &str, new_state: HealthState, error: Option<String>) {
        let old_state = {
            let mut records = self.records.write().await;
            let record = match records.get_mut(plugin_id) {
                Some(record) => record,
                None => return,
            };
            let old_state = record.state;
            record.state = new_state;
            record.last_checked_at = chrono::Utc::now().timestamp_millis();
            if new_state == HealthState::Healthy {
                record.consecutive_failures = 0;
                record.last_error = None;
                record.quarantined_at = None;
            } else if error.is_some() {
                record.last_error = error;
            }
            old_state
        };
        self.publish_change(plugin_id, old_state, new_state).await;
    }

    /// 状态发生变化时记录日志并广播plugin.health_changed
    async fn publish_change(&self, plugin_id: &str, old_state: HealthState, new_state: HealthState) {
        if old_state == new_state {
            return;
        }
        info!(
            "Plugin '{}' health: {} -> {}",
            plugin_id,
            old_state.as_str(),
            new_state.as_str()
        );
        self.event_bus
            .publish(Event::new(
                event_types::PLUGIN_HEALTH_CHANGED,
                "health_monitor",
                serde_json::json!({
                    "plugin_id": plugin_id,
                    "old_state": old_state.as_str(),
                    "new_state": new_state.as_str(),
                }),
            ))
            .await;
    }

    /// 执行一次探测并捕获所有失败形态
    async fn probe(&self, plugin_id: &str) -> ProbeOutcome {
        let instance = match self.registry.get(plugin_id).await {
            Ok(instance) => instance,
            Err(e) => return ProbeOutcome::Failure { message: e.to_string() },
        };

        let started = Instant::now();
        let result = tokio::time::timeout(self.config.check_timeout, async {
            let plugin = instance.read().await;
            plugin.health_check().await
        })
        .await;

        match result {
            Ok(Ok(health)) if health.is_healthy => ProbeOutcome::Success {
                response_time_ms: health.response_time_ms,
            },
            Ok(Ok(health)) => ProbeOutcome::Failure { message: health.message },
            Ok(Err(e)) => ProbeOutcome::Failure { message: e.to_string() },
            Err(_) => ProbeOutcome::Failure {
                message: format!("health check timed out after {:?}", started.elapsed()),
            },
        }
    }

    async fn apply_probe_outcome(
        &self,
        plugin_id: &str,
        outcome: ProbeOutcome,
    ) -> Option<HealthState> {
        let (old_state, new_state) = {
            let mut records = self.records.write().await;
            let record = records.get_mut(plugin_id)?;
            let old_state = record.state;
            record.last_checked_at = chrono::Utc::now().timestamp_millis();

            match outcome {
                ProbeOutcome::Success { response_time_ms } => {
                    record.state = HealthState::Healthy;
                    record.consecutive_failures = 0;
                    record.last_error = None;
                    record.response_time_ms = response_time_ms;
                    record.quarantined_at = None;
                }
                ProbeOutcome::Failure { message } => {
                    record.consecutive_failures += 1;
                    record.last_error = Some(message);
                    if record.consecutive_failures >= self.config.quarantine_threshold {
                        record.state = HealthState::Quarantined;
                        record.quarantined_at = Some(Instant::now());
                    } else if old_state == HealthState::Healthy {
                        record.state = HealthState::Degraded;
                    } else if old_state == HealthState::Quarantined {
                        // 放行的探测失败，重开冷却窗口
                        record.quarantined_at = Some(Instant::now());
                    }
                }
            }
            (old_state, record.state)
        };

        self.publish_change(plugin_id, old_state, new_state).await;
        Some(new_state)
    }
}
