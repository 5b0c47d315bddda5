//! 存储路由器
//!
//! 把(资产类别, 市场)映射到确定性的分区文件路径，并池化已打开的
//! 句柄：同一路径全进程共享同一个AssetDatabase。打开动作被单把
//! 门锁串行化，避免并发首次访问对同一文件重复建库

use super::database::{AssetDatabase, AssetDatabaseHandle};
use crate::core::event_bus::{event_types, Event, EventBus};
use crate::types::AssetClass;
use crate::{QuantHubError, Result};
use dashmap::DashMap;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// 记录的存储位置
#[derive(Debug, Clone)]
pub struct AssetLocation {
    pub asset_class: AssetClass,
    pub market: String,
    pub storage_path: PathBuf,
}

/// 资产库路由器
pub struct AssetDatabaseRouter {
    /// 分区文件根目录
    base_path: PathBuf,
    /// 已打开句柄池，按路径索引
    handles: DashMap<PathBuf, AssetDatabaseHandle>,
    /// 打开门锁
    open_gate: tokio::sync::Mutex<()>,
    /// 事件总线
    event_bus: Arc<EventBus>,
}

impl AssetDatabaseRouter {
    pub fn new(base_path: impl Into<PathBuf>, event_bus: Arc<EventBus>) -> Self {
        Self {
            base_path: base_path.into(),
            handles: DashMap::new(),
            open_gate: tokio::sync::Mutex::new(()),
            event_bus,
        }
    }

    /// 解析存储位置：`<base>/<asset_class>/<asset_class>_data.db`
    ///
    /// 同一资产类别的所有市场共享一个分区文件，market只参与定位语义
    pub fn locate(&self, asset_class: AssetClass, market: &str) -> AssetLocation {
        let storage_path = self
            .base_path
            .join(asset_class.as_str())
            .join(format!("{}_data.db", asset_class.as_str()));
        AssetLocation {
            asset_class,
            market: market.to_string(),
            storage_path,
        }
    }

    /// 获取(资产类别, 市场)对应的存储句柄，必要时打开
    ///
    /// 首次打开遇到损坏文件时隔离重建并广播storage.quarantined，
    /// 调用方总是拿到可用句柄
    pub async fn handle_for(
        &self,
        asset_class: AssetClass,
        market: &str,
    ) -> Result<AssetDatabaseHandle> {
        let location = self.locate(asset_class, market);
        if let Some(handle) = self.handles.get(&location.storage_path) {
            return Ok(handle.clone());
        }

        let _gate = self.open_gate.lock().await;
        // 门锁内二次检查：竞争者可能已完成打开
        if let Some(handle) = self.handles.get(&location.storage_path) {
            return Ok(handle.clone());
        }

        let path = location.storage_path.clone();
        let (db, quarantined_backup) =
            tokio::task::spawn_blocking(move || AssetDatabase::open(asset_class, &path))
                .await
                .map_err(|e| QuantHubError::internal(format!("db open task panicked: {}", e)))??;

        let handle = Arc::new(db);
        self.handles.insert(location.storage_path.clone(), handle.clone());

        if let Some(backup) = quarantined_backup {
            warn!(
                "Corrupted storage for '{}' quarantined, fresh partition created at {:?}",
                asset_class, location.storage_path
            );
            self.event_bus
                .publish(Event::new(
                    event_types::STORAGE_QUARANTINED,
                    "asset_db_router",
                    json!({
                        "asset_class": asset_class.as_str(),
                        "path": location.storage_path.display().to_string(),
                        "backup": backup.display().to_string(),
                    }),
                ))
                .await;
        }

        Ok(handle)
    }

    /// 当前已打开的分区数
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// 关闭全部句柄（停机清理），返回关闭数量
    ///
    /// 连接池随句柄最后一个Arc释放而关闭；仍被导入任务持有的句柄
    /// 在任务结束后关闭
    pub async fn close_all(&self) -> usize {
        let count = self.handles.len();
        self.handles.clear();
        info!("Storage router released {} partition handle(s)", count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_bus::EventHandler;
    use crate::types::{DataCategory, MarketRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn router(temp: &TempDir) -> AssetDatabaseRouter {
        AssetDatabaseRouter::new(temp.path(), Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn test_locate_is_deterministic() {
        let temp = TempDir::new().unwrap();
        let router = router(&temp);

        let loc = router.locate(AssetClass::Stock, "SSE");
        assert_eq!(
            loc.storage_path,
            temp.path().join("stock").join("stock_data.db")
        );
        // 同类别不同市场共享分区
        let loc2 = router.locate(AssetClass::Stock, "SZSE");
        assert_eq!(loc.storage_path, loc2.storage_path);
    }

    #[tokio::test]
    async fn test_handle_is_shared_per_path() {
        let temp = TempDir::new().unwrap();
        let router = router(&temp);

        let h1 = router.handle_for(AssetClass::Crypto, "binance").await.unwrap();
        let h2 = router.handle_for(AssetClass::Crypto, "okx").await.unwrap();
        assert!(Arc::ptr_eq(&h1, &h2));
        assert_eq!(router.open_handles(), 1);

        router.handle_for(AssetClass::Forex, "global").await.unwrap();
        assert_eq!(router.open_handles(), 2);

        assert_eq!(router.close_all().await, 2);
        assert_eq!(router.open_handles(), 0);
    }

    struct QuarantineCounter {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for QuarantineCounter {
        async fn handle(&self, _event: &Event) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "quarantine_counter"
        }
    }

    #[tokio::test]
    async fn test_corrupted_partition_quarantined_with_event() {
        let temp = TempDir::new().unwrap();
        let event_bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        event_bus
            .subscribe(
                event_types::STORAGE_QUARANTINED,
                Arc::new(QuarantineCounter { count: count.clone() }),
            )
            .await;
        let router = AssetDatabaseRouter::new(temp.path(), event_bus);

        let path = router.locate(AssetClass::Futures, "CFFEX").storage_path;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"garbage, not a database").unwrap();

        // 调用方拿到的句柄必须立即可写
        let handle = router.handle_for(AssetClass::Futures, "CFFEX").await.unwrap();
        let record = MarketRecord::new("IF2406", 1_700_000_000_000, DataCategory::Kline);
        let (written, _) = handle.write_records(vec![record]).await.unwrap();
        assert_eq!(written, 1);

        assert_eq!(count.load(Ordering::SeqCst), 1);

        // 原文件以备份形式保留
        let backups: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupted_backup_"))
            .collect();
        assert_eq!(backups.len(), 1);
    }
}
