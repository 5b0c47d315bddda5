//! 资产分区存储
//!
//! 每个资产类别一个SQLite分区文件，连接按路径池化。写入走
//! spawn_blocking并由路径级写锁串行化；读取可并发。去重由
//! `(symbol, timestamp, data_type)`主键上的INSERT OR IGNORE保证，
//! 同一逻辑行重复写入不产生重复存储行

use crate::types::{AssetClass, DataCategory, DateRange, MarketRecord, TimestampMs};
use crate::{QuantHubError, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 数据库连接池类型
pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS market_records (
    symbol      TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,
    data_type   TEXT NOT NULL,
    open        TEXT,
    high        TEXT,
    low         TEXT,
    close       TEXT,
    volume      TEXT,
    extra       TEXT,
    PRIMARY KEY (symbol, timestamp, data_type)
);
CREATE INDEX IF NOT EXISTS idx_market_records_type_time
    ON market_records (data_type, timestamp);
";

/// 单个资产分区的存储句柄
///
/// 同一路径同一时刻最多一个活跃写入者：写操作持有write_lock，
/// 后续写入者阻塞直到前一个释放
pub struct AssetDatabase {
    /// 所属资产类别
    asset_class: AssetClass,
    /// 分区文件路径
    path: PathBuf,
    /// 连接池
    pool: DbPool,
    /// 路径级写锁
    write_lock: tokio::sync::Mutex<()>,
}

impl AssetDatabase {
    /// 打开分区文件；结构性损坏时隔离重建
    ///
    /// 损坏的文件被重命名为带时间戳的备份路径，在原路径重建空库，
    /// 返回可用句柄与备份路径——单个损坏分区永远不会阻塞启动
    pub fn open(asset_class: AssetClass, path: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut quarantined_backup = None;
        let pool = match Self::try_open(path) {
            Ok(pool) => pool,
            Err(e) if path.exists() => {
                let backup = Self::quarantine_path(path);
                warn!(
                    "Storage file {:?} failed to open ({}), quarantining to {:?}",
                    path, e, backup
                );
                std::fs::rename(path, &backup)?;
                quarantined_backup = Some(backup);
                Self::try_open(path)?
            }
            Err(e) => return Err(e),
        };

        info!("Asset partition '{}' opened at {:?}", asset_class, path);
        Ok((
            Self {
                asset_class,
                path: path.to_path_buf(),
                pool,
                write_lock: tokio::sync::Mutex::new(()),
            },
            quarantined_backup,
        ))
    }

    fn try_open(path: &Path) -> Result<DbPool> {
        let manager = SqliteConnectionManager::file(path);
        let pool = r2d2::Pool::builder().max_size(4).build(manager)?;
        let conn = pool.get()?;

        // SQLite打开是惰性的，结构性损坏要靠完整性检查暴露
        let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            return Err(QuantHubError::StorageCorruption { path: path.display().to_string() });
        }
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(pool)
    }

    fn quarantine_path(path: &Path) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        PathBuf::from(format!("{}.corrupted_backup_{}", path.display(), stamp))
    }

    pub fn asset_class(&self) -> AssetClass {
        self.asset_class
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 幂等写入一批记录，返回(写入行数, 去重行数)
    ///
    /// 整批在单事务内完成；已存在的键被INSERT OR IGNORE跳过并计入去重
    pub async fn write_records(&self, records: Vec<MarketRecord>) -> Result<(usize, usize)> {
        if records.is_empty() {
            return Ok((0, 0));
        }

        let _writer = self.write_lock.lock().await;
        let pool = self.pool.clone();

        let (written, deduplicated) = tokio::task::spawn_blocking(move || -> Result<(usize, usize)> {
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            let mut written = 0usize;
            let mut deduplicated = 0usize;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO market_records \
                     (symbol, timestamp, data_type, open, high, low, close, volume, extra) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for record in &records {
                    let extra = if record.extra.is_empty() {
                        None
                    } else {
                        Some(serde_json::to_string(&record.extra)?)
                    };
                    let changed = stmt.execute(params![
                        record.symbol,
                        record.timestamp,
                        record.data_type.as_str(),
                        record.open.map(|d| d.to_string()),
                        record.high.map(|d| d.to_string()),
                        record.low.map(|d| d.to_string()),
                        record.close.map(|d| d.to_string()),
                        record.volume.map(|d| d.to_string()),
                        extra,
                    ])?;
                    if changed == 1 {
                        written += 1;
                    } else {
                        deduplicated += 1;
                    }
                }
            }
            tx.commit()?;
            Ok((written, deduplicated))
        })
        .await
        .map_err(|e| QuantHubError::internal(format!("db write task panicked: {}", e)))??;

        debug!(
            "Partition '{}': {} rows written, {} deduplicated",
            self.asset_class, written, deduplicated
        );
        Ok((written, deduplicated))
    }

    /// 查询指定代码在日期范围内已存储的K线
    pub async fn query_klines(&self, symbol: &str, range: &DateRange) -> Result<Vec<MarketRecord>> {
        let pool = self.pool.clone();
        let symbol = symbol.to_string();
        let start_ms = range
            .start
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or(0);
        let end_ms = range
            .end
            .and_hms_opt(23, 59, 59)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or(i64::MAX);

        tokio::task::spawn_blocking(move || -> Result<Vec<MarketRecord>> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare_cached(
                "SELECT symbol, timestamp, data_type, open, high, low, close, volume, extra \
                 FROM market_records \
                 WHERE symbol = ?1 AND data_type = 'kline' AND timestamp BETWEEN ?2 AND ?3 \
                 ORDER BY timestamp",
            )?;
            let rows = stmt.query_map(params![symbol, start_ms, end_ms], row_to_record)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await
        .map_err(|e| QuantHubError::internal(format!("db query task panicked: {}", e)))?
    }

    /// 统计某数据类别的存储行数
    pub async fn count_records(&self, data_type: DataCategory) -> Result<u64> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let conn = pool.get()?;
            let count: u64 = conn.query_row(
                "SELECT COUNT(*) FROM market_records WHERE data_type = ?1",
                params![data_type.as_str()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
        .map_err(|e| QuantHubError::internal(format!("db count task panicked: {}", e)))?
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MarketRecord> {
    let data_type: String = row.get(2)?;
    let data_type = match data_type.as_str() {
        "stock_list" => DataCategory::StockList,
        "realtime" => DataCategory::Realtime,
        "fundamental" => DataCategory::Fundamental,
        _ => DataCategory::Kline,
    };

    let parse_decimal = |value: Option<String>| {
        value.and_then(|s| rust_decimal::Decimal::from_str(&s).ok())
    };

    let extra: Option<String> = row.get(8)?;
    let extra: HashMap<String, serde_json::Value> = extra
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    let timestamp: TimestampMs = row.get(1)?;
    Ok(MarketRecord {
        symbol: row.get(0)?,
        timestamp,
        data_type,
        open: parse_decimal(row.get(3)?),
        high: parse_decimal(row.get(4)?),
        low: parse_decimal(row.get(5)?),
        close: parse_decimal(row.get(6)?),
        volume: parse_decimal(row.get(7)?),
        extra,
    })
}

/// 供测试与路由器共享的句柄类型
pub type AssetDatabaseHandle = Arc<AssetDatabase>;
