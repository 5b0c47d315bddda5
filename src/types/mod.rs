//! QuantHub 核心数据类型模块
//!
//! 采集管线使用的统一数据结构：资产分类、数据类别、规范化行情记录
//! 使用高精度Decimal类型避免浮点误差，确保金融数据的准确性

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display};

/// 插件唯一标识符
pub type PluginId = String;

/// 导入任务唯一标识符
pub type TaskId = String;

/// 毫秒时间戳
pub type TimestampMs = i64;

/// 资产类别 - 用于存储分区
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    /// 国内股票
    Stock,
    /// 加密货币
    Crypto,
    /// 期货
    Futures,
    /// 外汇
    Forex,
    /// 债券
    Bond,
    /// 国际市场
    International,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Stock => "stock",
            AssetClass::Crypto => "crypto",
            AssetClass::Futures => "futures",
            AssetClass::Forex => "forex",
            AssetClass::Bond => "bond",
            AssetClass::International => "international",
        }
    }

    /// 所有资产类别
    pub fn all() -> [AssetClass; 6] {
        [
            AssetClass::Stock,
            AssetClass::Crypto,
            AssetClass::Futures,
            AssetClass::Forex,
            AssetClass::Bond,
            AssetClass::International,
        ]
    }
}

impl Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 逻辑数据类别 - 路由回退链以此为键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    /// 证券列表
    StockList,
    /// K线数据
    Kline,
    /// 实时行情
    Realtime,
    /// 基本面数据
    Fundamental,
}

impl DataCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::StockList => "stock_list",
            DataCategory::Kline => "kline",
            DataCategory::Realtime => "realtime",
            DataCategory::Fundamental => "fundamental",
        }
    }
}

impl Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 存储行的唯一键：同一键永远不会出现两条存活记录
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub symbol: String,
    pub timestamp: TimestampMs,
    pub data_type: DataCategory,
}

/// 规范化行情记录
///
/// 所有插件的fetch操作统一返回该结构，至少携带symbol和timestamp；
/// OHLCV字段仅对K线/实时类数据有意义，其余数据放入extra
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketRecord {
    /// 交易代码
    pub symbol: String,
    /// 数据时间戳（毫秒）
    pub timestamp: TimestampMs,
    /// 数据类别
    pub data_type: DataCategory,
    /// 开盘价
    pub open: Option<Decimal>,
    /// 最高价
    pub high: Option<Decimal>,
    /// 最低价
    pub low: Option<Decimal>,
    /// 收盘价
    pub close: Option<Decimal>,
    /// 成交量
    pub volume: Option<Decimal>,
    /// 附加字段（名称、市值等非标准列）
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl MarketRecord {
    /// 创建仅有键字段的记录
    pub fn new(symbol: impl Into<String>, timestamp: TimestampMs, data_type: DataCategory) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            data_type,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            extra: HashMap::new(),
        }
    }

    /// 去重键
    pub fn key(&self) -> RecordKey {
        RecordKey {
            symbol: self.symbol.clone(),
            timestamp: self.timestamp,
            data_type: self.data_type,
        }
    }
}

/// 日期范围（闭区间）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// 按天数切分为有界窗口，用于分块请求
    pub fn windows(&self, days: i64) -> Vec<DateRange> {
        let mut result = Vec::new();
        if self.end < self.start || days <= 0 {
            return result;
        }
        let mut cursor = self.start;
        while cursor <= self.end {
            let window_end = std::cmp::min(cursor + chrono::Duration::days(days - 1), self.end);
            result.push(DateRange::new(cursor, window_end));
            cursor = window_end + chrono::Duration::days(1);
        }
        result
    }
}

/// 导入调度模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// 阻塞直到返回ImportResult
    Sync,
    /// 立即返回，结果通过事件总线投递
    Async,
}

/// 导入任务 - 由调用方创建，被导入引擎消费恰好一次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportTask {
    /// 任务ID
    pub task_id: TaskId,
    /// 数据类别
    pub data_type: DataCategory,
    /// 目标资产类别
    pub asset_class: AssetClass,
    /// 市场标识
    pub market: String,
    /// 目标代码集合
    pub symbols: BTreeSet<String>,
    /// 日期范围（K线/基本面任务使用）
    pub date_range: Option<DateRange>,
    /// 指定提供者（可选，不可用时回退到路由链）
    pub requested_provider: Option<PluginId>,
    /// 调度模式
    pub mode: ImportMode,
}

impl ImportTask {
    pub fn new(data_type: DataCategory, asset_class: AssetClass) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            data_type,
            asset_class,
            market: "default".to_string(),
            symbols: BTreeSet::new(),
            date_range: None,
            requested_provider: None,
            mode: ImportMode::Sync,
        }
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_date_range(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.date_range = Some(DateRange::new(start, end));
        self
    }

    pub fn with_provider(mut self, provider: impl Into<PluginId>) -> Self {
        self.requested_provider = Some(provider.into());
        self
    }

    pub fn with_mode(mut self, mode: ImportMode) -> Self {
        self.mode = mode;
        self
    }
}

/// 单个分块的执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
    /// 分块序号（派发顺序）
    pub chunk_index: usize,
    /// 分块描述（代码/日期窗口）
    pub label: String,
    /// 写入行数
    pub rows_written: usize,
    /// 去重行数
    pub rows_deduplicated: usize,
    /// 实际尝试次数
    pub attempts: u32,
    /// 最终失败原因
    pub error: Option<String>,
}

impl ChunkResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// 导入结果 - 返回给调用方并发布到事件总线
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    /// 任务ID
    pub task_id: TaskId,
    /// 写入总行数
    pub rows_written: usize,
    /// 去重总行数（任务内重复 + 幂等重导入命中）
    pub rows_deduplicated: usize,
    /// 是否全部分块成功
    pub succeeded: bool,
    /// 整体失败原因
    pub error: Option<String>,
    /// 各分块结果（按派发顺序）
    pub per_chunk_results: Vec<ChunkResult>,
}

impl ImportResult {
    /// 提交阶段即失败的结果（未执行任何分块）
    pub fn failed(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            rows_written: 0,
            rows_deduplicated: 0,
            succeeded: false,
            error: Some(error.into()),
            per_chunk_results: Vec::new(),
        }
    }
}
