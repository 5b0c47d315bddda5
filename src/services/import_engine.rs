//! 数据导入引擎
//!
//! 消费导入任务：解析提供者、切分分块、并发拉取、幂等写入分区存储。
//! 分块粒度按数据类别决定——K线按(代码 × 日期窗口)，快照类按代码分组，
//! 证券列表整体一块。并发由信号量限流，单块失败走指数退避重试，
//! 重试耗尽只标记该分块失败，不中断其余分块。
//! 任务级去重集合在写库之前吸收同任务内的重复键，已落库的键由存储层
//! INSERT OR IGNORE兜底，重导入同一范围不会产生重复行

use crate::core::event_bus::{event_types, Event, EventBus};
use crate::plugins::{DataSourceRouter, PluginHandle, PluginHealthMonitor, PluginRegistry};
use crate::storage::{AssetDatabaseHandle, AssetDatabaseRouter};
use crate::types::{
    ChunkResult, DataCategory, DateRange, ImportMode, ImportResult, ImportTask, MarketRecord,
    RecordKey, TaskId,
};
use crate::{QuantHubError, Result};
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 导入引擎配置
#[derive(Debug, Clone)]
pub struct ImportEngineConfig {
    /// 同时执行的分块上限
    pub max_concurrent_chunks: usize,
    /// K线分块的日期窗口天数
    pub chunk_days: i64,
    /// 快照类分块的代码分组大小
    pub chunk_symbols: usize,
    /// 单分块最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 重试退避基数，第n次重试前等待 base * 2^(n-1)
    pub retry_backoff: Duration,
    /// 单次拉取超时
    pub fetch_timeout: Duration,
    /// 停机排空窗口
    pub drain_timeout: Duration,
}

impl Default for ImportEngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: num_cpus::get().max(2),
            chunk_days: 90,
            chunk_symbols: 50,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            fetch_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// 分块的拉取内容
enum ChunkWork {
    StockList,
    Kline { symbol: String, range: DateRange },
    Snapshot { category: DataCategory, symbols: Vec<String> },
}

/// 提交回执：同步任务携带完整结果，异步任务携带任务ID
#[derive(Debug)]
pub enum ImportSubmission {
    Completed(ImportResult),
    Scheduled(TaskId),
}

impl ImportSubmission {
    /// 同步任务的完整结果；异步提交返回None
    pub fn into_result(self) -> Option<ImportResult> {
        match self {
            ImportSubmission::Completed(result) => Some(result),
            ImportSubmission::Scheduled(_) => None,
        }
    }
}

/// 一个待执行的分块
struct ChunkSpec {
    index: usize,
    label: String,
    work: ChunkWork,
}

/// 数据导入引擎
pub struct ImportEngine {
    router: Arc<DataSourceRouter>,
    registry: Arc<PluginRegistry>,
    monitor: Arc<PluginHealthMonitor>,
    storage: Arc<AssetDatabaseRouter>,
    event_bus: Arc<EventBus>,
    config: ImportEngineConfig,
    /// 分块并发限流
    semaphore: Arc<Semaphore>,
    /// 是否接受新任务（排空后关闭）
    accepting: AtomicBool,
    /// 在途任务数
    in_flight: Arc<AtomicUsize>,
    /// 各任务的取消令牌
    cancellations: DashMap<TaskId, CancellationToken>,
}

impl ImportEngine {
    pub fn new(
        router: Arc<DataSourceRouter>,
        registry: Arc<PluginRegistry>,
        monitor: Arc<PluginHealthMonitor>,
        storage: Arc<AssetDatabaseRouter>,
        event_bus: Arc<EventBus>,
        config: ImportEngineConfig,
    ) -> Self {
        let permits = config.max_concurrent_chunks.max(1);
        Self {
            router,
            registry,
            monitor,
            storage,
            event_bus,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            accepting: AtomicBool::new(true),
            in_flight: Arc::new(AtomicUsize::new(0)),
            cancellations: DashMap::new(),
        }
    }

    /// 提交任务，调度方式由任务的mode决定
    ///
    /// Sync模式阻塞直到返回完整结果，Async模式立即返回任务ID、结果
    /// 经import.completed事件投递。提供者解析失败、分块失败都表达在
    /// ImportResult里；Err仅用于引擎已进入停机排空的场景
    pub async fn submit(self: &Arc<Self>, task: ImportTask) -> Result<ImportSubmission> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(QuantHubError::ShutdownInProgress);
        }
        if task.mode == ImportMode::Async {
            return Ok(ImportSubmission::Scheduled(self.submit_detached(task)?));
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.clone().run_task(task).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ImportSubmission::Completed(result))
    }

    /// 异步提交：立即返回任务ID，结果通过import.completed事件投递
    pub fn submit_detached(self: &Arc<Self>, task: ImportTask) -> Result<TaskId> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(QuantHubError::ShutdownInProgress);
        }
        let task_id = task.task_id.clone();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let engine = self.clone();
        tokio::spawn(async move {
            engine.clone().run_task(task).await;
            engine.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(task_id)
    }

    /// 取消在途任务；尚未开始的分块不再执行，已开始的分块跑完当前尝试
    pub fn cancel_task(&self, task_id: &str) -> bool {
        if let Some(token) = self.cancellations.get(task_id) {
            token.cancel();
            info!("Import task '{}' cancelled", task_id);
            true
        } else {
            false
        }
    }

    /// 当前在途任务数
    pub fn in_flight_tasks(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// 停机排空：拒绝新任务，等待在途任务结束
    ///
    /// 排空窗口耗尽后取消剩余任务，再短暂等待其退出
    pub async fn drain(&self) -> usize {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;

        while self.in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!("Drain window elapsed with {} task(s) in flight, cancelling", remaining);
            for entry in self.cancellations.iter() {
                entry.value().cancel();
            }
            let grace = tokio::time::Instant::now() + Duration::from_secs(2);
            while self.in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < grace {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        let leaked = self.in_flight.load(Ordering::SeqCst);
        info!("Import engine drained, {} task(s) did not exit in time", leaked);
        leaked
    }

    /// 执行一个任务到结束，发布完成事件并返回结果
    async fn run_task(self: Arc<Self>, task: ImportTask) -> ImportResult {
        let cancel = CancellationToken::new();
        self.cancellations.insert(task.task_id.clone(), cancel.clone());

        let result = self.execute(&task, &cancel).await;

        self.cancellations.remove(&task.task_id);
        // 完成事件携带完整结果，异步调用方只有这一条通道
        let payload = serde_json::to_value(&result)
            .unwrap_or_else(|_| json!({ "task_id": result.task_id }));
        self.event_bus
            .publish(Event::new(event_types::IMPORT_COMPLETED, "import_engine", payload))
            .await;
        result
    }

    async fn execute(&self, task: &ImportTask, cancel: &CancellationToken) -> ImportResult {
        // 提供者解析：指定提供者可用则优先，否则回到回退链
        let provider = match self.resolve_provider(task).await {
            Ok(provider) => provider,
            Err(e) => {
                warn!("Import task '{}' has no provider: {}", task.task_id, e);
                return ImportResult::failed(task.task_id.clone(), e.to_string());
            }
        };

        let plugin = match self.registry.get(&provider).await {
            Ok(plugin) => plugin,
            Err(e) => return ImportResult::failed(task.task_id.clone(), e.to_string()),
        };

        let db = match self.storage.handle_for(task.asset_class, &task.market).await {
            Ok(db) => db,
            Err(e) => return ImportResult::failed(task.task_id.clone(), e.to_string()),
        };

        let chunks = match self.split_chunks(task) {
            Ok(chunks) => chunks,
            Err(e) => return ImportResult::failed(task.task_id.clone(), e.to_string()),
        };
        let chunks_total = chunks.len();
        info!(
            "Import task '{}' ({}/{}) via '{}': {} chunk(s)",
            task.task_id, task.asset_class, task.data_type, provider, chunks_total
        );

        // 任务级去重集合，吸收跨分块的重复键
        let seen: Arc<parking_lot::Mutex<HashSet<RecordKey>>> =
            Arc::new(parking_lot::Mutex::new(HashSet::new()));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut join_set: JoinSet<(usize, ChunkResult)> = JoinSet::new();

        for chunk in chunks {
            let semaphore = self.semaphore.clone();
            let plugin = plugin.clone();
            let db = db.clone();
            let seen = seen.clone();
            let cancel = cancel.clone();
            let completed = completed.clone();
            let event_bus = self.event_bus.clone();
            let config = self.config.clone();
            let task_id = task.task_id.clone();

            join_set.spawn(async move {
                // 信号量只在引擎销毁时关闭，按取消处理
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (chunk.index, cancelled_chunk(&chunk)),
                };
                if cancel.is_cancelled() {
                    return (chunk.index, cancelled_chunk(&chunk));
                }

                let result = run_chunk(chunk, &plugin, &db, &seen, &config).await;

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                event_bus
                    .publish(Event::new(
                        event_types::IMPORT_PROGRESS,
                        "import_engine",
                        json!({
                            "task_id": task_id,
                            "chunk_index": result.1.chunk_index,
                            "label": result.1.label.clone(),
                            "rows_written": result.1.rows_written,
                            "rows_deduplicated": result.1.rows_deduplicated,
                            "error": result.1.error.clone(),
                            "chunks_done": done,
                            "chunks_total": chunks_total,
                        }),
                    ))
                    .await;
                result
            });
        }

        let mut per_chunk_results: Vec<ChunkResult> = Vec::with_capacity(chunks_total);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, result)) => per_chunk_results.push(result),
                Err(e) => {
                    warn!("Import chunk task panicked: {}", e);
                }
            }
        }
        per_chunk_results.sort_by_key(|c| c.chunk_index);

        let rows_written = per_chunk_results.iter().map(|c| c.rows_written).sum();
        let rows_deduplicated = per_chunk_results.iter().map(|c| c.rows_deduplicated).sum();
        let first_error = per_chunk_results
            .iter()
            .find_map(|c| c.error.as_ref().map(|e| format!("{}: {}", c.label, e)));
        let succeeded = first_error.is_none() && per_chunk_results.len() == chunks_total;

        ImportResult {
            task_id: task.task_id.clone(),
            rows_written,
            rows_deduplicated,
            succeeded,
            error: first_error,
            per_chunk_results,
        }
    }

    async fn resolve_provider(&self, task: &ImportTask) -> Result<String> {
        if let Some(requested) = &task.requested_provider {
            if self.monitor.is_usable(requested).await {
                return Ok(requested.clone());
            }
            debug!(
                "Requested provider '{}' unusable, falling back to chain for '{}'",
                requested, task.data_type
            );
        }
        self.router.resolve(task.data_type).await
    }

    /// 按数据类别切分任务
    fn split_chunks(&self, task: &ImportTask) -> Result<Vec<ChunkSpec>> {
        let mut chunks = Vec::new();
        match task.data_type {
            DataCategory::StockList => {
                chunks.push(ChunkSpec {
                    index: 0,
                    label: "stock_list".to_string(),
                    work: ChunkWork::StockList,
                });
            }
            DataCategory::Kline => {
                let range = task
                    .date_range
                    .ok_or_else(|| QuantHubError::config("kline import requires a date range"))?;
                let mut index = 0;
                for symbol in &task.symbols {
                    for window in range.windows(self.config.chunk_days) {
                        chunks.push(ChunkSpec {
                            index,
                            label: format!("{}:{}..{}", symbol, window.start, window.end),
                            work: ChunkWork::Kline { symbol: symbol.clone(), range: window },
                        });
                        index += 1;
                    }
                }
            }
            DataCategory::Realtime | DataCategory::Fundamental => {
                let symbols: Vec<String> = task.symbols.iter().cloned().collect();
                let group_size = self.config.chunk_symbols.max(1);
                for (index, group) in symbols.chunks(group_size).enumerate() {
                    chunks.push(ChunkSpec {
                        index,
                        label: format!(
                            "symbols[{}..{}]",
                            index * group_size,
                            index * group_size + group.len()
                        ),
                        work: ChunkWork::Snapshot {
                            category: task.data_type,
                            symbols: group.to_vec(),
                        },
                    });
                }
            }
        }
        Ok(chunks)
    }
}

fn cancelled_chunk(chunk: &ChunkSpec) -> ChunkResult {
    ChunkResult {
        chunk_index: chunk.index,
        label: chunk.label.clone(),
        rows_written: 0,
        rows_deduplicated: 0,
        attempts: 0,
        error: Some("cancelled".to_string()),
    }
}

/// 执行单个分块：带退避重试的拉取 + 去重写入
async fn run_chunk(
    chunk: ChunkSpec,
    plugin: &PluginHandle,
    db: &AssetDatabaseHandle,
    seen: &Arc<parking_lot::Mutex<HashSet<RecordKey>>>,
    config: &ImportEngineConfig,
) -> (usize, ChunkResult) {
    let mut attempts = 0u32;
    let mut last_error = String::new();

    while attempts < config.max_attempts {
        attempts += 1;
        match fetch_chunk(&chunk, plugin, config.fetch_timeout).await {
            Ok(records) => {
                let (fresh, in_task_dupes) = split_unseen(records, seen);
                let fresh_keys: Vec<RecordKey> = fresh.iter().map(|r| r.key()).collect();
                match db.write_records(fresh).await {
                    Ok((written, db_dupes)) => {
                        // 写入落盘后键才计入任务级去重集合，写失败的重试
                        // 不会把同一批行误判为重复
                        seen.lock().extend(fresh_keys);
                        return (
                            chunk.index,
                            ChunkResult {
                                chunk_index: chunk.index,
                                label: chunk.label,
                                rows_written: written,
                                rows_deduplicated: in_task_dupes + db_dupes,
                                attempts,
                                error: None,
                            },
                        );
                    }
                    Err(e) => last_error = e.to_string(),
                }
            }
            // 能力缺失不会因重试而改变
            Err(e @ QuantHubError::OperationUnsupported { .. }) => {
                last_error = e.to_string();
                break;
            }
            Err(e) => last_error = e.to_string(),
        }

        if attempts < config.max_attempts {
            let backoff = config.retry_backoff * 2u32.saturating_pow(attempts - 1);
            debug!("Chunk '{}' attempt {} failed, retrying in {:?}", chunk.label, attempts, backoff);
            tokio::time::sleep(backoff).await;
        }
    }

    warn!("Chunk '{}' failed after {} attempt(s): {}", chunk.label, attempts, last_error);
    (
        chunk.index,
        ChunkResult {
            chunk_index: chunk.index,
            label: chunk.label,
            rows_written: 0,
            rows_deduplicated: 0,
            attempts,
            error: Some(last_error),
        },
    )
}

async fn fetch_chunk(
    chunk: &ChunkSpec,
    plugin: &PluginHandle,
    fetch_timeout: Duration,
) -> Result<Vec<MarketRecord>> {
    let fetched = tokio::time::timeout(fetch_timeout, async {
        let guard = plugin.read().await;
        match &chunk.work {
            ChunkWork::StockList => guard.fetch_stock_list().await,
            ChunkWork::Kline { symbol, range } => guard.fetch_kline(symbol, range).await,
            ChunkWork::Snapshot { category: DataCategory::Fundamental, symbols } => {
                guard.fetch_fundamental(symbols).await
            }
            ChunkWork::Snapshot { symbols, .. } => guard.fetch_realtime(symbols).await,
        }
    })
    .await;

    match fetched {
        Ok(result) => result,
        Err(_) => Err(QuantHubError::network(format!(
            "fetch timed out after {:?}",
            fetch_timeout
        ))),
    }
}

/// 过滤任务内已见过的键，返回(新记录, 任务内重复数)
///
/// 只读取去重集合，不写入——键由调用方在写库成功后提交
fn split_unseen(
    records: Vec<MarketRecord>,
    seen: &Arc<parking_lot::Mutex<HashSet<RecordKey>>>,
) -> (Vec<MarketRecord>, usize) {
    let guard = seen.lock();
    let mut batch_keys = HashSet::new();
    let mut fresh = Vec::with_capacity(records.len());
    let mut dupes = 0;
    for record in records {
        let key = record.key();
        if guard.contains(&key) || !batch_keys.insert(key) {
            dupes += 1;
        } else {
            fresh.push(record);
        }
    }
    (fresh, dupes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::core::{DataSourcePlugin, HealthResult, PluginInfo, PluginManifest};
    use crate::plugins::health::HealthMonitorConfig;
    use crate::plugins::registry::MemoryStateStore;
    use crate::plugins::FallbackChain;
    use crate::types::{AssetClass, ImportMode};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use semver::Version;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// 行为可脚本化的测试数据源
    struct TestSource {
        /// fetch_stock_list返回的记录
        stock_list: Arc<parking_lot::Mutex<Vec<MarketRecord>>>,
        /// 前n次fetch调用直接失败
        fail_fetches: Arc<AtomicUsize>,
        init_ok: bool,
    }

    impl TestSource {
        fn take_failure(&self) -> bool {
            self.fail_fetches
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl DataSourcePlugin for TestSource {
        async fn initialize(
            &mut self,
            _config: &HashMap<String, serde_json::Value>,
        ) -> Result<bool> {
            Ok(self.init_ok)
        }

        async fn health_check(&self) -> Result<HealthResult> {
            Ok(HealthResult::healthy(1))
        }

        fn plugin_info(&self) -> PluginInfo {
            PluginInfo {
                name: "test_source".to_string(),
                version: Version::new(1, 0, 0),
                category: AssetClass::Stock,
            }
        }

        async fn fetch_stock_list(&self) -> Result<Vec<MarketRecord>> {
            if self.take_failure() {
                return Err(QuantHubError::network("scripted failure"));
            }
            Ok(self.stock_list.lock().clone())
        }

        async fn fetch_kline(&self, symbol: &str, range: &DateRange) -> Result<Vec<MarketRecord>> {
            if self.take_failure() {
                return Err(QuantHubError::network("scripted failure"));
            }
            // 范围内每天一根K线
            let mut records = Vec::new();
            let mut day = range.start;
            while day <= range.end {
                let ts = day.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis();
                let mut record = MarketRecord::new(symbol, ts, DataCategory::Kline);
                record.close = Some(Decimal::from(100));
                records.push(record);
                day += chrono::Duration::days(1);
            }
            Ok(records)
        }

        async fn fetch_realtime(&self, symbols: &[String]) -> Result<Vec<MarketRecord>> {
            if self.take_failure() {
                return Err(QuantHubError::network("scripted failure"));
            }
            Ok(symbols
                .iter()
                .map(|s| MarketRecord::new(s, 1_700_000_000_000, DataCategory::Realtime))
                .collect())
        }

        async fn fetch_fundamental(&self, symbols: &[String]) -> Result<Vec<MarketRecord>> {
            if self.take_failure() {
                return Err(QuantHubError::network("scripted failure"));
            }
            Ok(symbols
                .iter()
                .map(|s| MarketRecord::new(s, 1_700_000_000_000, DataCategory::Fundamental))
                .collect())
        }
    }

    thread_local! {
        static SCRIPT: RefCell<
            Option<(Arc<parking_lot::Mutex<Vec<MarketRecord>>>, Arc<AtomicUsize>, bool)>,
        > = RefCell::new(None);
    }

    fn scripted_factory() -> Box<dyn DataSourcePlugin> {
        let (stock_list, fail_fetches, init_ok) = SCRIPT.with(|s| s.borrow().clone().unwrap());
        Box::new(TestSource { stock_list, fail_fetches, init_ok })
    }

    struct Rig {
        engine: Arc<ImportEngine>,
        storage: Arc<AssetDatabaseRouter>,
        event_bus: Arc<EventBus>,
        stock_list: Arc<parking_lot::Mutex<Vec<MarketRecord>>>,
        fail_fetches: Arc<AtomicUsize>,
        _temp: TempDir,
    }

    async fn build_rig(init_ok: bool, config: ImportEngineConfig) -> Rig {
        let stock_list = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let fail_fetches = Arc::new(AtomicUsize::new(0));
        SCRIPT.with(|s| {
            *s.borrow_mut() = Some((stock_list.clone(), fail_fetches.clone(), init_ok))
        });

        let registry = Arc::new(PluginRegistry::new(Arc::new(MemoryStateStore::new())));
        registry
            .discover(&[PluginManifest::new(
                "test_source",
                "Test Source",
                AssetClass::Stock,
                Version::new(1, 0, 0),
                scripted_factory,
            )])
            .await
            .unwrap();

        let event_bus = Arc::new(EventBus::new());
        let monitor = Arc::new(PluginHealthMonitor::new(
            registry.clone(),
            event_bus.clone(),
            HealthMonitorConfig::default(),
        ));
        monitor.initialize_all(&HashMap::new()).await.unwrap();

        let chains = vec![
            FallbackChain {
                category: DataCategory::StockList,
                providers: vec!["test_source".into()],
            },
            FallbackChain { category: DataCategory::Kline, providers: vec!["test_source".into()] },
            FallbackChain {
                category: DataCategory::Realtime,
                providers: vec!["test_source".into()],
            },
            FallbackChain {
                category: DataCategory::Fundamental,
                providers: vec!["test_source".into()],
            },
        ];
        let router = Arc::new(DataSourceRouter::new(chains, monitor.clone()));

        let temp = TempDir::new().unwrap();
        let storage = Arc::new(AssetDatabaseRouter::new(temp.path(), event_bus.clone()));

        let engine = Arc::new(ImportEngine::new(
            router,
            registry,
            monitor,
            storage.clone(),
            event_bus.clone(),
            config,
        ));
        Rig { engine, storage, event_bus, stock_list, fail_fetches, _temp: temp }
    }

    fn fast_config() -> ImportEngineConfig {
        ImportEngineConfig {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            drain_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn listed(symbol: &str, ts: i64) -> MarketRecord {
        MarketRecord::new(symbol, ts, DataCategory::StockList)
    }

    #[tokio::test]
    async fn test_stock_list_import_with_one_duplicate() {
        let rig = build_rig(true, fast_config()).await;

        // 20条记录，其中1条与另一条键完全相同
        let mut records: Vec<MarketRecord> =
            (0..19).map(|i| listed(&format!("60{:04}", i), 1_700_000_000_000)).collect();
        records.push(listed("600000", 1_700_000_000_000));
        assert_eq!(records.len(), 20);
        *rig.stock_list.lock() = records;

        let task = ImportTask::new(DataCategory::StockList, AssetClass::Stock);
        let result = rig.engine.submit(task).await.unwrap().into_result().unwrap();

        assert!(result.succeeded);
        assert_eq!(result.rows_written, 19);
        assert_eq!(result.rows_deduplicated, 1);
        assert_eq!(result.per_chunk_results.len(), 1);
        assert!(result.per_chunk_results[0].is_ok());
    }

    #[tokio::test]
    async fn test_reimport_same_range_is_idempotent() {
        let rig = build_rig(true, fast_config()).await;
        let task = ImportTask::new(DataCategory::Kline, AssetClass::Stock)
            .with_symbols(["600000", "000001"])
            .with_date_range(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            );

        let first = rig.engine.submit(task.clone()).await.unwrap().into_result().unwrap();
        assert!(first.succeeded);
        assert_eq!(first.rows_written, 20); // 2代码 × 10天
        assert_eq!(first.rows_deduplicated, 0);

        // 同范围重导入：全部命中已存储行
        let second_task = ImportTask { task_id: uuid::Uuid::new_v4().to_string(), ..task };
        let second = rig.engine.submit(second_task).await.unwrap().into_result().unwrap();
        assert!(second.succeeded);
        assert_eq!(second.rows_written, 0);
        assert_eq!(second.rows_deduplicated, first.rows_written);
    }

    #[tokio::test]
    async fn test_kline_chunking_by_symbol_and_window() {
        let config = ImportEngineConfig { chunk_days: 10, ..fast_config() };
        let rig = build_rig(true, config).await;

        let task = ImportTask::new(DataCategory::Kline, AssetClass::Stock)
            .with_symbols(["600000", "000001"])
            .with_date_range(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 25).unwrap(),
            );
        let result = rig.engine.submit(task).await.unwrap().into_result().unwrap();

        // 2代码 × 3窗口，结果按派发顺序
        assert_eq!(result.per_chunk_results.len(), 6);
        for (i, chunk) in result.per_chunk_results.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
        }
        assert!(result.succeeded);
        assert_eq!(result.rows_written, 50);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_with_success() {
        let rig = build_rig(true, fast_config()).await;
        *rig.stock_list.lock() = vec![listed("600000", 1_700_000_000_000)];
        rig.fail_fetches.store(1, Ordering::SeqCst);

        let task = ImportTask::new(DataCategory::StockList, AssetClass::Stock);
        let result = rig.engine.submit(task).await.unwrap().into_result().unwrap();

        assert!(result.succeeded);
        assert_eq!(result.rows_written, 1);
        assert_eq!(result.per_chunk_results[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_marks_chunk_failed() {
        let rig = build_rig(true, fast_config()).await;
        rig.fail_fetches.store(100, Ordering::SeqCst);

        let task = ImportTask::new(DataCategory::StockList, AssetClass::Stock);
        let result = rig.engine.submit(task).await.unwrap().into_result().unwrap();

        assert!(!result.succeeded);
        assert_eq!(result.rows_written, 0);
        assert_eq!(result.per_chunk_results[0].attempts, 3);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_failed_provider_yields_no_provider_available() {
        let rig = build_rig(false, fast_config()).await;

        let task = ImportTask::new(DataCategory::StockList, AssetClass::Stock);
        let result = rig.engine.submit(task).await.unwrap().into_result().unwrap();

        assert!(!result.succeeded);
        assert_eq!(result.rows_written, 0);
        assert_eq!(result.error.as_deref(), Some("NoProviderAvailable"));
        assert!(result.per_chunk_results.is_empty());

        // 提交失败不能留下任何存储副作用
        assert_eq!(rig.storage.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_drain_rejects_new_tasks() {
        let rig = build_rig(true, fast_config()).await;
        rig.engine.drain().await;

        let task = ImportTask::new(DataCategory::StockList, AssetClass::Stock)
            .with_mode(ImportMode::Sync);
        assert!(matches!(
            rig.engine.submit(task).await,
            Err(QuantHubError::ShutdownInProgress)
        ));
        let task = ImportTask::new(DataCategory::StockList, AssetClass::Stock);
        assert!(matches!(
            rig.engine.submit_detached(task),
            Err(QuantHubError::ShutdownInProgress)
        ));
    }

    #[tokio::test]
    async fn test_fundamental_task_stores_fundamental_rows() {
        let rig = build_rig(true, fast_config()).await;

        let task = ImportTask::new(DataCategory::Fundamental, AssetClass::Stock)
            .with_symbols(["600000", "000001"]);
        let result = rig.engine.submit(task).await.unwrap().into_result().unwrap();
        assert!(result.succeeded);
        assert_eq!(result.rows_written, 2);

        // 落库的必须是基本面行，而不是被实时行情顶替
        let db = rig.storage.handle_for(AssetClass::Stock, "default").await.unwrap();
        assert_eq!(db.count_records(DataCategory::Fundamental).await.unwrap(), 2);
        assert_eq!(db.count_records(DataCategory::Realtime).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_reported_not_counted_as_duplicates() {
        let rig = build_rig(true, fast_config()).await;
        *rig.stock_list.lock() =
            (0..5).map(|i| listed(&format!("60{:04}", i), 1_700_000_000_000)).collect();

        // 先建好分区，再用独立连接持有RESERVED锁让引擎的写入报SQLITE_BUSY
        rig.storage.handle_for(AssetClass::Stock, "default").await.unwrap();
        let path = rig.storage.locate(AssetClass::Stock, "default").storage_path;
        let blocker = rusqlite::Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

        let task = ImportTask::new(DataCategory::StockList, AssetClass::Stock);
        let result = rig.engine.submit(task).await.unwrap().into_result().unwrap();

        // 写失败必须表达为分块失败，不能把丢掉的行报成重复
        assert!(!result.succeeded);
        assert_eq!(result.rows_written, 0);
        assert_eq!(result.rows_deduplicated, 0);
        assert!(result.error.is_some());

        // 锁释放后重新提交，全部行可以正常落库
        drop(blocker);
        let retry = ImportTask::new(DataCategory::StockList, AssetClass::Stock);
        let result = rig.engine.submit(retry).await.unwrap().into_result().unwrap();
        assert!(result.succeeded);
        assert_eq!(result.rows_written, 5);
    }

    /// 把订阅到的事件负载收进列表
    struct PayloadRecorder {
        payloads: Arc<parking_lot::Mutex<Vec<serde_json::Value>>>,
    }

    #[async_trait]
    impl crate::core::event_bus::EventHandler for PayloadRecorder {
        async fn handle(&self, event: &Event) -> Result<()> {
            self.payloads.lock().push(event.payload.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "payload_recorder"
        }
    }

    #[tokio::test]
    async fn test_async_mode_delivers_full_result_via_event() {
        let rig = build_rig(true, fast_config()).await;
        *rig.stock_list.lock() = vec![listed("600000", 1_700_000_000_000)];

        let payloads = Arc::new(parking_lot::Mutex::new(Vec::new()));
        rig.event_bus
            .subscribe(
                event_types::IMPORT_COMPLETED,
                Arc::new(PayloadRecorder { payloads: payloads.clone() }),
            )
            .await;

        let task = ImportTask::new(DataCategory::StockList, AssetClass::Stock)
            .with_mode(ImportMode::Async);
        let task_id = task.task_id.clone();

        // mode为Async时submit不阻塞，回执是任务ID
        let submission = rig.engine.submit(task).await.unwrap();
        match submission {
            ImportSubmission::Scheduled(id) => assert_eq!(id, task_id),
            ImportSubmission::Completed(_) => panic!("async task must not block submit"),
        }

        // 完成事件是异步调用方唯一的结果通道，负载必须是完整结果
        let mut completed = None;
        for _ in 0..100 {
            if let Some(payload) = payloads.lock().first().cloned() {
                completed = Some(payload);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let payload = completed.expect("import.completed not delivered");
        assert_eq!(payload["task_id"], json!(task_id));
        assert_eq!(payload["succeeded"], json!(true));
        assert_eq!(payload["rows_written"], json!(1));
        assert_eq!(payload["per_chunk_results"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_progress_events_carry_chunk_counters() {
        let rig = build_rig(true, fast_config()).await;
        *rig.stock_list.lock() = vec![listed("600000", 1_700_000_000_000)];

        let payloads = Arc::new(parking_lot::Mutex::new(Vec::new()));
        rig.event_bus
            .subscribe(
                event_types::IMPORT_PROGRESS,
                Arc::new(PayloadRecorder { payloads: payloads.clone() }),
            )
            .await;

        let task = ImportTask::new(DataCategory::StockList, AssetClass::Stock);
        let result = rig.engine.submit(task).await.unwrap().into_result().unwrap();
        assert!(result.succeeded);

        let payloads = payloads.lock();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["chunks_done"], json!(1));
        assert_eq!(payloads[0]["chunks_total"], json!(1));
        assert_eq!(payloads[0]["rows_written"], json!(1));
    }
}
