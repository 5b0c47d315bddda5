//! 合成数据源
//!
//! 回退链末位的保底提供者：不依赖任何外部服务，按代码确定性地
//! 生成行情数据。同一代码同一范围的两次请求返回完全相同的记录，
//! 幂等重导入在离线环境下也可演示

use crate::plugins::core::{DataSourcePlugin, HealthResult, PluginInfo, PluginManifest};
use crate::types::{AssetClass, DataCategory, DateRange, MarketRecord};
use crate::Result;
use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rust_decimal::Decimal;
use semver::Version;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// 插件ID
pub const SYNTHETIC_PLUGIN_ID: &str = "synthetic";

/// 合成数据源的静态清单
pub fn manifest() -> PluginManifest {
    PluginManifest::new(
        SYNTHETIC_PLUGIN_ID,
        "Synthetic Fallback Source",
        AssetClass::Stock,
        Version::new(1, 0, 0),
        || Box::new(SyntheticDataSource::new()),
    )
}

/// 合成数据源
pub struct SyntheticDataSource {
    initialized: bool,
}

impl SyntheticDataSource {
    pub fn new() -> Self {
        Self { initialized: false }
    }

    /// 代码到随机种子的确定性映射
    fn seed_for(symbol: &str) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        symbol.hash(&mut hasher);
        hasher.finish()
    }

    /// 以随机游走生成一根日K线，价格以分为单位避免浮点
    fn bar_for(rng: &mut StdRng, symbol: &str, price_cents: &mut i64, ts: i64) -> MarketRecord {
        let open = *price_cents;
        let drift: i64 = rng.gen_range(-300..=300);
        let close = (open + drift).max(100);
        let high = open.max(close) + rng.gen_range(0..=150);
        let low = (open.min(close) - rng.gen_range(0..=150)).max(50);
        *price_cents = close;

        let mut record = MarketRecord::new(symbol, ts, DataCategory::Kline);
        record.open = Some(Decimal::new(open, 2));
        record.high = Some(Decimal::new(high, 2));
        record.low = Some(Decimal::new(low, 2));
        record.close = Some(Decimal::new(close, 2));
        record.volume = Some(Decimal::from(rng.gen_range(10_000..5_000_000)));
        record
    }
}

impl Default for SyntheticDataSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSourcePlugin for SyntheticDataSource {
    async fn initialize(&mut self, _config: &HashMap<String, serde_json::Value>) -> Result<bool> {
        self.initialized = true;
        Ok(true)
    }

    async fn health_check(&self) -> Result<HealthResult> {
        if self.initialized {
            Ok(HealthResult::healthy(0))
        } else {
            Ok(HealthResult::unhealthy("not initialized", 0))
        }
    }

    fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: SYNTHETIC_PLUGIN_ID.to_string(),
            version: Version::new(1, 0, 0),
            category: AssetClass::Stock,
        }
    }

    async fn fetch_stock_list(&self) -> Result<Vec<MarketRecord>> {
        let listed_at = chrono::Utc::now().timestamp_millis() / 86_400_000 * 86_400_000;
        let records = ["600000", "600036", "000001", "000002", "300750"]
            .iter()
            .map(|symbol| {
                let mut record = MarketRecord::new(*symbol, listed_at, DataCategory::StockList);
                record
                    .extra
                    .insert("name".to_string(), serde_json::json!(format!("SYN-{}", symbol)));
                record
            })
            .collect();
        Ok(records)
    }

    async fn fetch_kline(&self, symbol: &str, range: &DateRange) -> Result<Vec<MarketRecord>> {
        let mut rng = StdRng::seed_from_u64(Self::seed_for(symbol));
        let mut price_cents: i64 = rng.gen_range(500..50_000);

        let mut records = Vec::new();
        let mut day = range.start;
        while day <= range.end {
            let ts = day
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().timestamp_millis())
                .unwrap_or_default();
            records.push(Self::bar_for(&mut rng, symbol, &mut price_cents, ts));
            day += chrono::Duration::days(1);
        }
        Ok(records)
    }

    async fn fetch_realtime(&self, symbols: &[String]) -> Result<Vec<MarketRecord>> {
        let ts = chrono::Utc::now().timestamp_millis();
        let records = symbols
            .iter()
            .map(|symbol| {
                let mut rng = StdRng::seed_from_u64(Self::seed_for(symbol));
                let price = rng.gen_range(500i64..50_000);
                let mut record = MarketRecord::new(symbol, ts, DataCategory::Realtime);
                record.close = Some(Decimal::new(price, 2));
                record.volume = Some(Decimal::from(rng.gen_range(100..100_000)));
                record
            })
            .collect();
        Ok(records)
    }

    async fn fetch_fundamental(&self, symbols: &[String]) -> Result<Vec<MarketRecord>> {
        let ts = chrono::Utc::now().timestamp_millis() / 86_400_000 * 86_400_000;
        let records = symbols
            .iter()
            .map(|symbol| {
                let mut rng = StdRng::seed_from_u64(Self::seed_for(symbol));
                let mut record = MarketRecord::new(symbol, ts, DataCategory::Fundamental);
                record.extra.insert(
                    "pe_ratio".to_string(),
                    serde_json::json!(rng.gen_range(5.0..80.0)),
                );
                record.extra.insert(
                    "market_cap".to_string(),
                    serde_json::json!(rng.gen_range(1_000_000_000u64..500_000_000_000)),
                );
                record
            })
            .collect();
        Ok(records)
    }
}
