//! QuantHub 主程序 - 配置驱动运行
//!
//! 通过YAML配置文件驱动的行情采集管线

use quant_hub::config::generate_default_config_file;
use quant_hub::data::synthetic_manifest;
use quant_hub::types::{AssetClass, DataCategory, ImportTask};
use quant_hub::{HubConfig, HubContext, Result, FRAMEWORK_NAME, VERSION};
use std::env;
use std::path::Path;

/// 程序入口点
#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(_) => {}
        Err(e) => {
            tracing::error!("❌ 程序运行失败: {}", e);
            std::process::exit(1);
        }
    }
}

/// 主要逻辑函数
async fn run_main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.len() {
        1 => run_with_config(HubConfig::default()).await,
        2 => {
            let command = &args[1];
            match command.as_str() {
                "init" => generate_config().await,
                path => run_with_config_file(path).await,
            }
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}

/// 使用配置文件运行
async fn run_with_config_file(config_path: &str) -> Result<()> {
    if !Path::new(config_path).exists() {
        quant_hub::init_logging("info");
        tracing::error!("❌ 配置文件不存在: {}", config_path);
        tracing::info!("💡 使用 'quant_hub init' 生成默认配置文件");
        return Ok(());
    }
    run_with_config(HubConfig::load(config_path)?).await
}

/// 组装上下文并运行示例导入
async fn run_with_config(config: HubConfig) -> Result<()> {
    quant_hub::init_logging(&config.logging.level);
    tracing::info!("🚀 启动 {} v{}", FRAMEWORK_NAME, VERSION);
    tracing::info!("📂 存储根目录: {:?}", config.storage.base_path);

    let ctx = HubContext::build(config, &[synthetic_manifest()]).await?;

    for record in ctx.monitor.health_snapshot().await {
        tracing::info!("🔌 插件 '{}': {}", record.plugin_id, record.state.as_str());
    }

    // 示例导入：近30天的日K线
    let today = chrono::Utc::now().date_naive();
    let task = ImportTask::new(DataCategory::Kline, AssetClass::Stock)
        .with_symbols(["600000", "600036", "000001"])
        .with_date_range(today - chrono::Duration::days(30), today);
    let task_id = task.task_id.clone();

    tracing::info!("📥 提交导入任务 '{}'", task_id);
    let submission = ctx.import_engine.submit(task).await?;
    let result = match submission.into_result() {
        Some(result) => result,
        None => {
            tracing::info!("📨 任务 '{}' 已调度，结果经事件投递", task_id);
            return Ok(());
        }
    };

    if result.succeeded {
        tracing::info!(
            "✅ 导入完成: 写入={} 去重={} 分块={}",
            result.rows_written,
            result.rows_deduplicated,
            result.per_chunk_results.len()
        );
    } else {
        tracing::warn!(
            "⚠️ 导入部分失败: 写入={} 错误={:?}",
            result.rows_written,
            result.error
        );
    }

    tracing::info!("⏳ 按 Ctrl+C 停机");
    tokio::signal::ctrl_c()
        .await
        .map_err(quant_hub::QuantHubError::Io)?;

    let report = ctx.run_shutdown().await;
    tracing::info!(
        "🎉 停机完成: 清理成功={} 失败={}",
        report.succeeded,
        report.failed
    );
    Ok(())
}

/// 生成默认配置文件
async fn generate_config() -> Result<()> {
    quant_hub::init_logging("info");
    let config_path = "quant_hub_config.yaml";

    tracing::info!("📝 生成默认配置文件: {}", config_path);
    generate_default_config_file(config_path)?;
    tracing::info!("✅ 配置文件生成完成");
    tracing::info!("🔧 请编辑配置文件后运行: quant_hub {}", config_path);
    Ok(())
}

/// 打印使用说明
fn print_usage() {
    println!("QuantHub 行情数据采集管线");
    println!();
    println!("用法:");
    println!("  quant_hub                    # 使用默认配置运行");
    println!("  quant_hub init               # 生成默认配置文件");
    println!("  quant_hub <config_file>      # 使用指定配置文件运行");
    println!();
    println!("示例:");
    println!("  quant_hub init");
    println!("  quant_hub quant_hub_config.yaml");
    println!();
    println!("配置文件格式: YAML");
}
