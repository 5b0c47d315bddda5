//! 分区化市场数据存储
//!
//! SQLite分区文件 + r2d2连接池，按资产类别切分

pub mod database;
pub mod router;

pub use database::{AssetDatabase, AssetDatabaseHandle, DbPool};
pub use router::{AssetDatabaseRouter, AssetLocation};
