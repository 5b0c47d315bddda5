//! 内置数据源

pub mod synthetic;

pub use synthetic::{manifest as synthetic_manifest, SyntheticDataSource, SYNTHETIC_PLUGIN_ID};
