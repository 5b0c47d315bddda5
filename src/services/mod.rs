//! 管线服务层

pub mod import_engine;

pub use import_engine::{ImportEngine, ImportEngineConfig, ImportSubmission};
