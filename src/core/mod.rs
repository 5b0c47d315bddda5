//! 核心基础层
//!
//! 事件总线与停机协调器，其余组件都依赖这两个基础设施

pub mod event_bus;
pub mod shutdown;

pub use event_bus::{event_types, Event, EventBus, EventHandler, SubscriptionId};
pub use shutdown::{CleanupFn, ShutdownCoordinator, ShutdownReport};
