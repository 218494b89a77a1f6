//! 事件模块
//!
//! - `types.rs`: 下载事件与进度快照
//! - `broadcaster.rs`: 观察者注册与事件分发

mod broadcaster;
mod types;

pub use broadcaster::*;
pub use types::*;
