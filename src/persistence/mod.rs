//! 持久化模块
//!
//! - `snapshot.rs`: 下载队列快照，进程重启后恢复未完成任务
//! - `history_db.rs`: 已完成下载的 SQLite 历史
//!
//! ## 文件结构
//!
//! ```text
//! data/
//! ├── download_queue.json   # 队列快照（原子替换写入）
//! └── history.db            # 完成历史
//! ```

pub mod history_db;
pub mod snapshot;

pub use history_db::{CompletionRecord, HistoryDbManager};
pub use snapshot::{LoadedQueue, QueueSnapshotStore};
