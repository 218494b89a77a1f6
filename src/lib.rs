// Model Fetch
// 可续传、并发受限的模型文件下载引擎

// 配置管理模块
pub mod config;

// 下载引擎模块
pub mod downloader;

// 日志模块
pub mod logging;

// 持久化模块（队列快照、完成历史）
pub mod persistence;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{DownloadManager, DownloadRequest, DownloadTask, TaskStatus};
pub use server::events::{DownloadEvent, ProgressBroadcaster, ProgressObserver};
pub use server::AppState;
