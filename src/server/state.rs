// 应用状态

use crate::config::AppConfig;
use crate::downloader::DownloadManager;
use crate::server::events::ProgressBroadcaster;
use std::sync::Arc;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 下载管理器
    pub download_manager: DownloadManager,
    /// 事件广播器
    pub broadcaster: Arc<ProgressBroadcaster>,
    /// 应用配置（启动后只读）
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// 按配置创建应用状态并恢复上次的下载队列
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let download_manager = DownloadManager::from_app_config(&config, broadcaster.clone())?;

        let restored = download_manager.restore().await?;
        tracing::info!("下载队列恢复完成: {} 个任务", restored);

        Ok(Self {
            download_manager,
            broadcaster,
            config: Arc::new(config),
        })
    }

    /// 优雅关闭
    pub async fn shutdown(&self) {
        self.download_manager.shutdown().await;
    }
}
