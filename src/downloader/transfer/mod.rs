//! 传输层
//!
//! 一次传输负责把远端字节写进临时文件，并遵守统一的续传约定：
//! 1. 临时文件已存在时，其大小即续传起点
//! 2. 服务端返回 206 时追加写入，返回 200 时丢弃旧数据从 0 开始
//! 3. 每个 chunk 边界检查取消信号，收到信号后立即返回 `Interrupted`
//!
//! 暂停与取消的区别由调度器处理：传输层从不删除临时文件。

mod external;
mod native;

pub use external::ExternalTransfer;
pub use native::{NativeTransfer, RemoteProbe};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{DownloadConfig, TransferEngine};

/// 单次传输的输入
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// 任务ID（仅用于日志）
    pub task_id: String,
    /// 请求地址
    pub url: String,
    /// 额外请求头（认证等）
    pub headers: HeaderMap,
    /// 临时文件路径
    pub partial_path: PathBuf,
}

/// 传输结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// 数据流正常结束，临时文件已关闭
    Finished {
        /// 临时文件中的字节数
        bytes: u64,
        /// 服务端报告的总大小（0 表示未知）
        total_bytes: u64,
    },
    /// 收到取消信号后中止
    Interrupted,
}

/// 传输进度回调
///
/// 两种传输策略通过同一组回调汇报进度，速度采样由调用方统一完成
pub trait TransferProgress: Send + Sync {
    /// 确定写入起点后调用：续传起点、总大小（0 未知）、是否确认支持续传
    ///
    /// 传输中途放弃旧数据从头开始时会再次调用
    fn on_start(&self, resume_from: u64, total_bytes: u64, supports_resume: bool);

    /// 目前已接收的字节数（含续传起点）
    fn on_bytes(&self, downloaded: u64);
}

/// 传输策略
#[async_trait]
pub trait Transfer: Send + Sync {
    /// 策略名称
    fn name(&self) -> &'static str;

    /// 该策略为一个临时文件在磁盘上产生的全部中间文件
    ///
    /// 取消任务时逐个删除；默认只有临时文件本身
    fn staging_files(&self, partial: &Path) -> Vec<PathBuf> {
        vec![partial.to_path_buf()]
    }

    /// 执行一次传输
    ///
    /// 网络或磁盘错误以 `Err` 返回，临时文件保持原样以便后续续传
    async fn run(
        &self,
        request: &TransferRequest,
        progress: &dyn TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome>;
}

/// 传输参数
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// 连接超时
    pub connect_timeout: Duration,
    /// 单次读取超时（两个 chunk 之间的最长等待）
    pub read_timeout: Duration,
    /// User-Agent
    pub user_agent: String,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(60),
            user_agent: format!("model-fetch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TransferSettings {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
            ..Self::default()
        }
    }
}

/// 根据配置选择传输策略
///
/// 外部加速器不可用时退回内置客户端
pub fn select_transfer(config: &DownloadConfig) -> Result<Arc<dyn Transfer>> {
    let settings = TransferSettings::from_config(config);
    let native = NativeTransfer::new(settings.clone())?;

    match config.engine {
        TransferEngine::Native => {
            info!("传输引擎: native");
            Ok(Arc::new(native))
        }
        TransferEngine::External => {
            if ExternalTransfer::is_available(&config.aria2c_path) {
                info!("传输引擎: external ({})", config.aria2c_path);
                Ok(Arc::new(ExternalTransfer::new(
                    config.aria2c_path.clone(),
                    config.aria2c_connections,
                    settings,
                    native,
                )))
            } else {
                warn!("aria2c 不可用，退回内置下载: {}", config.aria2c_path);
                Ok(Arc::new(native))
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_stages_only_partial() {
        let native = NativeTransfer::new(TransferSettings::default()).unwrap();
        assert_eq!(
            native.staging_files(Path::new("/m/a.bin.partial")),
            vec![PathBuf::from("/m/a.bin.partial")]
        );
    }

    #[test]
    fn test_external_stages_control_file() {
        let native = NativeTransfer::new(TransferSettings::default()).unwrap();
        let external = ExternalTransfer::new(
            "aria2c".to_string(),
            4,
            TransferSettings::default(),
            native,
        );
        assert_eq!(
            external.staging_files(Path::new("/m/a.bin.partial")),
            vec![
                PathBuf::from("/m/a.bin.partial"),
                PathBuf::from("/m/a.bin.partial.aria2")
            ]
        );
    }
}
