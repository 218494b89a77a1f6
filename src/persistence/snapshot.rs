//! 下载队列快照
//!
//! 每次任务变更后把未结束的任务整体写入一个 JSON 文件。
//! 写入采用“临时文件 + fsync + 原子重命名”，进程在写入途中崩溃时
//! 旧快照保持完整。
//!
//! ## 文件格式
//!
//! ```json
//! {
//!   "version": 1,
//!   "saved_at": 1733356800,
//!   "tasks": [ { "id": "...", "status": "queued", ... } ]
//! }
//! ```

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::downloader::DownloadTask;

/// 快照格式版本
const SNAPSHOT_VERSION: u32 = 1;

/// 损坏的快照改名时追加的后缀
const CORRUPT_SUFFIX: &str = ".corrupt";

#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    version: u32,
    saved_at: i64,
    tasks: Vec<DownloadTask>,
}

/// 快照读取结果
#[derive(Debug, Default)]
pub struct LoadedQueue {
    /// 未结束的任务（下载中的已降级为排队）
    pub tasks: Vec<DownloadTask>,
    /// 被降级的任务数量
    pub demoted: usize,
    /// 快照无法解析时，原文件被移到的位置
    pub quarantined: Option<PathBuf>,
}

/// 队列快照存储
pub struct QueueSnapshotStore {
    path: PathBuf,
    /// 串行化写入，并记录最近一次写入的代数
    last_generation: Mutex<u64>,
}

impl QueueSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_generation: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取快照
    ///
    /// 文件不存在时返回空队列；终态任务被丢弃；`downloading` 降级为 `queued`。
    /// 内容无法解析时把文件改名为 `<path>.corrupt` 留作排查，并以空队列启动
    pub async fn load(&self) -> Result<LoadedQueue> {
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || read_snapshot(&path))
            .await
            .context("读取队列快照任务失败")?;

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                let quarantined = self.quarantine().await?;
                warn!(
                    "⚠️ 队列快照已损坏，已移至 {:?}，以空队列启动: {}",
                    quarantined, e
                );
                return Ok(LoadedQueue {
                    quarantined: Some(quarantined),
                    ..LoadedQueue::default()
                });
            }
            Err(e) => {
                return Err(e).with_context(|| format!("读取队列快照失败: {:?}", self.path))
            }
        };

        let Some(snapshot) = snapshot else {
            debug!("队列快照不存在: {:?}", self.path);
            return Ok(LoadedQueue::default());
        };

        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                "队列快照版本 {} 与当前版本 {} 不一致，尝试按当前格式读取",
                snapshot.version, SNAPSHOT_VERSION
            );
        }

        let mut loaded = LoadedQueue::default();
        for mut task in snapshot.tasks {
            if task.status.is_terminal() {
                continue;
            }
            if task.demote_after_restart() {
                loaded.demoted += 1;
            }
            loaded.tasks.push(task);
        }

        info!(
            "已加载队列快照: {} 个任务（{} 个下载中任务降级为排队）",
            loaded.tasks.len(),
            loaded.demoted
        );
        Ok(loaded)
    }

    /// 把无法解析的快照改名保留
    async fn quarantine(&self) -> Result<PathBuf> {
        let mut name = self.path.as_os_str().to_owned();
        name.push(CORRUPT_SUFFIX);
        let target = PathBuf::from(name);
        tokio::fs::rename(&self.path, &target)
            .await
            .with_context(|| format!("移动损坏的队列快照失败: {:?}", self.path))?;
        Ok(target)
    }

    /// 写入快照
    ///
    /// `generation` 单调递增；比已写入代数更旧的快照直接丢弃，
    /// 避免并发保存时旧状态覆盖新状态
    ///
    /// # Returns
    /// 是否真正写入了磁盘
    pub async fn save(&self, generation: u64, tasks: Vec<DownloadTask>) -> Result<bool> {
        let mut last = self.last_generation.lock().await;
        if generation <= *last && *last != 0 {
            debug!("跳过过期快照: generation={} <= {}", generation, *last);
            return Ok(false);
        }

        let snapshot = QueueSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: chrono::Utc::now().timestamp(),
            tasks: tasks
                .into_iter()
                .filter(|t| !t.status.is_terminal())
                .collect(),
        };

        let path = self.path.clone();
        let count = snapshot.tasks.len();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &snapshot))
            .await
            .context("写入队列快照任务失败")?
            .with_context(|| format!("写入队列快照失败: {:?}", self.path))?;

        *last = generation;
        debug!("已保存队列快照: {} 个任务 (generation={})", count, generation);
        Ok(true)
    }
}

fn read_snapshot(path: &Path) -> io::Result<Option<QueueSnapshot>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let snapshot = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to parse queue snapshot: {}", e),
        )
    })?;
    Ok(Some(snapshot))
}

fn write_snapshot(path: &Path, snapshot: &QueueSnapshot) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    // 先写入临时文件，再原子重命名（防止写入中断导致文件损坏）
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, snapshot).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize queue snapshot: {}", e),
        )
    })?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    fs::rename(&temp_path, path)?;
    Ok(())
}
