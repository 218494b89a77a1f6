//! 下载事件类型定义
//!
//! 调度器每次状态变更或按采样周期更新进度时产生一个事件，
//! 经 `ProgressBroadcaster` 分发给所有观察者（WebSocket、测试通道等）

use serde::{Deserialize, Serialize};

use crate::downloader::{format_eta, format_speed, DownloadTask, TaskStatus};

/// 单个任务的进度快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: String,
    pub filename: String,
    pub status: TaskStatus,
    /// 总大小未知时省略
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<f64>,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: u64,
    /// 展示用速度，如 `1.5 MB/s`
    #[serde(default)]
    pub speed_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    /// 展示用剩余时间，速度未知时为 `calculating...`
    #[serde(default)]
    pub eta_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&DownloadTask> for ProgressEvent {
    fn from(task: &DownloadTask) -> Self {
        Self {
            id: task.id.clone(),
            filename: task.filename.clone(),
            status: task.status,
            progress_percent: task.progress_percent(),
            downloaded_bytes: task.downloaded_bytes,
            total_bytes: task.total_bytes,
            speed_bytes_per_sec: task.speed_bps,
            speed_text: format_speed(task.speed_bps as f64),
            eta_seconds: task.eta_seconds,
            eta_text: format_eta(task.eta_seconds.unwrap_or(0) as f64),
            error: task.error.clone(),
        }
    }
}

/// 下载任务事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// 任务创建
    Created {
        #[serde(flatten)]
        task: ProgressEvent,
    },
    /// 进度更新（按采样周期，不是每个 chunk）
    Progress {
        #[serde(flatten)]
        task: ProgressEvent,
    },
    /// 状态变更
    StatusChanged {
        old_status: TaskStatus,
        #[serde(flatten)]
        task: ProgressEvent,
    },
    /// 任务完成
    Completed {
        #[serde(flatten)]
        task: ProgressEvent,
    },
    /// 任务失败
    Failed {
        #[serde(flatten)]
        task: ProgressEvent,
    },
    /// 任务暂停
    Paused {
        #[serde(flatten)]
        task: ProgressEvent,
    },
    /// 任务取消
    Cancelled {
        #[serde(flatten)]
        task: ProgressEvent,
    },
    /// 任务从活动集合中移除
    Removed { task_id: String },
}

impl DownloadEvent {
    /// 根据任务状态生成对应事件
    ///
    /// 终态和暂停使用专门的事件类型，其余状态变更统一为 `StatusChanged`
    pub fn for_transition(old_status: TaskStatus, task: &DownloadTask) -> Self {
        let snapshot = ProgressEvent::from(task);
        match task.status {
            TaskStatus::Completed => DownloadEvent::Completed { task: snapshot },
            TaskStatus::Failed => DownloadEvent::Failed { task: snapshot },
            TaskStatus::Paused => DownloadEvent::Paused { task: snapshot },
            TaskStatus::Cancelled => DownloadEvent::Cancelled { task: snapshot },
            TaskStatus::Queued | TaskStatus::Downloading => DownloadEvent::StatusChanged {
                old_status,
                task: snapshot,
            },
        }
    }

    /// 获取任务 ID
    pub fn task_id(&self) -> &str {
        match self {
            DownloadEvent::Created { task }
            | DownloadEvent::Progress { task }
            | DownloadEvent::StatusChanged { task, .. }
            | DownloadEvent::Completed { task }
            | DownloadEvent::Failed { task }
            | DownloadEvent::Paused { task }
            | DownloadEvent::Cancelled { task } => &task.id,
            DownloadEvent::Removed { task_id } => task_id,
        }
    }

    /// 进度快照（`Removed` 没有）
    pub fn snapshot(&self) -> Option<&ProgressEvent> {
        match self {
            DownloadEvent::Created { task }
            | DownloadEvent::Progress { task }
            | DownloadEvent::StatusChanged { task, .. }
            | DownloadEvent::Completed { task }
            | DownloadEvent::Failed { task }
            | DownloadEvent::Paused { task }
            | DownloadEvent::Cancelled { task } => Some(task),
            DownloadEvent::Removed { .. } => None,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            DownloadEvent::Created { .. } => "created",
            DownloadEvent::Progress { .. } => "progress",
            DownloadEvent::StatusChanged { .. } => "status_changed",
            DownloadEvent::Completed { .. } => "completed",
            DownloadEvent::Failed { .. } => "failed",
            DownloadEvent::Paused { .. } => "paused",
            DownloadEvent::Cancelled { .. } => "cancelled",
            DownloadEvent::Removed { .. } => "removed",
        }
    }
}

/// 带时间戳的事件包装器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    /// 事件 ID（全局唯一递增）
    pub event_id: u64,
    /// 时间戳（Unix 毫秒）
    pub timestamp: i64,
    /// 事件内容
    #[serde(flatten)]
    pub event: DownloadEvent,
}

impl TimestampedEvent {
    /// 创建新的带时间戳事件
    pub fn new(event_id: u64, event: DownloadEvent) -> Self {
        Self {
            event_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            event,
        }
    }
}
