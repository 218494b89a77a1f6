use serde::{Deserialize, Serialize};
use std::fmt;

/// 默认优先级（数值越小越先调度）
pub const DEFAULT_PRIORITY: i32 = 100;

/// 下载任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 排队中
    Queued,
    /// 下载中
    Downloading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    /// 是否为终态（completed / failed / cancelled）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 下载来源
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Huggingface,
    Civitai,
    #[default]
    Direct,
}

impl SourceKind {
    /// 根据 URL 主机名推断来源
    pub fn from_url(url: &str) -> Self {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()));

        match host.as_deref() {
            Some(h) if h == "huggingface.co" || h.ends_with(".huggingface.co") => {
                SourceKind::Huggingface
            }
            Some(h) if h == "civitai.com" || h.ends_with(".civitai.com") => SourceKind::Civitai,
            _ => SourceKind::Direct,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Huggingface => "huggingface",
            SourceKind::Civitai => "civitai",
            SourceKind::Direct => "direct",
        }
    }
}

/// 下载请求（由模型扫描方提交的记录）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// 下载地址
    pub url: String,
    /// 目标文件名
    pub filename: String,
    /// 目标目录（相对于模型根目录）
    pub directory: String,
    /// 优先级，缺省为 100
    #[serde(default)]
    pub priority: Option<i32>,
    /// 期望的 sha256
    #[serde(default, alias = "sha256")]
    pub expected_hash: Option<String>,
    /// 来源，缺省时按 URL 推断
    #[serde(default)]
    pub source: Option<SourceKind>,
    #[serde(default)]
    pub hf_repo: Option<String>,
    #[serde(default)]
    pub hf_path: Option<String>,
}

impl DownloadRequest {
    pub fn new(
        url: impl Into<String>,
        filename: impl Into<String>,
        directory: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            filename: filename.into(),
            directory: directory.into(),
            priority: None,
            expected_hash: None,
            source: None,
            hf_repo: None,
            hf_path: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.expected_hash = Some(hash.into());
        self
    }
}

/// 下载任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// 任务ID
    pub id: String,
    /// 下载地址（CivitAI 任务会被追加 token 参数）
    pub url: String,
    /// 目标文件名
    pub filename: String,
    /// 目标目录（相对于模型根目录）
    pub directory: String,
    /// 来源
    #[serde(default)]
    pub source: SourceKind,
    /// HuggingFace 仓库
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hf_repo: Option<String>,
    /// HuggingFace 仓库内路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hf_path: Option<String>,
    /// 期望的 sha256（十六进制，大小写不敏感）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    /// 任务状态
    pub status: TaskStatus,
    /// 已下载字节数
    pub downloaded_bytes: u64,
    /// 总字节数（0 表示未知）
    pub total_bytes: u64,
    /// 下载速度 (bytes/s)
    pub speed_bps: u64,
    /// 剩余时间（秒）
    pub eta_seconds: Option<u64>,
    /// 续传起点
    pub resume_from: u64,
    /// 服务端是否确认支持 Range 续传
    pub supports_resume: bool,
    /// 优先级（数值越小越先调度）
    pub priority: i32,
    /// 入队序号，同优先级按此先进先出
    #[serde(default)]
    pub seq: u64,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 错误信息
    pub error: Option<String>,
}

/// 根据 URL、文件名、创建时间和入队序号派生任务ID
///
/// `salt` 用于在极端情况下（ID 已存在）重新派生
pub fn derive_task_id(url: &str, filename: &str, created_nanos: i64, seq: u64, salt: u32) -> String {
    let digest = md5::compute(format!("{}_{}_{}_{}_{}", url, filename, created_nanos, seq, salt));
    let hex = format!("{:x}", digest);
    hex[..16].to_string()
}

impl DownloadTask {
    pub fn new(id: String, request: DownloadRequest, seq: u64) -> Self {
        let source = request
            .source
            .unwrap_or_else(|| SourceKind::from_url(&request.url));

        Self {
            id,
            url: request.url,
            filename: request.filename,
            directory: request.directory,
            source,
            hf_repo: request.hf_repo,
            hf_path: request.hf_path,
            expected_hash: request
                .expected_hash
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty()),
            status: TaskStatus::Queued,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed_bps: 0,
            eta_seconds: None,
            resume_from: 0,
            supports_resume: false,
            priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
            seq,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// 进度百分比，总大小未知时为 None
    pub fn progress_percent(&self) -> Option<f64> {
        if self.total_bytes == 0 {
            return None;
        }
        Some((self.downloaded_bytes as f64 / self.total_bytes as f64) * 100.0)
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self) -> Option<u64> {
        if self.speed_bps == 0 || self.total_bytes == 0 || self.downloaded_bytes >= self.total_bytes {
            return None;
        }
        let remaining = self.total_bytes - self.downloaded_bytes;
        Some(remaining / self.speed_bps)
    }

    /// 标记为下载中
    ///
    /// 已下载字节数保持不变，由传输层在拿到响应后写入真正的续传起点
    pub fn mark_downloading(&mut self) {
        self.status = TaskStatus::Downloading;
        self.speed_bps = 0;
        self.eta_seconds = None;
        self.error = None;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 传输开始：记录续传起点和总大小
    pub fn record_start(&mut self, resume_from: u64, total_bytes: u64, supports_resume: bool) {
        self.resume_from = resume_from;
        self.total_bytes = total_bytes;
        self.supports_resume = supports_resume;
        self.downloaded_bytes = resume_from;
    }

    /// 更新已下载字节数（只增不减）
    pub fn record_bytes(&mut self, downloaded: u64) {
        if downloaded > self.downloaded_bytes {
            self.downloaded_bytes = downloaded;
        }
        if self.total_bytes > 0 && self.downloaded_bytes > self.total_bytes {
            self.total_bytes = self.downloaded_bytes;
        }
    }

    /// 记录一次速度采样
    pub fn record_speed(&mut self, speed_bps: u64) {
        self.speed_bps = speed_bps;
        self.eta_seconds = self.eta();
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self, final_size: u64) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.total_bytes = final_size;
        self.downloaded_bytes = final_size;
        self.speed_bps = 0;
        self.eta_seconds = None;
        self.error = None;
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.speed_bps = 0;
        self.eta_seconds = None;
    }

    /// 标记为暂停
    pub fn mark_paused(&mut self) {
        self.status = TaskStatus::Paused;
        self.speed_bps = 0;
        self.eta_seconds = None;
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.speed_bps = 0;
        self.eta_seconds = None;
    }

    /// 重新排队（resume / retry）
    pub fn mark_queued(&mut self) {
        self.status = TaskStatus::Queued;
        self.speed_bps = 0;
        self.eta_seconds = None;
    }

    /// 进程重启后恢复：下载中的任务不可能存活，降级为排队
    pub fn demote_after_restart(&mut self) -> bool {
        if self.status == TaskStatus::Downloading {
            self.mark_queued();
            return true;
        }
        false
    }
}
