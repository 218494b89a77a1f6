// 配置管理模块

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 站点访问令牌
    #[serde(default)]
    pub auth: AuthConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS允许的源（为空时允许任意来源）
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18890
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

/// 传输引擎
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferEngine {
    /// 内置 reqwest 流式下载
    #[default]
    Native,
    /// aria2c 多连接下载，不可用时退回内置
    External,
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 模型根目录，所有任务的目标目录都相对于它
    #[serde(default = "default_models_root")]
    pub models_root: PathBuf,
    /// 最大同时下载数（0 表示不限）
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// 传输引擎
    #[serde(default)]
    pub engine: TransferEngine,
    /// aria2c 可执行文件
    #[serde(default = "default_aria2c_path")]
    pub aria2c_path: String,
    /// aria2c 单文件连接数
    #[serde(default = "default_aria2c_connections")]
    pub aria2c_connections: u32,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 读取超时（秒），两个数据块之间的最长等待
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// 进度采样间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_models_root() -> PathBuf {
    PathBuf::from("models")
}

fn default_max_parallel() -> usize {
    3
}

fn default_aria2c_path() -> String {
    "aria2c".to_string()
}

fn default_aria2c_connections() -> u32 {
    8
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_progress_interval_ms() -> u64 {
    500
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            models_root: default_models_root(),
            max_parallel: default_max_parallel(),
            engine: TransferEngine::default(),
            aria2c_path: default_aria2c_path(),
            aria2c_connections: default_aria2c_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl DownloadConfig {
    /// 校验下载参数
    pub fn validate(&self) -> Result<()> {
        if self.models_root.as_os_str().is_empty() {
            bail!("models_root 不能为空");
        }
        if !(1..=16).contains(&self.aria2c_connections) {
            bail!(
                "aria2c_connections 必须在 1-16 之间，当前: {}",
                self.aria2c_connections
            );
        }
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            bail!("超时时间必须大于 0");
        }
        if self.progress_interval_ms == 0 {
            bail!("progress_interval_ms 必须大于 0");
        }
        Ok(())
    }

    /// 确保模型根目录存在
    pub fn ensure_models_root_exists(&self) -> Result<()> {
        if !self.models_root.exists() {
            std::fs::create_dir_all(&self.models_root)
                .with_context(|| format!("创建模型根目录失败: {:?}", self.models_root))?;
            tracing::info!("✓ 已创建模型根目录: {:?}", self.models_root);
        }
        Ok(())
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 队列快照文件
    #[serde(default = "default_queue_file")]
    pub queue_file: PathBuf,
    /// 完成历史数据库
    #[serde(default = "default_history_db")]
    pub history_db: PathBuf,
}

fn default_queue_file() -> PathBuf {
    PathBuf::from("data/download_queue.json")
}

fn default_history_db() -> PathBuf {
    PathBuf::from("data/history.db")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            queue_file: default_queue_file(),
            history_db: default_history_db(),
        }
    }
}

/// 站点访问令牌
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HuggingFace 令牌（Authorization 请求头）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub huggingface_token: Option<String>,
    /// CivitAI 令牌（token 查询参数）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub civitai_token: Option<String>,
}

impl AppConfig {
    /// 校验整体配置
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            bail!("server.host 不能为空");
        }
        self.download.validate().context("下载配置无效")?;
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 只在文件不存在时写出默认配置，不覆盖用户写坏的文件
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
