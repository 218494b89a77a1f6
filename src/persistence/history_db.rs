//! 下载历史 SQLite 数据库
//!
//! 成功落盘的任务写入 `download_history` 表，供外部查询已获取的模型。
//! 历史写入失败只记日志，不影响任务本身的状态。

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::downloader::DownloadTask;

/// 完成记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub id: String,
    pub filename: String,
    pub directory: String,
    pub url: String,
    pub source: String,
    pub status: String,
    pub total_size: u64,
    /// 完成时间 (Unix timestamp)
    pub completed_at: i64,
}

impl CompletionRecord {
    /// 从已完成任务生成记录
    pub fn from_task(task: &DownloadTask) -> Self {
        Self {
            id: task.id.clone(),
            filename: task.filename.clone(),
            directory: task.directory.clone(),
            url: task.url.clone(),
            source: task.source.as_str().to_string(),
            status: task.status.as_str().to_string(),
            total_size: task.total_bytes,
            completed_at: task
                .completed_at
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
        }
    }
}

/// 历史数据库管理器
pub struct HistoryDbManager {
    /// SQLite 连接
    conn: Mutex<Connection>,
}

impl HistoryDbManager {
    /// 创建新的历史数据库管理器
    pub fn new(db_path: &Path) -> Result<Self> {
        // 确保父目录存在
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        let manager = Self {
            conn: Mutex::new(conn),
        };
        manager.init_tables()?;

        Ok(manager)
    }

    /// 内存数据库（测试用）
    pub fn in_memory() -> Result<Self> {
        let manager = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        manager.init_tables()?;
        Ok(manager)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS download_history (
                task_id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                directory TEXT NOT NULL,
                url TEXT NOT NULL,
                source TEXT NOT NULL,
                status TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                completed_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_download_history_completed ON download_history(completed_at)",
            [],
        )?;

        Ok(())
    }

    /// 写入一条完成记录（同 ID 覆盖）
    pub fn add_completion(&self, record: &CompletionRecord) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO download_history (
                task_id, filename, directory, url, source, status, total_size, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                record.id,
                record.filename,
                record.directory,
                record.url,
                record.source,
                record.status,
                record.total_size as i64,
                record.completed_at,
            ],
        )?;

        debug!("已写入下载历史: {} ({})", record.id, record.filename);
        Ok(())
    }

    /// 最近完成的记录，按完成时间倒序
    pub fn recent(&self, limit: usize) -> Result<Vec<CompletionRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT task_id, filename, directory, url, source, status, total_size, completed_at
            FROM download_history
            ORDER BY completed_at DESC, rowid DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![limit as i64], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// 按 ID 查询
    pub fn get(&self, task_id: &str) -> Result<Option<CompletionRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        let record = conn
            .query_row(
                r#"
                SELECT task_id, filename, directory, url, source, status, total_size, completed_at
                FROM download_history WHERE task_id = ?1
                "#,
                params![task_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// 记录总数
    pub fn count(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        let total: i64 =
            conn.query_row("SELECT COUNT(*) FROM download_history", [], |row| row.get(0))?;
        Ok(total as usize)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CompletionRecord> {
    Ok(CompletionRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        directory: row.get(2)?,
        url: row.get(3)?,
        source: row.get(4)?,
        status: row.get(5)?,
        total_size: row.get::<_, i64>(6)? as u64,
        completed_at: row.get(7)?,
    })
}
