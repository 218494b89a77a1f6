//! WebSocket 消息类型定义

use crate::downloader::DownloadTask;
use crate::server::events::TimestampedEvent;
use serde::{Deserialize, Serialize};

/// 客户端发送给服务端的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    /// 心跳 Ping
    Ping {
        /// 客户端时间戳（毫秒）
        timestamp: i64,
    },
    /// 请求全部任务的快照
    RequestSnapshot,
}

/// 服务端发送给客户端的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    /// 心跳 Pong
    Pong {
        /// 服务端时间戳（毫秒）
        timestamp: i64,
        /// 回显客户端时间戳（用于计算延迟）
        client_timestamp: Option<i64>,
    },
    /// 下载事件
    Event {
        #[serde(flatten)]
        event: TimestampedEvent,
    },
    /// 任务快照
    Snapshot { downloads: Vec<DownloadTask> },
    /// 连接成功
    Connected {
        /// 连接 ID
        connection_id: String,
        /// 服务端时间戳
        timestamp: i64,
    },
    /// 错误消息
    Error { code: String, message: String },
}

impl WsServerMessage {
    /// 创建 Pong 消息
    pub fn pong(client_timestamp: Option<i64>) -> Self {
        Self::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
            client_timestamp,
        }
    }

    /// 创建 Connected 消息
    pub fn connected(connection_id: String) -> Self {
        Self::Connected {
            connection_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 创建错误消息
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn event(event: TimestampedEvent) -> Self {
        Self::Event { event }
    }
}
