//! WebSocket 模块
//!
//! 每个连接注册为一个进度观察者，实时推送下载事件

mod handler;
mod message;

pub use handler::handle_websocket;
pub use message::{WsClientMessage, WsServerMessage};
