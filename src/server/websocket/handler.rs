//! WebSocket 路由处理器

use crate::server::websocket::message::{WsClientMessage, WsServerMessage};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket 路由处理器
///
/// 升级 HTTP 连接为 WebSocket，处理消息收发
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// 处理 WebSocket 连接
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!("新的 WebSocket 连接: {}", connection_id);

    // 注册为进度观察者，连接断开后通道关闭，广播器会自动移除它
    let (observer_id, mut events) = state.download_manager.subscribe_channel();
    let (reply_tx, mut replies) = mpsc::unbounded_channel::<WsServerMessage>();

    let (mut sender, mut receiver) = socket.split();

    let connected_msg = WsServerMessage::connected(connection_id.clone());
    if let Ok(json) = serde_json::to_string(&connected_msg) {
        if sender.send(Message::Text(json)).await.is_err() {
            error!("发送连接成功消息失败");
            state.download_manager.unsubscribe(observer_id);
            return;
        }
    }

    // 启动发送任务：下载事件和对客户端请求的回复走同一个 sink
    let send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(event) = events.recv() => WsServerMessage::event(event),
                Some(reply) = replies.recv() => reply,
                else => break,
            };
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("序列化消息失败: {}", e);
                }
            }
        }
    });

    let state_recv = state.clone();
    let conn_id_recv = connection_id.clone();

    // 启动接收任务
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => {
                    handle_client_message(&state_recv, &conn_id_recv, &text, &reply_tx);
                }
                Message::Binary(data) => {
                    if let Ok(text) = String::from_utf8(data) {
                        handle_client_message(&state_recv, &conn_id_recv, &text, &reply_tx);
                    }
                }
                Message::Ping(_) | Message::Pong(_) => {
                    debug!("收到心跳: {}", conn_id_recv);
                }
                Message::Close(_) => {
                    info!("收到关闭消息: {}", conn_id_recv);
                    break;
                }
            }
        }
    });

    // 等待任一任务结束
    tokio::select! {
        _ = send_task => {
            debug!("发送任务结束: {}", connection_id);
        }
        _ = recv_task => {
            debug!("接收任务结束: {}", connection_id);
        }
    }

    state.download_manager.unsubscribe(observer_id);
    info!("WebSocket 连接已关闭: {}", connection_id);
}

/// 处理客户端消息
fn handle_client_message(
    state: &AppState,
    connection_id: &str,
    text: &str,
    reply: &mpsc::UnboundedSender<WsServerMessage>,
) {
    let response = match serde_json::from_str::<WsClientMessage>(text) {
        Ok(WsClientMessage::Ping { timestamp }) => WsServerMessage::pong(Some(timestamp)),
        Ok(WsClientMessage::RequestSnapshot) => {
            debug!("收到状态快照请求: {}", connection_id);
            WsServerMessage::Snapshot {
                downloads: state.download_manager.get_all_tasks(),
            }
        }
        Err(e) => {
            warn!("解析客户端消息失败: {} - {}", connection_id, e);
            WsServerMessage::error("PARSE_ERROR", format!("消息解析失败: {}", e))
        }
    };

    let _ = reply.send(response);
}
