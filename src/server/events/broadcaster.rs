//! 进度广播
//!
//! 调度器只认识 `ProgressBroadcaster`，不关心事件最终推给谁。
//! 观察者出错（例如 WebSocket 已断开）时只会被移除，错误不会回流到传输路径。

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{DownloadEvent, TimestampedEvent};

/// 观察者 ID
pub type ObserverId = u64;

/// 进度观察者
pub trait ProgressObserver: Send + Sync {
    /// 接收一个事件；返回 Err 表示观察者已失效，会被自动移除
    fn on_event(&self, event: &TimestampedEvent) -> Result<()>;
}

/// 事件广播器
pub struct ProgressBroadcaster {
    observers: RwLock<Vec<(ObserverId, Arc<dyn ProgressObserver>)>>,
    next_observer_id: AtomicU64,
    next_event_id: AtomicU64,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            next_event_id: AtomicU64::new(1),
        }
    }

    /// 注册观察者
    pub fn subscribe(&self, observer: Arc<dyn ProgressObserver>) -> ObserverId {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((id, observer));
        debug!("注册进度观察者: {}", id);
        id
    }

    /// 注册一个通道观察者，返回接收端
    pub fn subscribe_channel(&self) -> (ObserverId, mpsc::UnboundedReceiver<TimestampedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(Arc::new(ChannelObserver::new(tx)));
        (id, rx)
    }

    /// 注销观察者
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        let removed = observers.len() != before;
        if removed {
            debug!("注销进度观察者: {}", id);
        }
        removed
    }

    /// 当前观察者数量
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// 分发事件
    ///
    /// 在锁外逐个调用观察者，失败或 panic 的观察者在分发结束后统一移除
    pub fn notify(&self, event: DownloadEvent) {
        let observers: Vec<_> = self.observers.read().clone();
        if observers.is_empty() {
            return;
        }

        let event_id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let event = TimestampedEvent::new(event_id, event);

        let mut failed = Vec::new();
        for (id, observer) in &observers {
            let outcome = catch_unwind(AssertUnwindSafe(|| observer.on_event(&event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("进度观察者 {} 推送失败，已移除: {}", id, e);
                    failed.push(*id);
                }
                Err(_) => {
                    warn!("进度观察者 {} 发生 panic，已移除", id);
                    failed.push(*id);
                }
            }
        }

        if !failed.is_empty() {
            self.observers
                .write()
                .retain(|(id, _)| !failed.contains(id));
        }
    }
}

/// 基于 mpsc 通道的观察者
///
/// 接收端被丢弃后 `on_event` 返回错误
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<TimestampedEvent>,
}

impl ChannelObserver {
    pub fn new(sender: mpsc::UnboundedSender<TimestampedEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_event(&self, event: &TimestampedEvent) -> Result<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| anyhow!("通道接收端已关闭"))
    }
}
