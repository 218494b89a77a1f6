//! 速度采样与进度格式化
//!
//! 速度按固定窗口（默认 500ms）采样：`speed = 窗口内字节增量 / 窗口时长`。
//! 采样同时决定进度事件的推送节奏，避免每个 chunk 都通知观察者。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认采样间隔（毫秒）
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 500;

/// 一次速度采样结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    /// 瞬时速度 (bytes/s)
    pub speed_bps: u64,
    /// 窗口时长（秒）
    pub window_secs: f64,
}

/// 速度采样器
///
/// 线程安全，使用原子操作避免锁竞争
/// 典型用法：每写入一个 chunk 调用 `sample()`，返回 Some 时更新速度并推送进度
#[derive(Debug)]
pub struct SpeedSampler {
    /// 计时起点
    origin: Instant,
    /// 上次采样时间（相对 origin 的纳秒）
    last_sample_nanos: AtomicU64,
    /// 上次采样时的字节数
    last_sample_bytes: AtomicU64,
    /// 采样间隔（纳秒）
    interval_nanos: u64,
}

impl SpeedSampler {
    /// 创建新的采样器
    ///
    /// # 参数
    /// * `interval` - 采样窗口
    /// * `start_bytes` - 起始字节数（续传时为续传起点）
    pub fn new(interval: Duration, start_bytes: u64) -> Self {
        Self {
            origin: Instant::now(),
            last_sample_nanos: AtomicU64::new(0),
            last_sample_bytes: AtomicU64::new(start_bytes),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 使用指定毫秒间隔创建采样器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms), 0)
    }

    /// 重置窗口起点（传输真正开始时调用）
    pub fn restart(&self, start_bytes: u64) {
        self.last_sample_nanos
            .store(self.current_nanos(), Ordering::Relaxed);
        self.last_sample_bytes.store(start_bytes, Ordering::Relaxed);
    }

    /// 检查是否到达采样点
    ///
    /// 距上次采样超过间隔时返回本窗口的速度并开启新窗口，否则返回 None
    pub fn sample(&self, downloaded: u64) -> Option<SpeedSample> {
        let now_nanos = self.current_nanos();
        let last = self.last_sample_nanos.load(Ordering::Relaxed);
        let elapsed = now_nanos.saturating_sub(last);

        if elapsed < self.interval_nanos {
            return None;
        }

        // 使用 CAS 更新时间戳，被其他线程抢先时本次不采样
        if self
            .last_sample_nanos
            .compare_exchange(last, now_nanos, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        let last_bytes = self.last_sample_bytes.swap(downloaded, Ordering::Relaxed);
        let delta = downloaded.saturating_sub(last_bytes);
        let window_secs = elapsed as f64 / 1_000_000_000.0;
        let speed_bps = if window_secs > 0.0 {
            (delta as f64 / window_secs) as u64
        } else {
            0
        };

        Some(SpeedSample {
            speed_bps,
            window_secs,
        })
    }

    fn current_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

impl Default for SpeedSampler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_SAMPLE_INTERVAL_MS)
    }
}

/// 格式化速度
pub fn format_speed(bps: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;

    if bps >= MB {
        format!("{:.1} MB/s", bps / MB)
    } else if bps >= KB {
        format!("{:.1} KB/s", bps / KB)
    } else {
        format!("{:.0} B/s", bps)
    }
}

/// 格式化剩余时间
pub fn format_eta(seconds: f64) -> String {
    if seconds <= 0.0 {
        return "calculating...".to_string();
    }

    let total = seconds as u64;
    if seconds < 60.0 {
        format!("{}s", total)
    } else if seconds < 3600.0 {
        format!("{}m {}s", total / 60, total % 60)
    } else {
        format!("{}h {}m", total / 3600, (total % 3600) / 60)
    }
}
