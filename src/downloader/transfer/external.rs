//! 外部加速器传输（aria2c 子进程）
//!
//! aria2c 自己处理多连接和续传，这里只负责拼参数、解析它的进度输出、
//! 以及在取消时杀掉子进程。二进制缺失时退回内置下载。
//!
//! 多连接时各分段写在文件的不同位置，临时文件长度并不等于已接收字节数，
//! 进度只取 aria2c 汇总行 `[#gid DONE/TOTAL(..%) ...]` 中的已完成量。

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{NativeTransfer, Transfer, TransferOutcome, TransferProgress, TransferRequest, TransferSettings};
use crate::downloader::path::CONTROL_SUFFIX;

/// 轮询子进程和进度的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// 错误输出最多保留的字符数
const STDERR_SNIPPET_LEN: usize = 400;

/// 子进程退出后等待输出读完的最长时间
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

static READOUT_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"\[#[0-9A-Fa-f]+\s+([\d.]+)([KMGT]?i?B)/([\d.]+)([KMGT]?i?B)").ok()
});

/// aria2c 汇总行中的进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Readout {
    completed: u64,
    total: u64,
}

/// 输出读取任务与轮询循环共享的最新进度
#[derive(Debug, Default)]
struct ReadoutState {
    completed: AtomicU64,
    total: AtomicU64,
    seen: AtomicBool,
}

impl ReadoutState {
    fn record(&self, readout: Readout) {
        self.completed.store(readout.completed, Ordering::Relaxed);
        self.total.store(readout.total, Ordering::Relaxed);
        self.seen.store(true, Ordering::Release);
    }

    fn latest(&self) -> Option<Readout> {
        if !self.seen.load(Ordering::Acquire) {
            return None;
        }
        Some(Readout {
            completed: self.completed.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        })
    }
}

/// aria2c 传输
pub struct ExternalTransfer {
    binary: String,
    connections: u32,
    settings: TransferSettings,
    fallback: NativeTransfer,
    poll_interval: Duration,
}

impl ExternalTransfer {
    pub fn new(
        binary: String,
        connections: u32,
        settings: TransferSettings,
        fallback: NativeTransfer,
    ) -> Self {
        Self {
            binary,
            connections: connections.clamp(1, 16),
            settings,
            fallback,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// `aria2c --version` 能正常退出即视为可用
    pub fn is_available(binary: &str) -> bool {
        match std::process::Command::new(binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!("aria2c 未就绪 (exit {}): {}", status, binary);
                false
            }
            Err(e) => {
                debug!("未找到 aria2c: {} ({})", binary, e);
                false
            }
        }
    }

    fn build_command(&self, request: &TransferRequest, dir: &Path, out: &OsString) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--continue=true")
            // 服务端不支持续传时从头下载，而不是直接放弃
            .arg("--always-resume=false")
            .arg("--allow-overwrite=true")
            .arg("--auto-file-renaming=false")
            .arg("--file-allocation=none")
            .arg("--summary-interval=1")
            .arg("--enable-color=false")
            .arg("--console-log-level=warn")
            .arg("--max-tries=1")
            .arg(format!("--split={}", self.connections))
            .arg(format!("--max-connection-per-server={}", self.connections))
            .arg(format!("--timeout={}", self.settings.read_timeout.as_secs().max(1)))
            .arg(format!(
                "--connect-timeout={}",
                self.settings.connect_timeout.as_secs().max(1)
            ))
            .arg("--min-split-size=1M")
            .arg(format!("--user-agent={}", self.settings.user_agent));

        for (name, value) in request.headers.iter() {
            if let Ok(value) = value.to_str() {
                command.arg(format!("--header={}: {}", name.as_str(), value));
            }
        }

        command
            .arg("--dir")
            .arg(dir)
            .arg("--out")
            .arg(out)
            .arg(&request.url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        command
    }
}

/// aria2c 的控制文件 `<partial>.aria2`
fn control_file_for(partial: &Path) -> PathBuf {
    let mut name = OsString::from(partial.as_os_str());
    name.push(CONTROL_SUFFIX);
    PathBuf::from(name)
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

fn snippet(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    text.chars().take(STDERR_SNIPPET_LEN).collect()
}

fn parse_size(value: &str, unit: &str) -> Option<u64> {
    let value: f64 = value.parse().ok()?;
    let scale = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * scale) as u64)
}

/// 解析 `[#2089b0 400.0KiB/33.2MiB(1%) CN:1 DL:115.7KiB ETA:4m51s]`
fn parse_readout(line: &str) -> Option<Readout> {
    let caps = READOUT_RE.as_ref()?.captures(line)?;
    Some(Readout {
        completed: parse_size(caps.get(1)?.as_str(), caps.get(2)?.as_str())?,
        total: parse_size(caps.get(3)?.as_str(), caps.get(4)?.as_str())?,
    })
}

/// aria2c 把错误写进 stdout 的控制台日志
fn is_diagnostic(line: &str) -> bool {
    line.contains("[ERROR]") || line.contains("[WARN]") || line.contains("errorCode=")
}

/// 逐行读取 stdout：汇总行更新进度，诊断行留作失败原因
fn spawn_stdout_reader(stdout: ChildStdout, state: Arc<ReadoutState>) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();
        let mut diagnostics = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            for segment in line.split(|b| *b == b'\r') {
                let text = String::from_utf8_lossy(segment);
                if let Some(readout) = parse_readout(&text) {
                    state.record(readout);
                } else if is_diagnostic(&text) {
                    diagnostics.extend_from_slice(text.trim().as_bytes());
                    diagnostics.push(b'\n');
                }
            }
            if diagnostics.len() > STDERR_SNIPPET_LEN * 4 {
                let excess = diagnostics.len() - STDERR_SNIPPET_LEN * 4;
                diagnostics.drain(..excess);
            }
        }
        diagnostics
    })
}

async fn drain_output(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(handle) = handle else {
        return Vec::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, handle).await {
        Ok(Ok(buf)) => buf,
        _ => Vec::new(),
    }
}

#[async_trait]
impl Transfer for ExternalTransfer {
    fn name(&self) -> &'static str {
        "external"
    }

    fn staging_files(&self, partial: &Path) -> Vec<PathBuf> {
        vec![partial.to_path_buf(), control_file_for(partial)]
    }

    async fn run(
        &self,
        request: &TransferRequest,
        progress: &dyn TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        let (dir, out) = match (request.partial_path.parent(), request.partial_path.file_name()) {
            (Some(dir), Some(name)) => (dir.to_path_buf(), name.to_os_string()),
            _ => bail!("无效的临时文件路径: {:?}", request.partial_path),
        };
        let control_file = control_file_for(&request.partial_path);

        // 1. 探测大小和续传能力；HEAD 失败时保留已有文件，交给 aria2c 的 --continue 判断
        let probe = match self.fallback.probe(&request.url, &request.headers).await {
            Ok(probe) => Some(probe),
            Err(e) => {
                warn!("[{}] HEAD 探测失败，按未知大小处理: {:#}", request.task_id, e);
                None
            }
        };
        let probe_total = probe.map(|p| p.total_bytes).unwrap_or(0);
        let supports_resume = probe.map(|p| p.accept_ranges).unwrap_or(false);

        let offset = file_len(&request.partial_path).await;
        if offset > 0 && probe.is_some() && !supports_resume {
            info!(
                "[{}] 服务端不支持续传，丢弃已有 {} bytes",
                request.task_id, offset
            );
            let _ = tokio::fs::remove_file(&request.partial_path).await;
            let _ = tokio::fs::remove_file(&control_file).await;
        }

        if cancel.is_cancelled() {
            return Ok(TransferOutcome::Interrupted);
        }

        // 2. 启动子进程
        let mut child = match self.build_command(request, &dir, &out).spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "[{}] aria2c 启动失败，退回内置下载: {}",
                    request.task_id, e
                );
                return self.fallback.run(request, progress, cancel).await;
            }
            Err(e) => return Err(e).context("启动 aria2c 失败"),
        };

        info!(
            "[{}] aria2c 已启动: connections={}, 已有临时文件 {} bytes",
            request.task_id, self.connections, offset
        );

        let readouts = Arc::new(ReadoutState::default());
        let stdout_reader = child
            .stdout
            .take()
            .map(|stdout| spawn_stdout_reader(stdout, readouts.clone()));
        // stderr 单独读取，避免管道写满阻塞子进程
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                buf
            })
        });

        // 3. 轮询直到退出或被取消；第一条汇总行到达时才知道真正的续传起点
        let cap = |completed: u64| {
            if probe_total > 0 {
                completed.min(probe_total)
            } else {
                completed
            }
        };
        let mut reported: Option<u64> = None;
        let report = |readout: Readout, reported: &mut Option<u64>| {
            let completed = cap(readout.completed);
            let total = if probe_total > 0 { probe_total } else { readout.total };
            match *reported {
                // aria2c 放弃旧数据从头下载时已完成量会变小
                Some(last) if completed < last => {
                    progress.on_start(completed, total, false);
                }
                Some(last) if completed == last => return,
                Some(_) => progress.on_bytes(completed),
                None => progress.on_start(completed, total, supports_resume),
            }
            *reported = Some(completed);
        };

        let status = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("[{}] 终止 aria2c 失败: {}", request.task_id, e);
                    }
                    if let Some(handle) = &stdout_reader {
                        handle.abort();
                    }
                    debug!("[{}] aria2c 已终止", request.task_id);
                    return Ok(TransferOutcome::Interrupted);
                }
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Some(readout) = readouts.latest() {
                        report(readout, &mut reported);
                    }
                    if let Some(status) = child.try_wait().context("查询 aria2c 状态失败")? {
                        break status;
                    }
                }
            }
        };

        let diagnostics = drain_output(stdout_reader).await;
        let stderr = drain_output(stderr_reader).await;

        if !status.success() {
            let details = match snippet(&stderr) {
                s if s.is_empty() => snippet(&diagnostics),
                s => s,
            };
            if details.is_empty() {
                bail!("aria2c 下载失败 ({})", status);
            }
            bail!("aria2c 下载失败 ({}): {}", status, details);
        }

        // 4. 成功后分段已全部写完，文件长度即实际大小
        let _ = tokio::fs::remove_file(&control_file).await;
        let bytes = file_len(&request.partial_path).await;
        if reported.is_none() {
            progress.on_start(0, probe_total, supports_resume);
        }
        progress.on_bytes(bytes);

        Ok(TransferOutcome::Finished {
            bytes,
            total_bytes: probe_total,
        })
    }
}
