//! 内置 HTTP 传输（reqwest 流式下载）

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Transfer, TransferOutcome, TransferProgress, TransferRequest, TransferSettings};

/// HEAD 探测结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteProbe {
    /// Content-Length（0 表示未知）
    pub total_bytes: u64,
    /// 是否声明 `Accept-Ranges: bytes`
    pub accept_ranges: bool,
}

/// 响应确定后的写入方式
#[derive(Debug, Clone, Copy)]
struct StreamStart {
    /// 续传起点（0 表示从头写）
    resume_from: u64,
    /// 总大小（0 表示未知）
    total_bytes: u64,
    /// 服务端是否确认支持续传
    supports_resume: bool,
}

/// 内置下载器
#[derive(Debug, Clone)]
pub struct NativeTransfer {
    client: Client,
    settings: TransferSettings,
}

impl NativeTransfer {
    pub fn new(settings: TransferSettings) -> Result<Self> {
        // 不设置整体超时：大文件下载可能持续数小时，读超时按 chunk 单独控制
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(settings.connect_timeout)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_keepalive(std::time::Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("创建HTTP客户端失败")?;

        Ok(Self { client, settings })
    }

    /// HEAD 探测远端大小和续传能力
    pub async fn probe(&self, url: &str, headers: &HeaderMap) -> Result<RemoteProbe> {
        let resp = self
            .client
            .head(url)
            .headers(headers.clone())
            .timeout(self.settings.read_timeout)
            .send()
            .await
            .context("发送HEAD请求失败")?;

        if !resp.status().is_success() {
            bail!("HEAD 请求失败: {}", resp.status());
        }

        Ok(RemoteProbe {
            total_bytes: header_u64(resp.headers(), CONTENT_LENGTH).unwrap_or(0),
            accept_ranges: accepts_byte_ranges(resp.headers()),
        })
    }

    /// 发起请求并决定续传还是从头下载
    ///
    /// - 206 且 Content-Range 起点等于续传起点：追加
    /// - 200：服务端忽略了 Range，从头下载
    /// - 416 或起点不符：丢弃续传起点重新请求
    async fn open_stream(
        &self,
        request: &TransferRequest,
        mut offset: u64,
    ) -> Result<(Response, StreamStart)> {
        loop {
            let mut builder = self.client.get(&request.url).headers(request.headers.clone());
            if offset > 0 {
                builder = builder.header(RANGE, format!("bytes={}-", offset));
            }

            let resp = builder.send().await.context("发送HTTP请求失败")?;
            let status = resp.status();

            if offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
                warn!(
                    "[{}] 服务端拒绝续传范围 (offset={})，从头下载",
                    request.task_id, offset
                );
                offset = 0;
                continue;
            }

            if !status.is_success() {
                bail!("HTTP错误: {}", status);
            }

            let content_length = header_u64(resp.headers(), CONTENT_LENGTH)
                .or_else(|| resp.content_length())
                .unwrap_or(0);

            if status == StatusCode::PARTIAL_CONTENT {
                let range = resp
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range);

                let start = range.map(|r| r.start).unwrap_or(offset);
                if start != offset {
                    warn!(
                        "[{}] Content-Range 起点 {} 与续传起点 {} 不符，从头下载",
                        request.task_id, start, offset
                    );
                    offset = 0;
                    continue;
                }

                let total_bytes = range
                    .and_then(|r| r.total)
                    .unwrap_or_else(|| if content_length > 0 { offset + content_length } else { 0 });

                return Ok((
                    resp,
                    StreamStart {
                        resume_from: offset,
                        total_bytes,
                        supports_resume: true,
                    },
                ));
            }

            if offset > 0 {
                info!(
                    "[{}] 服务端忽略 Range 请求 (HTTP {})，丢弃 {} bytes 从头下载",
                    request.task_id, status, offset
                );
            }

            let supports_resume = accepts_byte_ranges(resp.headers());
            return Ok((
                resp,
                StreamStart {
                    resume_from: 0,
                    total_bytes: content_length,
                    supports_resume,
                },
            ));
        }
    }
}

#[async_trait]
impl Transfer for NativeTransfer {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn run(
        &self,
        request: &TransferRequest,
        progress: &dyn TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome> {
        // 1. 已有临时文件的大小即续传起点
        let offset = match tokio::fs::metadata(&request.partial_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        if cancel.is_cancelled() {
            return Ok(TransferOutcome::Interrupted);
        }

        let (resp, start) = self.open_stream(request, offset).await?;
        progress.on_start(start.resume_from, start.total_bytes, start.supports_resume);

        debug!(
            "[{}] 开始传输: resume_from={}, total={}, supports_resume={}",
            request.task_id, start.resume_from, start.total_bytes, start.supports_resume
        );

        // 2. 206 追加写入，否则截断重写
        let mut file = if start.resume_from > 0 {
            OpenOptions::new()
                .append(true)
                .open(&request.partial_path)
                .await
                .context("打开临时文件失败")?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&request.partial_path)
                .await
                .context("创建临时文件失败")?
        };

        // 3. 流式写入，chunk 边界检查取消信号
        let mut stream = resp.bytes_stream();
        let mut downloaded = start.resume_from;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = tokio::time::timeout(self.settings.read_timeout, stream.next()) => Some(next),
            };

            let chunk = match next {
                None => {
                    file.flush().await.context("刷新文件缓冲失败")?;
                    debug!("[{}] 传输在 {} bytes 处中止", request.task_id, downloaded);
                    return Ok(TransferOutcome::Interrupted);
                }
                Some(Err(_)) => bail!(
                    "读取数据超时: {}s 内未收到数据",
                    self.settings.read_timeout.as_secs()
                ),
                Some(Ok(None)) => break,
                Some(Ok(Some(chunk))) => chunk.context("读取数据流失败")?,
            };

            if cancel.is_cancelled() {
                file.flush().await.context("刷新文件缓冲失败")?;
                return Ok(TransferOutcome::Interrupted);
            }

            file.write_all(&chunk).await.context("写入临时文件失败")?;
            downloaded += chunk.len() as u64;
            progress.on_bytes(downloaded);
        }

        // 4. 关闭前落盘
        file.flush().await.context("刷新文件缓冲失败")?;
        file.sync_all().await.context("同步临时文件失败")?;
        drop(file);

        Ok(TransferOutcome::Finished {
            bytes: downloaded,
            total_bytes: start.total_bytes,
        })
    }
}

fn header_u64(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn accepts_byte_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
        .unwrap_or(false)
}

/// Content-Range 解析结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    start: u64,
    end: u64,
    total: Option<u64>,
}

static CONTENT_RANGE_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\s*bytes\s+(\d+)-(\d+)/(\d+|\*)\s*$").ok());

/// 解析 `bytes START-END/TOTAL`，TOTAL 可为 `*`
fn parse_content_range(value: &str) -> Option<ContentRange> {
    let caps = CONTENT_RANGE_RE.as_ref()?.captures(value)?;

    Some(ContentRange {
        start: caps.get(1)?.as_str().parse().ok()?,
        end: caps.get(2)?.as_str().parse().ok()?,
        total: caps.get(3).and_then(|m| m.as_str().parse().ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::transfer::testing::RecordingProgress;
    use axum::body::Bytes;
    use axum::extract::{Path as UrlPath, State};
    use axum::http::{header, HeaderMap as AxumHeaders, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::get;
    use axum::Router;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Clone)]
    struct RangeServer {
        data: Bytes,
        ranges: Arc<Mutex<Vec<Option<String>>>>,
    }

    /// `/exact`: 正常处理 Range，起点越界返回 416
    /// `/skew`: 任何 Range 请求都回 `bytes 0-.../total`，起点对不上
    async fn serve(
        State(server): State<RangeServer>,
        UrlPath(mode): UrlPath<String>,
        headers: AxumHeaders,
    ) -> AxumResponse {
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        server.ranges.lock().push(range.clone());

        let total = server.data.len();
        let start = range
            .as_deref()
            .and_then(|r| r.strip_prefix("bytes="))
            .and_then(|r| r.strip_suffix('-'))
            .and_then(|r| r.parse::<usize>().ok());

        let (status, offset) = match (mode.as_str(), start) {
            (_, None) => (AxumStatus::OK, 0),
            ("skew", Some(_)) => (AxumStatus::PARTIAL_CONTENT, 0),
            (_, Some(start)) if start >= total => {
                return (
                    AxumStatus::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", total))],
                )
                    .into_response();
            }
            (_, Some(start)) => (AxumStatus::PARTIAL_CONTENT, start),
        };

        let body = server.data.slice(offset..);
        let mut response = (
            status,
            [(header::ACCEPT_RANGES, "bytes".to_string())],
            body,
        )
            .into_response();
        if status == AxumStatus::PARTIAL_CONTENT {
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", offset, total - 1, total)
                    .parse()
                    .unwrap(),
            );
        }
        response
    }

    async fn start_server(data: Bytes) -> (String, RangeServer) {
        let server = RangeServer {
            data,
            ranges: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/:mode", get(serve))
            .with_state(server.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), server)
    }

    fn test_data() -> Bytes {
        (0..4096u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    fn request_for(url: String, partial_path: std::path::PathBuf) -> TransferRequest {
        TransferRequest {
            task_id: "t".to_string(),
            url,
            headers: HeaderMap::new(),
            partial_path,
        }
    }

    async fn run_once(request: &TransferRequest, progress: &RecordingProgress) -> TransferOutcome {
        let transfer = NativeTransfer::new(TransferSettings::default()).unwrap();
        transfer
            .run(request, progress, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_resume_appends_after_partial() {
        let data = test_data();
        let (base, server) = start_server(data.clone()).await;
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("m.bin.partial");
        std::fs::write(&partial, &data[..1000]).unwrap();

        let progress = RecordingProgress::default();
        let outcome = run_once(&request_for(format!("{}/exact", base), partial.clone()), &progress).await;

        assert_eq!(
            outcome,
            TransferOutcome::Finished {
                bytes: 4096,
                total_bytes: 4096
            }
        );
        assert_eq!(progress.starts(), vec![(1000, 4096, true)]);
        let bytes = progress.bytes();
        assert!(bytes.windows(2).all(|w| w[0] <= w[1]));
        assert!(bytes.iter().all(|b| *b >= 1000));
        assert_eq!(bytes.last(), Some(&4096));
        assert_eq!(server.ranges.lock().clone(), vec![Some("bytes=1000-".to_string())]);
        assert_eq!(std::fs::read(&partial).unwrap(), data.to_vec());
    }

    #[tokio::test]
    async fn test_range_not_satisfiable_restarts_from_zero() {
        let data = test_data();
        let (base, server) = start_server(data.clone()).await;
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("m.bin.partial");
        std::fs::write(&partial, vec![0xAAu8; 4096]).unwrap();

        let progress = RecordingProgress::default();
        let outcome = run_once(&request_for(format!("{}/exact", base), partial.clone()), &progress).await;

        assert_eq!(
            outcome,
            TransferOutcome::Finished {
                bytes: 4096,
                total_bytes: 4096
            }
        );
        assert_eq!(progress.starts(), vec![(0, 4096, true)]);
        assert_eq!(
            server.ranges.lock().clone(),
            vec![Some("bytes=4096-".to_string()), None]
        );
        assert_eq!(std::fs::read(&partial).unwrap(), data.to_vec());
    }

    #[tokio::test]
    async fn test_mismatched_content_range_restarts_from_zero() {
        let data = test_data();
        let (base, server) = start_server(data.clone()).await;
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("m.bin.partial");
        std::fs::write(&partial, vec![0xAAu8; 1000]).unwrap();

        let progress = RecordingProgress::default();
        let outcome = run_once(&request_for(format!("{}/skew", base), partial.clone()), &progress).await;

        assert_eq!(
            outcome,
            TransferOutcome::Finished {
                bytes: 4096,
                total_bytes: 4096
            }
        );
        assert_eq!(progress.starts()[0].0, 0);
        assert_eq!(
            server.ranges.lock().clone(),
            vec![Some("bytes=1000-".to_string()), None]
        );
        assert_eq!(std::fs::read(&partial).unwrap(), data.to_vec());
    }

    #[tokio::test]
    async fn test_cancelled_before_request_leaves_partial() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("m.bin.partial");
        std::fs::write(&partial, vec![1u8; 10]).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let transfer = NativeTransfer::new(TransferSettings::default()).unwrap();
        let outcome = transfer
            .run(
                &request_for("http://127.0.0.1:9/never".to_string(), partial.clone()),
                &RecordingProgress::default(),
                &token,
            )
            .await
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Interrupted);
        assert_eq!(std::fs::read(&partial).unwrap(), vec![1u8; 10]);
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 100-199/1000"),
            Some(ContentRange {
                start: 100,
                end: 199,
                total: Some(1000)
            })
        );
        assert_eq!(
            parse_content_range("bytes 0-9/*"),
            Some(ContentRange {
                start: 0,
                end: 9,
                total: None
            })
        );
        assert_eq!(parse_content_range("items 0-9/10"), None);
        assert_eq!(parse_content_range("bytes */1000"), None);
    }

    #[test]
    fn test_accepts_byte_ranges() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_byte_ranges(&headers));

        headers.insert(ACCEPT_RANGES, "none".parse().unwrap());
        assert!(!accepts_byte_ranges(&headers));

        headers.insert(ACCEPT_RANGES, "Bytes".parse().unwrap());
        assert!(accepts_byte_ranges(&headers));
    }
}
