//! 下载完成后的校验与落盘
//!
//! 所有传输策略共用这一个出口：临时文件只有在大小和哈希都校验通过后
//! 才会被原子重命名到最终路径。任何一步失败都会删除临时文件，
//! 最终路径上不会出现半成品。

use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// 哈希计算时的读缓冲大小
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// 落盘失败原因
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("文件大小不匹配: 期望 {expected} bytes, 实际 {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("哈希校验失败: 期望 {expected}, 实际 {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("无法覆盖已存在的文件 {path:?}: {source}")]
    RemoveExisting {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("重命名临时文件失败 {from:?} -> {to:?}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("读取临时文件失败 {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// 待落盘文件的校验要求
#[derive(Debug, Clone, Default)]
pub struct FinalizeSpec<'a> {
    /// 期望大小（服务端报告的总大小）
    pub expected_size: Option<u64>,
    /// 期望 sha256（可带 `sha256:` 前缀，大小写不敏感）
    pub expected_hash: Option<&'a str>,
}

/// 计算文件的 sha256（十六进制小写）
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

fn normalize_hash(hash: &str) -> String {
    let hash = hash.trim();
    let hash = hash
        .strip_prefix("sha256:")
        .or_else(|| hash.strip_prefix("SHA256:"))
        .unwrap_or(hash);
    hash.to_ascii_lowercase()
}

/// 删除临时文件，文件不存在时视为成功
pub async fn discard_partial(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => debug!("已删除临时文件: {:?}", partial),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除临时文件失败: {:?}, 错误: {}", partial, e),
    }
}

/// 校验临时文件并原子重命名到最终路径
///
/// 调用前传输层必须已经关闭文件句柄
///
/// # Returns
/// 最终文件大小
pub async fn finalize(
    partial: &Path,
    final_path: &Path,
    spec: FinalizeSpec<'_>,
) -> Result<u64, FinalizeError> {
    let result = verify_and_promote(partial, final_path, &spec).await;
    if let Err(e) = &result {
        warn!("落盘失败，清理临时文件: {:?}, 原因: {}", partial, e);
        discard_partial(partial).await;
    }
    result
}

async fn verify_and_promote(
    partial: &Path,
    final_path: &Path,
    spec: &FinalizeSpec<'_>,
) -> Result<u64, FinalizeError> {
    let io_err = |source| FinalizeError::Io {
        path: partial.to_path_buf(),
        source,
    };

    // 1. 大小校验
    let actual = tokio::fs::metadata(partial).await.map_err(io_err)?.len();
    if let Some(expected) = spec.expected_size {
        if actual != expected {
            return Err(FinalizeError::SizeMismatch { expected, actual });
        }
    }

    // 2. 哈希校验（大文件放到阻塞线程池里算）
    if let Some(expected) = spec.expected_hash {
        let expected = normalize_hash(expected);
        let path = partial.to_path_buf();
        let actual_hash = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| io_err(io::Error::new(io::ErrorKind::Other, e)))?
            .map_err(io_err)?;

        if actual_hash != expected {
            return Err(FinalizeError::HashMismatch {
                expected,
                actual: actual_hash,
            });
        }
        debug!("哈希校验通过: {:?}", partial);
    }

    // 3. 新下载覆盖旧文件
    match tokio::fs::remove_file(final_path).await {
        Ok(()) => info!("已移除旧文件: {:?}", final_path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(FinalizeError::RemoveExisting {
                path: final_path.to_path_buf(),
                source,
            })
        }
    }

    // 4. 原子重命名
    tokio::fs::rename(partial, final_path)
        .await
        .map_err(|source| FinalizeError::Rename {
            from: partial.to_path_buf(),
            to: final_path.to_path_buf(),
            source,
        })?;

    info!("✅ 文件已落盘: {:?} ({} bytes)", final_path, actual);
    Ok(actual)
}
