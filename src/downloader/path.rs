//! 下载路径安全处理
//!
//! 文件名和目录都来自外部（工作流扫描结果），落盘前必须清洗，
//! 并保证最终路径不会逃出模型根目录。

use anyhow::{bail, Result};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// 临时文件后缀
pub const PARTIAL_SUFFIX: &str = ".partial";

/// aria2c 控制文件后缀，接在临时文件名之后
pub const CONTROL_SUFFIX: &str = ".aria2";

/// 中间文件占用的后缀，最终文件名不能以它们结尾
const STAGING_SUFFIXES: [&str; 2] = [".partial", ".partial.aria2"];

/// 空文件名的替代名
const FALLBACK_NAME: &str = "unnamed_model";

/// 文件名主体最大长度（字符）
const MAX_STEM_LEN: usize = 200;

/// Windows 保留设备名
const WINDOWS_RESERVED: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// 文件系统不接受的字符：`< > : " / \ | ? *` 以及控制字符
fn is_unsafe_char(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || (c as u32) < 0x20
}

fn replace_unsafe(s: &str) -> String {
    s.chars()
        .map(|c| if is_unsafe_char(c) { '_' } else { c })
        .collect()
}

/// 一个任务的落盘路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPaths {
    /// 最终文件路径 `<models_root>/<directory>/<filename>`
    pub final_path: PathBuf,
    /// 临时文件路径 `<final_path>.partial`
    pub partial_path: PathBuf,
}

/// 清洗文件名
///
/// - 只保留最后一段（去掉任何路径成分）
/// - 替换非法字符
/// - 规避 Windows 保留名
/// - 限制长度并保留扩展名
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    if base.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    // 拆分主体和扩展名，只由点开头的名字（如 `.hidden`、`..`）没有扩展名
    let (stem, ext) = match base.rfind('.') {
        Some(idx) if base[..idx].chars().any(|c| c != '.') => base.split_at(idx),
        _ => (base, ""),
    };

    let mut stem = replace_unsafe(stem);
    let ext = replace_unsafe(ext);

    let upper = stem.to_uppercase();
    let head = upper.split('.').next().unwrap_or_default();
    if WINDOWS_RESERVED.contains(&upper.as_str()) || WINDOWS_RESERVED.contains(&head) {
        stem = format!("_{}", stem);
    }

    let mut stem = stem.trim_matches(|c| c == ' ' || c == '.').to_string();
    if stem.is_empty() {
        stem = FALLBACK_NAME.to_string();
    }

    if stem.chars().count() > MAX_STEM_LEN {
        stem = stem.chars().take(MAX_STEM_LEN).collect();
    }

    format!("{}{}", stem, ext)
}

/// 清洗相对目录，丢弃 `..`、`~`、`$` 等危险成分
pub fn sanitize_directory(directory: &str) -> String {
    let normalized = directory.replace('\\', "/");

    let mut parts = Vec::new();
    for part in normalized.split('/') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if part == "." || part == ".." || part.starts_with('~') || part.starts_with('$') {
            warn!("已移除危险路径成分: {}", part);
            continue;
        }
        if part.contains('.') {
            parts.push(sanitize_filename(part));
        } else {
            parts.push(replace_unsafe(part));
        }
    }

    parts.join("/")
}

/// 计算 `<final>.partial`
pub fn partial_path_for(final_path: &Path) -> PathBuf {
    let mut name = OsString::from(final_path.as_os_str());
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// 解析并校验下载目标
///
/// # Arguments
/// * `models_root` - 模型根目录
/// * `directory` - 相对目标目录
/// * `filename` - 目标文件名
///
/// # Returns
/// 清洗后的最终路径和临时文件路径；文件名占用临时后缀或路径越界时报错
pub fn resolve_target(models_root: &Path, directory: &str, filename: &str) -> Result<TargetPaths> {
    let safe_dir = sanitize_directory(directory);
    let safe_name = sanitize_filename(filename);

    let lower = safe_name.to_ascii_lowercase();
    if let Some(suffix) = STAGING_SUFFIXES.iter().find(|s| lower.ends_with(*s)) {
        bail!("文件名不能以 {} 结尾: {}", suffix, filename);
    }

    let mut final_path = models_root.to_path_buf();
    if !safe_dir.is_empty() {
        final_path.push(&safe_dir);
    }
    final_path.push(&safe_name);

    let escapes = final_path
        .strip_prefix(models_root)
        .map(|rel| {
            rel.components()
                .any(|c| !matches!(c, Component::Normal(_)))
        })
        .unwrap_or(true);
    if escapes {
        bail!("路径越界: {:?} 不在 {:?} 之内", final_path, models_root);
    }

    let partial_path = partial_path_for(&final_path);
    Ok(TargetPaths {
        final_path,
        partial_path,
    })
}
