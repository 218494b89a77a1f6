//! 按来源注入下载凭证
//!
//! - HuggingFace: `Authorization: Bearer <token>` 请求头
//! - CivitAI: URL 追加 `token=<token>` 查询参数
//! - 其他来源不附加任何凭证

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tracing::debug;

use super::task::SourceKind;
use crate::config::AuthConfig;

/// 已附加凭证的请求参数
#[derive(Debug, Clone, Default)]
pub struct AuthorizedRequest {
    /// 最终请求地址（可能带 token 参数）
    pub url: String,
    /// 额外请求头
    pub headers: HeaderMap,
}

/// 各站点的访问令牌
#[derive(Debug, Clone, Default)]
pub struct HostAuth {
    huggingface_token: Option<String>,
    civitai_token: Option<String>,
}

fn non_empty(token: &Option<String>) -> Option<String> {
    token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

impl HostAuth {
    pub fn new(huggingface_token: Option<String>, civitai_token: Option<String>) -> Self {
        Self {
            huggingface_token: non_empty(&huggingface_token),
            civitai_token: non_empty(&civitai_token),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.huggingface_token.clone(), config.civitai_token.clone())
    }

    /// 为请求附加凭证
    ///
    /// CivitAI 的 token 只追加一次，地址里已有 `token` 参数时原样返回
    pub fn authorize(&self, url: &str, source: SourceKind) -> Result<AuthorizedRequest> {
        let mut request = AuthorizedRequest {
            url: url.to_string(),
            headers: HeaderMap::new(),
        };

        match source {
            SourceKind::Huggingface => {
                if let Some(token) = &self.huggingface_token {
                    let value = HeaderValue::from_str(&format!("Bearer {}", token))
                        .context("HuggingFace token 含有非法字符")?;
                    request.headers.insert(AUTHORIZATION, value);
                    debug!("已附加 HuggingFace 认证头");
                }
            }
            SourceKind::Civitai => {
                if let Some(token) = &self.civitai_token {
                    if !has_token_param(url) {
                        let sep = if url.contains('?') { '&' } else { '?' };
                        request.url =
                            format!("{}{}token={}", url, sep, urlencoding::encode(token));
                        debug!("已附加 CivitAI token 参数");
                    }
                }
            }
            SourceKind::Direct => {}
        }

        Ok(request)
    }
}

fn has_token_param(url: &str) -> bool {
    reqwest::Url::parse(url)
        .map(|u| u.query_pairs().any(|(k, _)| k == "token"))
        .unwrap_or(false)
}
