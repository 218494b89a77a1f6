use crate::downloader::{DownloadRequest, DownloadTask, TaskStatus};
use crate::persistence::CompletionRecord;
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ApiResponse;

/// 请求参数错误
const CODE_BAD_REQUEST: i32 = 400;

/// 批量下载请求
#[derive(Debug, Deserialize)]
pub struct CreateBatchDownloadRequest {
    pub items: Vec<DownloadRequest>,
}

/// 批量下载响应
#[derive(Debug, Serialize)]
pub struct BatchDownloadResponse {
    /// 成功创建的任务ID列表
    pub task_ids: Vec<String>,
    /// 失败的项
    pub failed: Vec<BatchDownloadError>,
}

/// 批量下载错误项
#[derive(Debug, Serialize)]
pub struct BatchDownloadError {
    pub url: String,
    pub filename: String,
    /// 失败原因
    pub reason: String,
}

/// 历史查询参数
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    50
}

/// 调整并发数请求
#[derive(Debug, Deserialize)]
pub struct MaxParallelRequest {
    /// 0 表示不限
    pub max_parallel: usize,
}

/// POST /api/v1/downloads
/// 创建下载任务
pub async fn create_download(
    State(app_state): State<AppState>,
    Json(req): Json<DownloadRequest>,
) -> Json<ApiResponse<String>> {
    match app_state.download_manager.enqueue(req).await {
        Ok(task_id) => Json(ApiResponse::success(task_id)),
        Err(e) => {
            warn!("创建下载任务失败: {:#}", e);
            Json(ApiResponse::error(CODE_BAD_REQUEST, format!("{:#}", e)))
        }
    }
}

/// POST /api/v1/downloads/batch
/// 批量创建下载任务，单条失败不影响其余记录
pub async fn create_batch_download(
    State(app_state): State<AppState>,
    Json(req): Json<CreateBatchDownloadRequest>,
) -> Json<ApiResponse<BatchDownloadResponse>> {
    info!("批量下载请求: {} 个项目", req.items.len());

    let keys: Vec<(String, String)> = req
        .items
        .iter()
        .map(|item| (item.url.clone(), item.filename.clone()))
        .collect();
    let results = app_state.download_manager.enqueue_batch(req.items).await;

    let mut task_ids = Vec::new();
    let mut failed = Vec::new();
    for ((url, filename), result) in keys.into_iter().zip(results) {
        match result {
            Ok(task_id) => task_ids.push(task_id),
            Err(e) => failed.push(BatchDownloadError {
                url,
                filename,
                reason: format!("{:#}", e),
            }),
        }
    }

    info!(
        "批量下载完成: {} 个任务, {} 个失败",
        task_ids.len(),
        failed.len()
    );

    Json(ApiResponse::success(BatchDownloadResponse { task_ids, failed }))
}

/// GET /api/v1/downloads
/// 获取所有下载任务
pub async fn get_all_downloads(
    State(app_state): State<AppState>,
) -> Json<ApiResponse<Vec<DownloadTask>>> {
    Json(ApiResponse::success(app_state.download_manager.get_all_tasks()))
}

/// GET /api/v1/downloads/:id
/// 获取指定下载任务
pub async fn get_download(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<DownloadTask>>, StatusCode> {
    match app_state.download_manager.get_task(&task_id) {
        Some(task) => Ok(Json(ApiResponse::success(task))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// 操作结果：任务不存在为 404，状态不允许为 409
fn action_result(
    app_state: &AppState,
    task_id: &str,
    accepted: bool,
    action: &str,
) -> Result<Json<ApiResponse<TaskStatus>>, StatusCode> {
    let Some(task) = app_state.download_manager.get_task(task_id) else {
        return Err(StatusCode::NOT_FOUND);
    };

    if accepted {
        info!("{}下载任务成功: {}", action, task_id);
        Ok(Json(ApiResponse::success(task.status)))
    } else {
        warn!("{}下载任务被拒绝: {}, 当前状态: {}", action, task_id, task.status);
        Err(StatusCode::CONFLICT)
    }
}

/// POST /api/v1/downloads/:id/pause
/// 暂停下载任务
pub async fn pause_download(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskStatus>>, StatusCode> {
    let accepted = app_state.download_manager.pause(&task_id).await;
    action_result(&app_state, &task_id, accepted, "暂停")
}

/// POST /api/v1/downloads/:id/resume
/// 恢复下载任务
pub async fn resume_download(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskStatus>>, StatusCode> {
    let accepted = app_state.download_manager.resume(&task_id).await;
    action_result(&app_state, &task_id, accepted, "恢复")
}

/// POST /api/v1/downloads/:id/cancel
/// 取消下载任务
pub async fn cancel_download(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskStatus>>, StatusCode> {
    let accepted = app_state.download_manager.cancel(&task_id).await;
    action_result(&app_state, &task_id, accepted, "取消")
}

/// POST /api/v1/downloads/:id/retry
/// 重试失败的任务
pub async fn retry_download(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskStatus>>, StatusCode> {
    let accepted = app_state.download_manager.retry(&task_id).await;
    action_result(&app_state, &task_id, accepted, "重试")
}

/// DELETE /api/v1/downloads/:id
/// 移除已结束的任务
pub async fn delete_download(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<String>>, StatusCode> {
    if app_state.download_manager.remove(&task_id).await {
        return Ok(Json(ApiResponse::success(task_id)));
    }
    match app_state.download_manager.get_task(&task_id) {
        Some(_) => Err(StatusCode::CONFLICT),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// DELETE /api/v1/downloads/clear/completed
/// 清除已结束的任务
pub async fn clear_completed(State(app_state): State<AppState>) -> Json<ApiResponse<usize>> {
    let count = app_state.download_manager.clear_completed().await;
    Json(ApiResponse::success(count))
}

/// GET /api/v1/downloads/history
/// 最近的完成记录
pub async fn get_history(
    State(app_state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Vec<CompletionRecord>>>, StatusCode> {
    match app_state.download_manager.history(query.limit).await {
        Ok(records) => Ok(Json(ApiResponse::success(records))),
        Err(e) => {
            warn!("查询下载历史失败: {:#}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// PUT /api/v1/downloads/max-parallel
/// 调整最大并发数
pub async fn set_max_parallel(
    State(app_state): State<AppState>,
    Json(req): Json<MaxParallelRequest>,
) -> Json<ApiResponse<usize>> {
    app_state.download_manager.set_max_parallel(req.max_parallel);
    Json(ApiResponse::success(app_state.download_manager.max_parallel()))
}
