// Web服务器模块

pub mod events;
pub mod handlers;
pub mod state;
pub mod websocket;

pub use state::AppState;

use axum::{
    http::HeaderValue,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// 健康检查响应结构
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
    })
}

/// CORS 配置：未指定来源时允许任意来源
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("忽略无效的 CORS 来源: {} ({})", origin, e);
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}

/// 构建完整应用路由
pub fn build_router(app_state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&app_state.config.server.cors_origins));

    let api_routes = Router::new()
        .route(
            "/downloads",
            post(handlers::create_download).get(handlers::get_all_downloads),
        )
        .route("/downloads/batch", post(handlers::create_batch_download))
        .route("/downloads/history", get(handlers::get_history))
        .route("/downloads/max-parallel", put(handlers::set_max_parallel))
        .route(
            "/downloads/clear/completed",
            axum::routing::delete(handlers::clear_completed),
        )
        .route(
            "/downloads/:id",
            get(handlers::get_download).delete(handlers::delete_download),
        )
        .route("/downloads/:id/pause", post(handlers::pause_download))
        .route("/downloads/:id/resume", post(handlers::resume_download))
        .route("/downloads/:id/cancel", post(handlers::cancel_download))
        .route("/downloads/:id/retry", post(handlers::retry_download))
        .route("/ws", get(websocket::handle_websocket))
        .with_state(app_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(middleware)
}
