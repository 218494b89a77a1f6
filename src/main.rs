use model_fetch::{config::LogConfig, logging, server, AppConfig, AppState};
use tracing::info;

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 配置文件路径：第一个命令行参数 > MODEL_FETCH_CONFIG > 默认路径
fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MODEL_FETCH_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// 加载日志配置
///
/// 日志系统要在完整配置加载之前初始化，这里只读取 [log] 段，失败时返回默认配置
async fn load_log_config(config_path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(config_path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }

    LogConfig::default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config_path();

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let log_config = load_log_config(&config_path).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("Model Fetch v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&config_path).await;
    config.download.ensure_models_root_exists()?;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    // 创建应用状态（恢复上次未完成的下载）
    let app_state = AppState::new(config).await?;
    info!("应用状态初始化完成");

    let app = server::build_router(app_state.clone());

    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("WebSocket: ws://{}/api/v1/ws", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // 🔥 使用 select! 监听关闭信号，支持优雅关闭
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    // 下载中的任务在下一个数据块边界停止，临时文件保留，下次启动续传
    app_state.shutdown().await;
    info!("应用已安全退出");

    Ok(())
}
