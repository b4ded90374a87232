use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::handlers;
use crate::downloader::DownloadManager;

/// 下载服务的全部路由
pub fn router(manager: Arc<DownloadManager>) -> Router {
    Router::new()
        .route("/api/download/submit", post(handlers::submit))
        .route("/api/download/task/status/{task_id}", get(handlers::task_status))
        .route("/api/download/task/all", get(handlers::all_tasks))
        .route("/api/download/task/cancel/{task_id}", post(handlers::cancel))
        .route("/api/download/task/resume/{task_id}", post(handlers::resume))
        .route("/api/download/task/retry/{task_id}", post(handlers::retry))
        .route("/api/download/task/discard/{task_id}", post(handlers::discard))
        .route("/api/download/task/progress/{task_id}", get(handlers::progress))
        .route("/api/download/server/{task_id}", get(handlers::download_stored))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(manager)
}

/// 监听地址并处理请求，收到 Ctrl+C 后停止接收连接并关闭下载服务
pub async fn serve(addr: SocketAddr, manager: Arc<DownloadManager>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP 服务已启动：http://{}", listener.local_addr()?);

    axum::serve(listener, router(manager.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    info!("服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("收到退出信号，正在关闭..."),
        Err(e) => {
            warn!("无法监听退出信号：{}", e);
            std::future::pending::<()>().await;
        }
    }
}
