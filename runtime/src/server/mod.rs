//! REST API server for the runtime.

pub mod runs;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde_json::{json, Value};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::runs::RunOrchestrator;

/// Create the REST API application router
pub fn create_app(orchestrator: Arc<RunOrchestrator>) -> Router {
    let max_upload = orchestrator.config().max_upload_bytes();
    Router::new()
        .route("/health", get(health_check))
        .merge(runs::routes())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload))
        .layer(Extension(orchestrator))
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Serve until `shutdown` resolves, then stop every live run.
pub async fn serve(
    addr: SocketAddr,
    orchestrator: Arc<RunOrchestrator>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_app(Arc::clone(&orchestrator));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Starting REST API server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    let stopped = orchestrator.shutdown().await;
    info!(stopped, "live runs stopped on shutdown");
    Ok(())
}
