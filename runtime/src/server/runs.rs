//! Run API: upload, stop, status and the log channel.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Path, Query, Request};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::logs::LogItem;
use crate::runs::RunOrchestrator;

const KEEP_ALIVE: Duration = Duration::from_secs(15);

pub fn routes() -> Router {
    Router::new()
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/:run_id/stop", post(stop_run))
        .route("/runs/:run_id/status", get(run_status))
        .route("/runs/:run_id/logs", get(stream_logs))
}

#[derive(Debug, Default, Deserialize)]
struct UploadQuery {
    #[serde(default)]
    detach: bool,
}

async fn create_run(
    Extension(orchestrator): Extension<Arc<RunOrchestrator>>,
    Query(query): Query<UploadQuery>,
    request: Request,
) -> Response {
    let archive = match read_archive(request).await {
        Ok(archive) => archive,
        Err(response) => return response,
    };
    if archive.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "No archive uploaded"})),
        )
            .into_response();
    }
    info!(bytes = archive.len(), detach = query.detach, "archive received");

    if query.detach {
        let response = orchestrator.submit_run(archive).await;
        let status = if response.is_error() {
            StatusCode::UNPROCESSABLE_ENTITY
        } else {
            StatusCode::ACCEPTED
        };
        return (status, Json(response)).into_response();
    }

    let response = orchestrator.create_run(archive).await;
    let status = if response.is_error() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::CREATED
    };
    (status, Json(response)).into_response()
}

/// Accepts either a raw zip body or a multipart form with a `file` field.
async fn read_archive(request: Request) -> Result<Vec<u8>, Response> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("multipart/form-data"))
        .unwrap_or(false);

    if !is_multipart {
        let body = Bytes::from_request(request, &())
            .await
            .map_err(IntoResponse::into_response)?;
        return Ok(body.to_vec());
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(IntoResponse::into_response)?;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "malformed multipart upload");
                return Err(err.into_response());
            }
        };
        if field.name() != Some("file") {
            continue;
        }
        let bytes = field.bytes().await.map_err(IntoResponse::into_response)?;
        return Ok(bytes.to_vec());
    }
    Ok(Vec::new())
}

async fn stop_run(
    Extension(orchestrator): Extension<Arc<RunOrchestrator>>,
    Path(run_id): Path<String>,
) -> Response {
    match orchestrator.stop(&run_id).await {
        Ok(ack) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "runId": ack.run_id,
                "found": true,
                "cleanup": ack.cleanup,
            })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::OK,
            Json(json!({"ok": true, "runId": run_id, "found": false, "message": err.to_string()})),
        )
            .into_response(),
    }
}

async fn run_status(
    Extension(orchestrator): Extension<Arc<RunOrchestrator>>,
    Path(run_id): Path<String>,
) -> Response {
    match orchestrator.status(&run_id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(err) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Run not found", "kind": err.kind(), "runId": run_id})),
        )
            .into_response(),
    }
}

async fn list_runs(Extension(orchestrator): Extension<Arc<RunOrchestrator>>) -> Response {
    (StatusCode::OK, Json(orchestrator.list().await)).into_response()
}

async fn stream_logs(
    Extension(orchestrator): Extension<Arc<RunOrchestrator>>,
    Path(run_id): Path<String>,
) -> Response {
    let Some(mut subscription) = orchestrator.logs().join(&run_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "No log channel for run", "runId": run_id})),
        )
            .into_response();
    };

    let stream = async_stream::stream! {
        while let Some(item) = subscription.recv().await {
            let event = match item {
                LogItem::Message(message) => Event::default()
                    .event(message.channel.as_str())
                    .id(message.seq.to_string())
                    .data(message.message.replace('\r', "")),
                LogItem::Lagged(missed) => Event::default()
                    .event("lagged")
                    .data(missed.to_string()),
            };
            yield Ok::<_, Infallible>(event);
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(KEEP_ALIVE).text(": keep-alive"))
        .into_response()
}
