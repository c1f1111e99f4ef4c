use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use log::info;
use serde_json::json;
use tokio_util::io::ReaderStream;

use mediad::{ServiceError, SplitRequest, TaskStatus};

use crate::server::{ApiError, AppState};

/// Cut the finished output of a conversion task into the segments that
/// survive the request's delete list. Runs inline; the response carries
/// per-segment results.
pub async fn split_start(
    State(state): State<AppState>,
    Json(req): Json<SplitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.registry.get(&req.task_id)?;
    if task.status != TaskStatus::Completed {
        return Err(ApiError::bad_request(format!(
            "task {} has not completed",
            req.task_id
        )));
    }

    let outcome = state
        .splitter
        .split(&req, &task.output_path, task.cancel_token())
        .await?;
    info!(
        "split of task {} produced {} segment(s)",
        outcome.task_id, outcome.total_segments
    );
    Ok(Json(outcome))
}

pub async fn split_download(
    State(state): State<AppState>,
    Path((task_id, segment_index)): Path<(String, usize)>,
) -> Result<Response, ApiError> {
    let path = state.splitter.segment_file(&task_id, segment_index)?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ServiceError::NotFound(format!("segment file missing: {}", path.display())))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}_part{}.mp4", task_id, segment_index));

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("video/mp4"),
    );
    if let Ok(value) =
        header::HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

pub async fn split_cleanup(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.splitter.cleanup_segments(&task_id).await?;
    Ok(Json(json!({ "taskId": task_id, "removedSegments": removed })))
}
