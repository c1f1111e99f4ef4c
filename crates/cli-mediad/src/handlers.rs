use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use log::info;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use mediad::{ServiceError, TaskStatus, UploadStatus};

use crate::server::{ApiError, AppState};

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInitRequest {
    pub file_name: String,
    #[serde(default)]
    pub file_size: u64,
    pub total_chunks: u32,
    #[serde(default)]
    pub chunk_size: u64,
}

pub async fn upload_init(
    State(state): State<AppState>,
    Json(req): Json<UploadInitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .assembler
        .begin(&req.file_name, req.file_size, req.total_chunks, req.chunk_size)
        .await?;
    Ok(Json(session))
}

/// Receive one multipart chunk. Fields: `uploadId`, `chunkIndex`, `file`.
/// When the session becomes complete the merge runs inline and the response
/// carries the merged state.
pub async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut upload_id: Option<String> = None;
    let mut chunk_index: Option<u32> = None;
    let mut bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("uploadId") => {
                upload_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(e.to_string()))?,
                );
            }
            Some("chunkIndex") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                chunk_index = Some(
                    text.parse()
                        .map_err(|_| ApiError::bad_request("chunkIndex must be an integer"))?,
                );
            }
            Some("file") | Some("chunk") => {
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::bad_request(e.to_string()))?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    let upload_id = upload_id.ok_or_else(|| ApiError::bad_request("uploadId field missing"))?;
    let chunk_index =
        chunk_index.ok_or_else(|| ApiError::bad_request("chunkIndex field missing"))?;
    let bytes = bytes.ok_or_else(|| ApiError::bad_request("file field missing"))?;

    let (received, complete) = state
        .assembler
        .receive_chunk(&upload_id, chunk_index, &bytes)
        .await?;

    if complete {
        let merged = state.assembler.complete(&upload_id).await?;
        return Ok(Json(json!({
            "uploadId": upload_id,
            "receivedChunks": received,
            "completed": true,
            "mergedPath": merged,
        })));
    }

    Ok(Json(json!({
        "uploadId": upload_id,
        "receivedChunks": received,
        "completed": false,
    })))
}

pub async fn upload_status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.assembler.get(&upload_id)?;
    Ok(Json(session))
}

pub async fn upload_cancel(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.assembler.cancel(&upload_id).await?;
    Ok(Json(json!({ "uploadId": upload_id, "cancelled": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertStartRequest {
    /// Source by prior chunked upload; mutually exclusive with `filePath`
    pub upload_id: Option<String>,
    /// Source by path already on disk
    pub file_path: Option<PathBuf>,
    #[serde(default = "default_format")]
    pub output_format: String,
    #[serde(default = "default_quality")]
    pub quality: String,
}

fn default_format() -> String {
    "mp4".to_string()
}

fn default_quality() -> String {
    "medium".to_string()
}

pub async fn convert_start(
    State(state): State<AppState>,
    Json(req): Json<ConvertStartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (input_path, upload_id) = match (&req.upload_id, &req.file_path) {
        (Some(upload_id), None) => {
            let session = state.assembler.get(upload_id)?;
            if session.status != UploadStatus::Merged {
                return Err(ApiError::bad_request(format!(
                    "upload {} is not merged yet",
                    upload_id
                )));
            }
            let merged = session.merged_path.ok_or_else(|| {
                ApiError::bad_request(format!("upload {} has no merged file", upload_id))
            })?;
            (merged, Some(upload_id.clone()))
        }
        (None, Some(path)) => {
            if !path.exists() {
                return Err(ServiceError::NotFound(format!(
                    "input file not found: {}",
                    path.display()
                ))
                .into());
            }
            (path.clone(), None)
        }
        _ => {
            return Err(ApiError::bad_request(
                "exactly one of uploadId or filePath is required",
            ))
        }
    };

    let output_path = state
        .config
        .output_dir
        .join(format!("{}.{}", Uuid::new_v4(), req.output_format));

    let task = state.registry.create(
        input_path,
        output_path,
        &req.output_format,
        &req.quality,
        upload_id,
    );
    info!("conversion task {} accepted", task.id);

    let runner = Arc::clone(&state.runner);
    let task_id = task.id.clone();
    tokio::spawn(async move {
        runner.run(&task_id).await;
    });

    Ok((StatusCode::ACCEPTED, Json(task)))
}

pub async fn convert_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.registry.get(&task_id)?;
    Ok(Json(task))
}

/// Cancel a running task and drop it from the registry; its files go too.
pub async fn convert_cancel(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.registry.delete(&task_id)?;
    let _ = tokio::fs::remove_file(&task.output_path).await;
    if task.upload_id.is_some() {
        let _ = tokio::fs::remove_file(&task.input_path).await;
    }
    Ok(Json(json!({ "taskId": task_id, "cancelled": true })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
}

pub async fn convert_list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let tasks = state.registry.list(query.status, query.limit);
    Json(json!({ "total": tasks.len(), "tasks": tasks }))
}

pub async fn convert_download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let task = state.registry.get(&task_id)?;
    if task.status != TaskStatus::Completed {
        return Err(ApiError::bad_request(format!(
            "task {} has not completed",
            task_id
        )));
    }

    let file = tokio::fs::File::open(&task.output_path)
        .await
        .map_err(|_| ServiceError::NotFound(format!("output of task {} not found", task_id)))?;
    let size = file.metadata().await.map(|m| m.len()).ok();

    let file_name = task
        .output_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.{}", task_id, task.output_format));

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = header::HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        file_name
    )) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(size) = size {
        if let Ok(value) = header::HeaderValue::from_str(&size.to_string()) {
            headers.insert(header::CONTENT_LENGTH, value);
        }
    }
    Ok(response)
}

/// Unified progress: the ID may name a conversion task or an upload session.
pub async fn progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if let Ok(task) = state.registry.get(&id) {
        return Ok(Json(json!({
            "id": id,
            "kind": "conversion",
            "status": task.status,
            "progress": task.progress,
            "error": task.error,
        })));
    }
    let session = state.assembler.get(&id)?;
    Ok(Json(json!({
        "id": id,
        "kind": "upload",
        "status": session.status,
        "progress": session.progress_pct(),
        "receivedChunks": session.received_count,
        "totalChunks": session.total_chunks,
    })))
}
