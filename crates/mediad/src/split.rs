use std::path::{Path, PathBuf};
use std::sync::Arc;

use humansize::{format_size, DECIMAL};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::engine::TranscodeEngine;
use crate::error::{Result, ServiceError};
use crate::planner::{plan_keep_intervals, Interval};

/// Request to cut a source file into the parts that survive a delete list
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitRequest {
    pub task_id: String,
    #[serde(default)]
    pub delete_intervals: Vec<Interval>,
    pub video_duration: f64,
}

/// Outcome of one extracted segment
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentResult {
    pub success: bool,
    /// 1-based position in the surviving timeline
    pub segment_index: usize,
    pub file_name: String,
    pub output_path: PathBuf,
    pub size: u64,
    pub duration: f64,
    pub start_time: f64,
    pub end_time: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitOutcome {
    pub task_id: String,
    pub total_segments: usize,
    pub segments: Vec<SegmentResult>,
}

/// Cuts a finished output file into the retained segments of a delete plan.
pub struct Splitter {
    engine: Arc<dyn TranscodeEngine>,
    output_dir: PathBuf,
}

impl Splitter {
    pub fn new(engine: Arc<dyn TranscodeEngine>, output_dir: PathBuf) -> Self {
        Splitter { engine, output_dir }
    }

    /// Extract every retained interval of `input` into its own file named
    /// `<taskId>_part<N>.mp4`. A failed segment is recorded and the
    /// remaining segments still run; only cancellation aborts the batch.
    /// The source file is removed best-effort once all segments succeed.
    pub async fn split(
        &self,
        req: &SplitRequest,
        input: &Path,
        cancel: CancellationToken,
    ) -> Result<SplitOutcome> {
        if !input.exists() {
            return Err(ServiceError::NotFound(format!(
                "source file for task {} not found",
                req.task_id
            )));
        }

        let keep = plan_keep_intervals(req.video_duration, &req.delete_intervals)?;
        if keep.is_empty() {
            return Err(ServiceError::InvalidInput(
                "no intervals survive the cut list".to_string(),
            ));
        }

        info!(
            "splitting task {} into {} segment(s)",
            req.task_id,
            keep.len()
        );

        let mut segments = Vec::with_capacity(keep.len());
        for (i, interval) in keep.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ServiceError::Cancelled);
            }

            let index = i + 1;
            let file_name = format!("{}_part{}.mp4", req.task_id, index);
            let output_path = self.output_dir.join(&file_name);

            let extracted = self
                .engine
                .extract_segment(
                    input,
                    &output_path,
                    interval.start,
                    interval.duration(),
                    cancel.clone(),
                )
                .await;

            match extracted {
                Ok(()) => {
                    let size = tokio::fs::metadata(&output_path)
                        .await
                        .map(|m| m.len())
                        .unwrap_or(0);
                    info!(
                        "segment {} of task {}: {} ({})",
                        index,
                        req.task_id,
                        file_name,
                        format_size(size, DECIMAL)
                    );
                    segments.push(SegmentResult {
                        success: true,
                        segment_index: index,
                        file_name,
                        output_path,
                        size,
                        duration: interval.duration(),
                        start_time: interval.start,
                        end_time: interval.end,
                    });
                }
                Err(ServiceError::Cancelled) => return Err(ServiceError::Cancelled),
                Err(e) => {
                    warn!("segment {} of task {} failed: {}", index, req.task_id, e);
                    segments.push(SegmentResult {
                        success: false,
                        segment_index: index,
                        file_name,
                        output_path,
                        size: 0,
                        duration: interval.duration(),
                        start_time: interval.start,
                        end_time: interval.end,
                    });
                }
            }
        }

        if segments.iter().all(|s| s.success) {
            if let Err(e) = tokio::fs::remove_file(input).await {
                warn!(
                    "source cleanup for task {} failed at {}: {}",
                    req.task_id,
                    input.display(),
                    e
                );
            }
        }

        Ok(SplitOutcome {
            task_id: req.task_id.clone(),
            total_segments: segments.len(),
            segments,
        })
    }

    /// Path of a previously extracted segment, by 1-based index
    pub fn segment_file(&self, task_id: &str, index: usize) -> Result<PathBuf> {
        let path = self
            .output_dir
            .join(format!("{}_part{}.mp4", task_id, index));
        if path.exists() {
            Ok(path)
        } else {
            Err(ServiceError::NotFound(format!(
                "segment {} of task {} not found",
                index, task_id
            )))
        }
    }

    /// Remove every segment file of the task; returns the number removed
    pub async fn cleanup_segments(&self, task_id: &str) -> Result<usize> {
        let prefix = format!("{}_part", task_id);
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.output_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".mp4") {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("removing {} failed: {}", entry.path().display(), e),
                }
            }
        }
        Ok(removed)
    }
}
