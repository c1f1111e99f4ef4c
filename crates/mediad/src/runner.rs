use std::sync::Arc;

use log::{info, warn};
use tokio::sync::mpsc;

use crate::engine::{ConvertSpec, EncodePath, TranscodeEngine};
use crate::error::ServiceError;
use crate::task::TaskRegistry;

/// Capacity of the per-task progress channel. The producer uses `try_send`,
/// so a full channel coalesces rapid updates instead of blocking the engine.
const PROGRESS_CHANNEL_CAPACITY: usize = 16;

/// Drives one task at a time from Pending to a terminal state.
///
/// Runs detached: failures are never raised to the caller, they are
/// recorded into the task and retrieved via `TaskRegistry::get`.
pub struct JobRunner {
    registry: Arc<TaskRegistry>,
    engine: Arc<dyn TranscodeEngine>,
}

impl JobRunner {
    pub fn new(registry: Arc<TaskRegistry>, engine: Arc<dyn TranscodeEngine>) -> Self {
        JobRunner { registry, engine }
    }

    /// Execute the task with the given ID to completion.
    ///
    /// Policy: take the hardware path when the capability record enables
    /// it; on a hardware failure with fallback allowed, retry exactly once
    /// on the software path and report that path's diagnostics. No other
    /// retries exist. Cancellation terminates the engine invocation and
    /// lands the task in Failed with a "cancelled" error.
    pub async fn run(&self, task_id: &str) {
        let task = match self.registry.get(task_id) {
            Ok(task) => task,
            Err(e) => {
                warn!("runner: {}", e);
                return;
            }
        };
        if let Err(e) = self.registry.start(task_id) {
            warn!("runner: task {} not startable: {}", task_id, e);
            return;
        }

        let cancel = task.cancel_token();
        let spec = ConvertSpec {
            input: task.input_path.clone(),
            output: task.output_path.clone(),
            output_format: task.output_format.clone(),
            quality: task.quality.clone(),
        };

        let (tx, mut rx) = mpsc::channel::<u8>(PROGRESS_CHANNEL_CAPACITY);

        // Single consumer per task: updates apply in production order.
        let registry = Arc::clone(&self.registry);
        let consumer_id = task_id.to_string();
        let consumer = async move {
            while let Some(pct) = rx.recv().await {
                if let Err(e) = registry.update_progress(&consumer_id, pct) {
                    warn!("runner: progress update for {} failed: {}", consumer_id, e);
                    break;
                }
            }
        };

        let caps = self.engine.capabilities();
        let drive = async {
            let first_path = if caps.enabled {
                EncodePath::Hardware
            } else {
                EncodePath::Software
            };
            let mut outcome = self
                .engine
                .convert(&spec, first_path, tx.clone(), cancel.clone())
                .await;

            if first_path == EncodePath::Hardware
                && caps.allow_fallback
                && matches!(outcome, Err(ref e) if !matches!(e, ServiceError::Cancelled))
            {
                warn!(
                    "task {}: hardware encode failed ({}), retrying on CPU",
                    task_id,
                    outcome.as_ref().err().map(|e| e.to_string()).unwrap_or_default()
                );
                outcome = self
                    .engine
                    .convert(&spec, EncodePath::Software, tx.clone(), cancel.clone())
                    .await;
            }

            drop(tx);
            outcome
        };

        let (outcome, ()) = tokio::join!(drive, consumer);

        match outcome {
            Ok(()) => {
                if let Err(e) = self.registry.mark_completed(task_id) {
                    warn!("runner: completing {} failed: {}", task_id, e);
                    return;
                }
                info!("task {} completed", task_id);

                // Upload-originated inputs are intermediate artifacts; remove
                // them best-effort once the output exists.
                if task.upload_id.is_some() {
                    if let Err(e) = tokio::fs::remove_file(&task.input_path).await {
                        warn!(
                            "task {}: input cleanup failed for {}: {}",
                            task_id,
                            task.input_path.display(),
                            e
                        );
                    }
                }
            }
            Err(ServiceError::Cancelled) => {
                info!("task {} cancelled", task_id);
                if let Err(e) = self.registry.mark_failed(task_id, "cancelled") {
                    warn!("runner: failing cancelled task {}: {}", task_id, e);
                }
            }
            Err(e) => {
                warn!("task {} failed: {}", task_id, e);
                if let Err(e) = self.registry.mark_failed(task_id, &e.to_string()) {
                    warn!("runner: failing task {}: {}", task_id, e);
                }
            }
        }
    }
}
