use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, ServiceError};

/// Lifecycle state of a conversion task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and Failed permit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// One conversion job, driven from Pending to a terminal state by a JobRunner
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionTask {
    #[serde(rename = "taskId")]
    pub id: String,
    pub status: TaskStatus,
    /// 0-100, monotonically non-decreasing while Processing; 100 is written
    /// only by the Completed transition
    pub progress: u8,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub output_format: String,
    pub quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    cancel: CancellationToken,
}

impl ConversionTask {
    /// Cancellation handle checked by the runner at each suspension point
    /// and propagated into the engine invocation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Concurrency-safe registry of conversion tasks.
///
/// One map behind one reader/writer lock; no operation holds the lock
/// across file-system or subprocess I/O.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, ConversionTask>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        TaskRegistry {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new Pending task and return a snapshot of it
    pub fn create(
        &self,
        input_path: PathBuf,
        output_path: PathBuf,
        output_format: &str,
        quality: &str,
        upload_id: Option<String>,
    ) -> ConversionTask {
        let now = Utc::now();
        let task = ConversionTask {
            id: Uuid::new_v4().to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            input_path,
            output_path,
            output_format: output_format.to_string(),
            quality: quality.to_string(),
            upload_id,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            cancel: CancellationToken::new(),
        };

        let mut tasks = self.tasks.write().expect("task registry lock poisoned");
        tasks.insert(task.id.clone(), task.clone());
        task
    }

    /// Snapshot of a task by ID
    pub fn get(&self, id: &str) -> Result<ConversionTask> {
        let tasks = self.tasks.read().expect("task registry lock poisoned");
        tasks
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("task not found: {}", id)))
    }

    /// Transition Pending -> Processing when the runner picks the task up
    pub fn start(&self, id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().expect("task registry lock poisoned");
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("task not found: {}", id)))?;
        if task.status != TaskStatus::Pending {
            return Err(ServiceError::InvalidInput(format!(
                "task {} cannot start from state {:?}",
                id, task.status
            )));
        }
        task.status = TaskStatus::Processing;
        task.progress = 0;
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Record forward progress for a Processing task.
    ///
    /// Clamped to 0..=99 (100 belongs to the Completed transition) and
    /// never decreasing. An update arriving for a terminal task is a
    /// benign no-op: progress reporting and the terminal transition race.
    pub fn update_progress(&self, id: &str, progress: u8) -> Result<()> {
        let mut tasks = self.tasks.write().expect("task registry lock poisoned");
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("task not found: {}", id)))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        if task.status != TaskStatus::Processing {
            return Err(ServiceError::InvalidInput(format!(
                "task {} is not processing",
                id
            )));
        }
        let clamped = progress.min(99);
        if clamped > task.progress {
            task.progress = clamped;
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Terminal transition: Processing -> Completed, progress 100
    pub fn mark_completed(&self, id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().expect("task registry lock poisoned");
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("task not found: {}", id)))?;
        if task.status.is_terminal() {
            return Err(ServiceError::InvalidInput(format!(
                "task {} is already terminal ({:?})",
                id, task.status
            )));
        }
        let now = Utc::now();
        task.status = TaskStatus::Completed;
        task.progress = 100;
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(())
    }

    /// Terminal transition: -> Failed with a non-empty diagnostic
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let mut tasks = self.tasks.write().expect("task registry lock poisoned");
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("task not found: {}", id)))?;
        if task.status.is_terminal() {
            return Err(ServiceError::InvalidInput(format!(
                "task {} is already terminal ({:?})",
                id, task.status
            )));
        }
        task.status = TaskStatus::Failed;
        task.error = Some(if error.is_empty() {
            "unknown failure".to_string()
        } else {
            error.to_string()
        });
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Trigger the task's cancellation signal so a running JobRunner stops.
    /// Cancelling an already-terminal task is a no-op.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let tasks = self.tasks.read().expect("task registry lock poisoned");
        let task = tasks
            .get(id)
            .ok_or_else(|| ServiceError::NotFound(format!("task not found: {}", id)))?;
        if !task.status.is_terminal() {
            task.cancel.cancel();
        }
        Ok(())
    }

    /// Cancel first, then remove the record. Returns the removed task so the
    /// caller can delete its files without the registry lock held.
    pub fn delete(&self, id: &str) -> Result<ConversionTask> {
        let mut tasks = self.tasks.write().expect("task registry lock poisoned");
        let task = tasks
            .remove(id)
            .ok_or_else(|| ServiceError::NotFound(format!("task not found: {}", id)))?;
        task.cancel.cancel();
        Ok(task)
    }

    /// Tasks ordered by creation time, optionally filtered by status and
    /// truncated to `limit` entries.
    pub fn list(&self, status: Option<TaskStatus>, limit: Option<usize>) -> Vec<ConversionTask> {
        let tasks = self.tasks.read().expect("task registry lock poisoned");
        let mut out: Vec<ConversionTask> = tasks
            .values()
            .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_task() -> (TaskRegistry, String) {
        let registry = TaskRegistry::new();
        let task = registry.create(
            PathBuf::from("/in/a.webm"),
            PathBuf::from("/out/a.mp4"),
            "mp4",
            "medium",
            None,
        );
        (registry, task.id)
    }

    #[test]
    fn test_create_and_get() {
        let (registry, id) = registry_with_task();
        let task = registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let registry = TaskRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn test_progress_requires_processing() {
        let (registry, id) = registry_with_task();
        assert!(registry.update_progress(&id, 10).is_err());

        registry.start(&id).unwrap();
        registry.update_progress(&id, 10).unwrap();
        assert_eq!(registry.get(&id).unwrap().progress, 10);
    }

    #[test]
    fn test_progress_is_monotonic_and_capped() {
        let (registry, id) = registry_with_task();
        registry.start(&id).unwrap();

        registry.update_progress(&id, 50).unwrap();
        registry.update_progress(&id, 30).unwrap();
        assert_eq!(registry.get(&id).unwrap().progress, 50);

        registry.update_progress(&id, 100).unwrap();
        assert_eq!(registry.get(&id).unwrap().progress, 99);
    }

    #[test]
    fn test_completed_is_terminal() {
        let (registry, id) = registry_with_task();
        registry.start(&id).unwrap();
        registry.mark_completed(&id).unwrap();

        let task = registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.completed_at.is_some());

        // terminal transitions are rejected, progress updates are no-ops
        assert!(registry.mark_failed(&id, "late").is_err());
        assert!(registry.mark_completed(&id).is_err());
        registry.update_progress(&id, 1).unwrap();
        assert_eq!(registry.get(&id).unwrap().progress, 100);
    }

    #[test]
    fn test_failed_carries_error() {
        let (registry, id) = registry_with_task();
        registry.start(&id).unwrap();
        registry.mark_failed(&id, "boom").unwrap();

        let task = registry.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(registry.mark_completed(&id).is_err());
    }

    #[test]
    fn test_cancel_triggers_token() {
        let (registry, id) = registry_with_task();
        let token = registry.get(&id).unwrap().cancel_token();
        assert!(!token.is_cancelled());

        registry.cancel(&id).unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_terminal_is_noop() {
        let (registry, id) = registry_with_task();
        registry.start(&id).unwrap();
        registry.mark_completed(&id).unwrap();
        let token = registry.get(&id).unwrap().cancel_token();

        registry.cancel(&id).unwrap();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_delete_cancels_and_removes() {
        let (registry, id) = registry_with_task();
        let token = registry.get(&id).unwrap().cancel_token();

        let removed = registry.delete(&id).unwrap();
        assert_eq!(removed.id, id);
        assert!(token.is_cancelled());
        assert!(matches!(registry.get(&id), Err(ServiceError::NotFound(_))));
    }

    #[test]
    fn test_list_filter_and_limit() {
        let registry = TaskRegistry::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let t = registry.create(
                PathBuf::from(format!("/in/{}.webm", i)),
                PathBuf::from(format!("/out/{}.mp4", i)),
                "mp4",
                "medium",
                None,
            );
            ids.push(t.id);
        }
        registry.start(&ids[0]).unwrap();
        registry.start(&ids[1]).unwrap();
        registry.mark_completed(&ids[1]).unwrap();

        let all = registry.list(None, None);
        assert_eq!(all.len(), 5);
        // ordered by creation
        let created: Vec<_> = all.iter().map(|t| t.created_at).collect();
        let mut sorted = created.clone();
        sorted.sort();
        assert_eq!(created, sorted);

        let pending = registry.list(Some(TaskStatus::Pending), None);
        assert_eq!(pending.len(), 3);

        let limited = registry.list(None, Some(2));
        assert_eq!(limited.len(), 2);
    }
}
