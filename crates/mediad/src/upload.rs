use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, ServiceError};

/// Lifecycle state of an upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Merged,
    Failed,
}

/// One chunked upload in flight.
///
/// The session exclusively owns its staging directory until merge, at
/// which point ownership of the merged artifact transfers to whichever
/// conversion task references it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    /// Declared chunk size; informational only
    pub chunk_size: u64,
    pub received_count: u32,
    pub status: UploadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    staging_dir: PathBuf,
    /// Indices received so far; invariant: received_count == received.len()
    #[serde(skip)]
    received: HashSet<u32>,
    /// Serializes completion attempts for this session
    #[serde(skip)]
    merge_gate: Arc<Mutex<()>>,
    /// How many completion attempts reached the merge I/O stage
    #[serde(skip)]
    merge_attempts: u32,
    #[serde(skip)]
    cancel: CancellationToken,
}

impl UploadSession {
    pub fn is_complete(&self) -> bool {
        self.received_count == self.total_chunks
    }

    /// Upload progress as a 0-100 percentage
    pub fn progress_pct(&self) -> u8 {
        if self.total_chunks == 0 {
            return 0;
        }
        ((self.received_count as u64 * 100) / self.total_chunks as u64) as u8
    }

    /// Times the merge I/O actually ran; at most one on the success path
    pub fn merge_attempts(&self) -> u32 {
        self.merge_attempts
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    fn chunk_path(&self, index: u32) -> PathBuf {
        self.staging_dir.join(format!("chunk_{}", index))
    }
}

/// Tracks partial uploads, persists chunks, and merges each completed
/// session into a single artifact exactly once.
pub struct ChunkAssembler {
    sessions: RwLock<HashMap<String, UploadSession>>,
    temp_dir: PathBuf,
    data_dir: PathBuf,
}

impl ChunkAssembler {
    pub fn new(temp_dir: PathBuf, data_dir: PathBuf) -> Self {
        ChunkAssembler {
            sessions: RwLock::new(HashMap::new()),
            temp_dir,
            data_dir,
        }
    }

    /// Allocate a fresh session with a dedicated staging directory
    pub async fn begin(
        &self,
        file_name: &str,
        file_size: u64,
        total_chunks: u32,
        chunk_size: u64,
    ) -> Result<UploadSession> {
        if file_name.is_empty() || total_chunks == 0 {
            return Err(ServiceError::InvalidInput(
                "fileName and a positive totalChunks are required".to_string(),
            ));
        }

        let upload_id = Uuid::new_v4().to_string();
        let staging_dir = self.temp_dir.join(&upload_id);
        tokio::fs::create_dir_all(&staging_dir).await?;

        let now = Utc::now();
        let session = UploadSession {
            upload_id: upload_id.clone(),
            file_name: file_name.to_string(),
            file_size,
            total_chunks,
            chunk_size,
            received_count: 0,
            status: UploadStatus::Uploading,
            merged_path: None,
            created_at: now,
            updated_at: now,
            staging_dir,
            received: HashSet::new(),
            merge_gate: Arc::new(Mutex::new(())),
            merge_attempts: 0,
            cancel: CancellationToken::new(),
        };

        let mut sessions = self.sessions.write().expect("upload map lock poisoned");
        sessions.insert(upload_id, session.clone());
        info!(
            "upload session {} started: {} ({} chunks)",
            session.upload_id, session.file_name, session.total_chunks
        );
        Ok(session)
    }

    /// Snapshot of a session by ID
    pub fn get(&self, upload_id: &str) -> Result<UploadSession> {
        let sessions = self.sessions.read().expect("upload map lock poisoned");
        sessions
            .get(upload_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("upload not found: {}", upload_id)))
    }

    /// Persist one chunk and record its receipt.
    ///
    /// Receipt is idempotent per index: writing the same index twice
    /// overwrites the bytes but does not double-count. Returns the updated
    /// received count and whether the session now holds every chunk.
    pub async fn receive_chunk(
        &self,
        upload_id: &str,
        index: u32,
        bytes: &[u8],
    ) -> Result<(u32, bool)> {
        // Validate and pick up the chunk path under the shared lock; the
        // write itself happens with no lock held.
        let chunk_path = {
            let sessions = self.sessions.read().expect("upload map lock poisoned");
            let session = sessions.get(upload_id).ok_or_else(|| {
                ServiceError::NotFound(format!("upload not found: {}", upload_id))
            })?;
            if session.status != UploadStatus::Uploading {
                return Err(ServiceError::InvalidInput(format!(
                    "upload {} is no longer accepting chunks ({:?})",
                    upload_id, session.status
                )));
            }
            if index >= session.total_chunks {
                return Err(ServiceError::InvalidInput(format!(
                    "chunk index {} out of range (totalChunks = {})",
                    index, session.total_chunks
                )));
            }
            session.chunk_path(index)
        };

        let mut file = tokio::fs::File::create(&chunk_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        let mut sessions = self.sessions.write().expect("upload map lock poisoned");
        let session = sessions
            .get_mut(upload_id)
            .ok_or_else(|| ServiceError::NotFound(format!("upload not found: {}", upload_id)))?;
        if session.received.insert(index) {
            session.received_count += 1;
            session.updated_at = Utc::now();
        }
        debug!(
            "upload {}: chunk {} received ({}/{})",
            upload_id, index, session.received_count, session.total_chunks
        );
        Ok((session.received_count, session.is_complete()))
    }

    /// Merge the session's chunks, in strict index order, into one artifact.
    ///
    /// Safe to call concurrently with itself: a per-session gate serializes
    /// attempts, and the status re-check under the gate guarantees the
    /// underlying I/O runs exactly once. Later calls return the known path.
    /// A missing chunk aborts with `MissingChunk` and leaves the session in
    /// `Uploading` so the client can resubmit and retry.
    pub async fn complete(&self, upload_id: &str) -> Result<PathBuf> {
        let (gate, staging_dir, total_chunks, file_name) = {
            let sessions = self.sessions.read().expect("upload map lock poisoned");
            let session = sessions.get(upload_id).ok_or_else(|| {
                ServiceError::NotFound(format!("upload not found: {}", upload_id))
            })?;
            (
                Arc::clone(&session.merge_gate),
                session.staging_dir.clone(),
                session.total_chunks,
                session.file_name.clone(),
            )
        };

        let _guard = gate.lock().await;

        // Re-check after winning the gate: a concurrent caller may already
        // have merged.
        {
            let sessions = self.sessions.read().expect("upload map lock poisoned");
            let session = sessions.get(upload_id).ok_or_else(|| {
                ServiceError::NotFound(format!("upload not found: {}", upload_id))
            })?;
            if let Some(path) = &session.merged_path {
                return Ok(path.clone());
            }
        }

        // Every chunk must be present before any byte is written.
        for index in 0..total_chunks {
            let chunk = staging_dir.join(format!("chunk_{}", index));
            if tokio::fs::metadata(&chunk).await.is_err() {
                return Err(ServiceError::MissingChunk { index });
            }
        }

        {
            let mut sessions = self.sessions.write().expect("upload map lock poisoned");
            if let Some(session) = sessions.get_mut(upload_id) {
                session.merge_attempts += 1;
            }
        }

        let merged_path = self.data_dir.join(format!("{}_{}", upload_id, file_name));
        let merge = async {
            let mut out = tokio::fs::File::create(&merged_path).await?;
            for index in 0..total_chunks {
                let chunk = staging_dir.join(format!("chunk_{}", index));
                let data = tokio::fs::read(&chunk)
                    .await
                    .map_err(|_| ServiceError::MissingChunk { index })?;
                out.write_all(&data).await?;
            }
            out.flush().await?;
            Ok::<(), ServiceError>(())
        };
        if let Err(e) = merge.await {
            // never leave a half-written artifact at the final path
            let _ = tokio::fs::remove_file(&merged_path).await;
            return Err(e);
        }

        {
            let mut sessions = self.sessions.write().expect("upload map lock poisoned");
            let session = sessions.get_mut(upload_id).ok_or_else(|| {
                ServiceError::NotFound(format!("upload not found: {}", upload_id))
            })?;
            session.status = UploadStatus::Merged;
            session.merged_path = Some(merged_path.clone());
            session.updated_at = Utc::now();
        }

        info!("upload {} merged into {}", upload_id, merged_path.display());

        // Best-effort staging removal; the merged output is what matters.
        let staging = staging_dir.clone();
        let id = upload_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                warn!("upload {}: staging cleanup failed: {}", id, e);
            }
        });

        Ok(merged_path)
    }

    /// Cancel a session: signal any in-flight work, delete the staging area
    /// and any merged output, and drop the record. Idempotent: an unknown or
    /// already-cancelled ID is a no-op.
    pub async fn cancel(&self, upload_id: &str) -> Result<()> {
        let removed = {
            let mut sessions = self.sessions.write().expect("upload map lock poisoned");
            sessions.remove(upload_id)
        };

        if let Some(session) = removed {
            session.cancel.cancel();
            if let Err(e) = tokio::fs::remove_dir_all(&session.staging_dir).await {
                debug!("upload {}: staging removal: {}", upload_id, e);
            }
            if let Some(merged) = &session.merged_path {
                if let Err(e) = tokio::fs::remove_file(merged).await {
                    debug!("upload {}: merged artifact removal: {}", upload_id, e);
                }
            }
            info!("upload {} cancelled", upload_id);
        }
        Ok(())
    }

    /// IDs of sessions currently known to the assembler
    pub fn live_ids(&self) -> HashSet<String> {
        let sessions = self.sessions.read().expect("upload map lock poisoned");
        sessions.keys().cloned().collect()
    }
}
