use thiserror::Error;

/// Error taxonomy for the orchestration layer.
///
/// `ChunkAssembler` and `TaskRegistry` return these synchronously; the
/// `JobRunner` never surfaces them to its caller and instead records them
/// into the task's terminal state.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Unknown session, task, or segment ID.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed client input (bad interval list, negative duration,
    /// chunk index out of range, transition applied to a terminal task).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An expected chunk file was absent at merge time. The session stays
    /// in `Uploading` so the client may resubmit the chunk and retry.
    #[error("chunk {index} has not been uploaded")]
    MissingChunk { index: u32 },

    /// Staging, merge, or output file operation failed.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// The transcoding engine reported a non-zero outcome. Carries the
    /// engine's diagnostic output verbatim.
    #[error("engine failure: {0}")]
    Engine(String),

    /// Explicit user cancellation observed mid-flight.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ServiceError>;
