pub mod config;
pub mod engine;
pub mod error;
pub mod housekeeping;
pub mod hwaccel;
pub mod planner;
pub mod runner;
pub mod split;
pub mod task;
pub mod upload;

pub use config::ServiceConfig;
pub use engine::{ConvertSpec, EncodePath, FfmpegEngine, TranscodeEngine};
pub use error::{Result, ServiceError};
pub use hwaccel::{HwAccelKind, HwCaps};
pub use planner::{plan_keep_intervals, Interval};
pub use runner::JobRunner;
pub use split::{SplitOutcome, SplitRequest, Splitter};
pub use task::{ConversionTask, TaskRegistry, TaskStatus};
pub use upload::{ChunkAssembler, UploadSession, UploadStatus};
