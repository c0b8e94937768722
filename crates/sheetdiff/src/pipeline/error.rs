use thiserror::Error;

use crate::db::DatabaseError;
use crate::error::BusError;
use crate::pipeline::model::{JobStatus, StageStatus};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Job {job_id} is {status}")]
    JobTerminal { job_id: String, status: JobStatus },

    #[error("Stage {key} is {status}, only failed stages can be retried")]
    NotFailed { key: String, status: StageStatus },

    #[error("Stage {0} has no work item to publish")]
    NoWorkItem(String),

    #[error("Page {page} of version {version_id} not found")]
    PageNotFound { version_id: String, page: u32 },

    #[error("No current diff result for job {job_id} page {page}")]
    DiffResultNotFound { job_id: String, page: u32 },

    #[error("Diff result not found: {0}")]
    DiffNotFound(String),

    #[error("Failed to encode task: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Bus(#[from] BusError),
}
