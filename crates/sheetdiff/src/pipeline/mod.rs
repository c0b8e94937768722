pub mod error;
pub mod model;
pub mod orchestrator;
pub mod overlays;
pub mod retry;
pub mod store;
pub mod tasks;

pub use error::OrchestratorError;
pub use model::{
    ChangeSummary, DiffResult, FanIn, Job, JobPage, JobReport, JobStage, JobStatus, ManualOverlay,
    NewJob, Page, StageKey, StageKind, StageStatus,
};
pub use orchestrator::Orchestrator;
pub use overlays::{active_manual_overlay, clear_manual_overlay, set_manual_overlay};
pub use retry::{FailureDecision, RetryPolicy};
pub use store::{Attempt, Completion, Failure, StageStore};
pub use tasks::{DiffTask, OcrTask, StageTask, SummaryTask};
