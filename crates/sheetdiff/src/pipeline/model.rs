//! Records and state enums shared by the store, orchestrator and workers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PipelineMode;
use crate::imaging::CompositeMode;
use crate::storage::ObjectRef;

/// Status of a comparison job. Terminal statuses never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Ocr,
    Diff,
    Summary,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [StageKind::Ocr, StageKind::Diff, StageKind::Summary];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ocr => "ocr",
            Self::Diff => "diff",
            Self::Summary => "summary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ocr" => Some(Self::Ocr),
            "diff" => Some(Self::Diff),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }

    /// Stage chained after this one completes.
    pub fn next(&self) -> Option<StageKind> {
        match self {
            Self::Ocr => Some(Self::Diff),
            Self::Diff => Some(Self::Summary),
            Self::Summary => None,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one stage row: `(job, stage, page)`. `page` is `None` for
/// whole-document stages and for the streaming summary parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StageKey {
    pub job_id: String,
    pub stage: StageKind,
    pub page: Option<u32>,
}

/// Column value standing in for "no page" so the unique key stays total.
pub const NO_PAGE: i64 = -1;

impl StageKey {
    pub fn job_level(job_id: impl Into<String>, stage: StageKind) -> Self {
        Self {
            job_id: job_id.into(),
            stage,
            page: None,
        }
    }

    pub fn page(job_id: impl Into<String>, stage: StageKind, page: u32) -> Self {
        Self {
            job_id: job_id.into(),
            stage,
            page: Some(page),
        }
    }

    pub fn page_key(&self) -> i64 {
        self.page.map(i64::from).unwrap_or(NO_PAGE)
    }

    pub fn with_stage(&self, stage: StageKind) -> Self {
        Self {
            stage,
            ..self.clone()
        }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.page {
            Some(p) => write!(f, "{}/{}/p{}", self.job_id, self.stage, p),
            None => write!(f, "{}/{}", self.job_id, self.stage),
        }
    }
}

/// Progress of the streaming summary fan-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FanIn {
    pub expected: u32,
    pub completed: u32,
    pub failed: u32,
}

impl FanIn {
    pub fn new(expected: u32) -> Self {
        Self {
            expected,
            completed: 0,
            failed: 0,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.completed + self.failed >= self.expected
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub project_id: String,
    pub old_version_id: String,
    pub new_version_id: String,
    pub mode: PipelineMode,
    pub status: JobStatus,
    pub total_pages: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStage {
    pub job_id: String,
    pub stage: StageKind,
    pub page_number: Option<u32>,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub result_ref: Option<String>,
    pub retry_count: u32,
    pub exhausted: bool,
    pub fan_in: Option<FanIn>,
    pub stage_metadata: Option<serde_json::Value>,
}

impl JobStage {
    pub fn key(&self) -> StageKey {
        StageKey {
            job_id: self.job_id.clone(),
            stage: self.stage,
            page: self.page_number,
        }
    }
}

/// One paired sheet of a job. `page_number` is the pair index used as the
/// streaming stage key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPage {
    pub job_id: String,
    pub page_number: u32,
    pub old_page_number: u32,
    pub new_page_number: u32,
    pub drawing_name: String,
}

/// A rasterized page of one document version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub version_id: String,
    pub page_number: u32,
    pub drawing_name: String,
    pub image_ref: ObjectRef,
    pub width: u32,
    pub height: u32,
    pub ocr_ref: Option<ObjectRef>,
    /// File the page was rasterized from, when known.
    pub source_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffResult {
    pub id: String,
    pub job_id: String,
    pub page_number: u32,
    pub drawing_name: String,
    pub change_count: u32,
    pub alignment_score: f64,
    pub added_pixels: u64,
    pub removed_pixels: u64,
    pub overlap_pixels: u64,
    pub overlay_ref: ObjectRef,
    pub baseline_ref: ObjectRef,
    pub revised_ref: ObjectRef,
    pub composite_mode: CompositeMode,
    pub alignment_report: Option<serde_json::Value>,
    pub superseded_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub id: String,
    pub diff_result_id: String,
    pub changes: Vec<String>,
    pub critical_change: Option<String>,
    pub recommendations: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualOverlay {
    pub id: String,
    pub diff_result_id: String,
    pub overlay_ref: ObjectRef,
    pub author: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Request to compare two ingested document versions.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub project_id: String,
    pub old_version_id: String,
    pub new_version_id: String,
    pub mode: PipelineMode,
}

/// Job plus every stage row, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: Job,
    pub stages: Vec<JobStage>,
}

impl JobReport {
    pub fn stage(&self, key: &StageKey) -> Option<&JobStage> {
        self.stages.iter().find(|s| s.key() == *key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            JobStatus::Created,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            StageStatus::Pending,
            StageStatus::InProgress,
            StageStatus::Completed,
            StageStatus::Failed,
            StageStatus::Skipped,
        ] {
            assert_eq!(StageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StageStatus::parse("done"), None);
    }

    #[test]
    fn test_stage_chain() {
        assert_eq!(StageKind::Ocr.next(), Some(StageKind::Diff));
        assert_eq!(StageKind::Diff.next(), Some(StageKind::Summary));
        assert_eq!(StageKind::Summary.next(), None);
    }

    #[test]
    fn test_stage_key_page_key() {
        assert_eq!(StageKey::job_level("j", StageKind::Ocr).page_key(), NO_PAGE);
        let key = StageKey::page("j", StageKind::Diff, 4);
        assert_eq!(key.page_key(), 4);
        assert_eq!(key.to_string(), "j/diff/p4");
        assert_eq!(key.with_stage(StageKind::Summary).stage, StageKind::Summary);
    }

    #[test]
    fn test_fan_in_settles() {
        let mut fan_in = FanIn::new(3);
        assert!(!fan_in.is_settled());
        fan_in.completed = 2;
        fan_in.failed = 1;
        assert!(fan_in.is_settled());
        assert!(FanIn::new(0).is_settled());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }
}
