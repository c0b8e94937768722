//! Durable stage state machine.
//!
//! Every transition runs in one `BEGIN IMMEDIATE` transaction and is driven
//! by conditional updates, so concurrent or duplicated deliveries of the
//! same work item agree on who completed it first.

use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use rusqlite::Connection;

use crate::config::PipelineMode;
use crate::db::{diff_repo, job_repo, overlay_repo, page_repo, stage_repo, summary_repo};
use crate::db::{Database, DatabaseError};
use crate::pipeline::error::OrchestratorError;
use crate::pipeline::model::{
    ChangeSummary, DiffResult, FanIn, Job, JobPage, JobReport, JobStage, JobStatus, ManualOverlay,
    Page, StageKey, StageKind, StageStatus,
};
use crate::storage::ObjectRef;

/// How a delivery relates to the stage row it targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// First run of a pending stage.
    Fresh,
    /// Re-run of a failed (or interrupted) attempt.
    Retry,
    /// The stage already completed; the run writes a correction and the
    /// row stays `completed`.
    Redelivery,
    /// Skipped stage or dead job; acknowledge without work.
    Skipped,
}

/// Result of recording a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Whether this call moved the row into `completed`.
    pub first_transition: bool,
    /// Whether this call replaced the result of an already completed row.
    pub corrected: bool,
    /// Job status after the transaction.
    pub job_status: JobStatus,
}

impl Completion {
    pub fn should_chain(&self) -> bool {
        self.first_transition && !self.job_status.is_terminal()
    }
}

/// Result of recording a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Recorded { retry_count: u32 },
    /// The row is completed or skipped; the failure changes nothing.
    Settled,
}

#[derive(Clone)]
pub struct StageStore {
    db: Database,
}

impl StageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Persists a new job, its page pairing and every stage row. Streaming
    /// jobs get one row per page and stage plus the summary fan-in parent.
    pub fn insert_job(&self, job: &Job, pages: &[JobPage]) -> Result<(), OrchestratorError> {
        self.db.with_tx(|tx| {
            job_repo::insert(tx, job)?;
            for page in pages {
                page_repo::insert_job_page(tx, page)?;
            }
            match job.mode {
                PipelineMode::Legacy => {
                    for stage in StageKind::ALL {
                        stage_repo::insert_pending(tx, &StageKey::job_level(&job.id, stage), None)?;
                    }
                }
                PipelineMode::Streaming => {
                    for page in pages {
                        for stage in StageKind::ALL {
                            stage_repo::insert_pending(
                                tx,
                                &StageKey::page(&job.id, stage, page.page_number),
                                None,
                            )?;
                        }
                    }
                    let parent = StageKey::job_level(&job.id, StageKind::Summary);
                    stage_repo::insert_pending(tx, &parent, Some(pages.len() as u32))?;
                    if pages.is_empty() {
                        settle_parent(tx, &parent, FanIn::new(0))?;
                    }
                }
            }
            Ok(())
        })
    }

    pub fn job(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        self.db
            .with_conn(|c| job_repo::find_by_id(c, job_id))?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
    }

    pub fn stage(&self, key: &StageKey) -> Result<JobStage, OrchestratorError> {
        self.db
            .with_conn(|c| stage_repo::find(c, key))?
            .ok_or_else(|| OrchestratorError::StageNotFound(key.to_string()))
    }

    pub fn report(&self, job_id: &str) -> Result<JobReport, OrchestratorError> {
        let job = self.job(job_id)?;
        let stages = self.db.with_conn(|c| stage_repo::list_for_job(c, job_id))?;
        Ok(JobReport { job, stages })
    }

    pub fn job_pages(&self, job_id: &str) -> Result<Vec<JobPage>, OrchestratorError> {
        Ok(self.db.with_conn(|c| page_repo::list_job_pages(c, job_id))?)
    }

    pub fn job_page(&self, job_id: &str, page_number: u32) -> Result<JobPage, OrchestratorError> {
        self.db
            .with_conn(|c| page_repo::find_job_page(c, job_id, page_number))?
            .ok_or_else(|| {
                OrchestratorError::StageNotFound(format!("{} page {}", job_id, page_number))
            })
    }

    /// Marks the stage `in_progress` for a new delivery and classifies it.
    pub fn begin_attempt(&self, key: &StageKey) -> Result<Attempt, OrchestratorError> {
        let attempt = self.db.with_tx(|tx| -> Result<_, OrchestratorError> {
            let job = find_job(tx, &key.job_id)?;
            let stage = find_stage(tx, key)?;

            let attempt = match (job.status, stage.status) {
                (JobStatus::Cancelled | JobStatus::Failed, _) => Attempt::Skipped,
                (_, StageStatus::Skipped) => Attempt::Skipped,
                // Only a manual retry reopens a stage that gave up.
                _ if stage.exhausted => Attempt::Skipped,
                (_, StageStatus::Completed) => {
                    stage_repo::bump_retry_count(tx, key)?;
                    Attempt::Redelivery
                }
                (JobStatus::Completed, _) => Attempt::Skipped,
                (_, StageStatus::Pending) => {
                    stage_repo::start(tx, key, &[StageStatus::Pending])?;
                    Attempt::Fresh
                }
                (_, StageStatus::Failed) => {
                    stage_repo::start(tx, key, &[StageStatus::Failed])?;
                    Attempt::Retry
                }
                (_, StageStatus::InProgress) => Attempt::Retry,
            };

            if matches!(attempt, Attempt::Fresh | Attempt::Retry) {
                job_repo::transition(
                    tx,
                    &key.job_id,
                    &[JobStatus::Created],
                    JobStatus::InProgress,
                    None,
                )?;
            }
            Ok(attempt)
        })?;

        debug!("Stage {} attempt: {:?}", key, attempt);
        Ok(attempt)
    }

    /// Records a successful run. Only the first call for a key changes the
    /// status; later ones replace `result_ref` as a correction. Skipped and
    /// exhausted rows are left alone. Completing a
    /// streaming page summary bumps the parent fan-in in the same
    /// transaction and settles the job once every page is accounted for.
    pub fn complete_stage(
        &self,
        key: &StageKey,
        result_ref: Option<&str>,
    ) -> Result<Completion, OrchestratorError> {
        self.db.with_tx(|tx| {
            let job = find_job(tx, &key.job_id)?;
            let stage = find_stage(tx, key)?;
            if stage.status == StageStatus::Skipped || stage.exhausted {
                return Ok(Completion {
                    first_transition: false,
                    corrected: false,
                    job_status: job.status,
                });
            }

            let first_transition = stage_repo::complete(tx, key, result_ref)?;
            if !first_transition {
                stage_repo::set_result_ref(tx, key, result_ref)?;
            } else if key.stage == StageKind::Summary {
                match (job.mode, key.page) {
                    (PipelineMode::Streaming, Some(_)) => {
                        let parent = StageKey::job_level(&key.job_id, StageKind::Summary);
                        if let Some(fan_in) = stage_repo::adjust_fan_in(tx, &parent, 1, 0)? {
                            if fan_in.is_settled() {
                                settle_parent(tx, &parent, fan_in)?;
                            }
                        }
                    }
                    _ => {
                        job_repo::transition(
                            tx,
                            &key.job_id,
                            &[JobStatus::Created, JobStatus::InProgress],
                            JobStatus::Completed,
                            None,
                        )?;
                    }
                }
            }

            let job_status = job_repo::status_of(tx, &key.job_id)?.unwrap_or(job.status);
            Ok(Completion {
                first_transition,
                corrected: !first_transition,
                job_status,
            })
        })
    }

    /// Records a failed run: the row moves to `failed`, the error is kept
    /// and `retry_count` grows by one.
    pub fn fail_stage(&self, key: &StageKey, error: &str) -> Result<Failure, OrchestratorError> {
        self.db.with_tx(|tx| {
            let stage = find_stage(tx, key)?;
            Ok(match stage.status {
                StageStatus::Completed | StageStatus::Skipped => Failure::Settled,
                StageStatus::Pending | StageStatus::InProgress => {
                    stage_repo::fail(tx, key, error)?;
                    Failure::Recorded {
                        retry_count: stage.retry_count + 1,
                    }
                }
                StageStatus::Failed => Failure::Recorded {
                    retry_count: stage.retry_count,
                },
            })
        })
    }

    /// Gives up on a stage. Streaming: the page counts as a failed fan-in
    /// member and its remaining stages are skipped. Legacy: the job fails.
    /// Returns the job status when this call settled the job.
    pub fn mark_exhausted(
        &self,
        key: &StageKey,
        error: &str,
    ) -> Result<Option<JobStatus>, OrchestratorError> {
        let settled = self.db.with_tx(|tx| -> Result<_, OrchestratorError> {
            let job = find_job(tx, &key.job_id)?;
            if !stage_repo::set_exhausted(tx, key, true)? {
                return Ok(None);
            }

            match (job.mode, key.page) {
                (PipelineMode::Streaming, Some(page)) => {
                    stage_repo::skip_pending(tx, &key.job_id, Some(page), &downstream_of(key.stage))?;
                    let parent = StageKey::job_level(&key.job_id, StageKind::Summary);
                    match stage_repo::adjust_fan_in(tx, &parent, 0, 1)? {
                        Some(fan_in) if fan_in.is_settled() => {
                            Ok(Some(settle_parent(tx, &parent, fan_in)?))
                        }
                        _ => Ok(None),
                    }
                }
                _ => {
                    let message = format!("{} stage exhausted its retries: {}", key.stage, error);
                    let failed = job_repo::transition(
                        tx,
                        &key.job_id,
                        &[JobStatus::Created, JobStatus::InProgress],
                        JobStatus::Failed,
                        Some(&message),
                    )?;
                    stage_repo::skip_pending(tx, &key.job_id, None, &StageKind::ALL)?;
                    Ok(failed.then_some(JobStatus::Failed))
                }
            }
        })?;

        match settled {
            Some(status) => info!("Job {} settled as {} after {} gave up", key.job_id, status, key),
            None => warn!("Stage {} exhausted its retries", key),
        }
        Ok(settled)
    }

    /// Resets a failed stage to `pending` for a manual retry. An exhausted
    /// streaming page is taken back out of the failed fan-in count and its
    /// skipped downstream stages are reopened.
    pub fn reset_failed(&self, key: &StageKey) -> Result<(), OrchestratorError> {
        self.db.with_tx(|tx| {
            let job = find_job(tx, &key.job_id)?;
            if job.status.is_terminal() {
                return Err(OrchestratorError::JobTerminal {
                    job_id: job.id,
                    status: job.status,
                });
            }
            let stage = find_stage(tx, key)?;
            if stage.status != StageStatus::Failed {
                return Err(OrchestratorError::NotFailed {
                    key: key.to_string(),
                    status: stage.status,
                });
            }

            stage_repo::reset_failed(tx, key)?;
            if let (true, Some(page)) = (stage.exhausted, key.page) {
                let parent = StageKey::job_level(&key.job_id, StageKind::Summary);
                stage_repo::adjust_fan_in(tx, &parent, 0, -1)?;
                stage_repo::reopen_skipped(tx, &key.job_id, page, &downstream_of(key.stage))?;
            }
            Ok(())
        })
    }

    /// Cancels a live job and skips every pending stage. Returns `false`
    /// when the job was already terminal.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool, OrchestratorError> {
        self.db.with_tx(|tx| {
            find_job(tx, job_id)?;
            let cancelled = job_repo::transition(
                tx,
                job_id,
                &[JobStatus::Created, JobStatus::InProgress],
                JobStatus::Cancelled,
                None,
            )?;
            if cancelled {
                let skipped = stage_repo::skip_pending(tx, job_id, None, &StageKind::ALL)?;
                debug!("Cancelled job {} ({} stages skipped)", job_id, skipped);
            }
            Ok(cancelled)
        })
    }

    pub fn record_metadata(
        &self,
        key: &StageKey,
        metadata: &serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        Ok(self.db.with_conn(|c| stage_repo::set_metadata(c, key, metadata))?)
    }

    /// Stages of live jobs untouched for longer than `older_than`.
    pub fn stalled_stages(&self, older_than: Duration) -> Result<Vec<JobStage>, OrchestratorError> {
        let age = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let before = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        Ok(self.db.with_conn(|c| stage_repo::stalled(c, before))?)
    }

    /// Stores `result` as the current diff of its page, superseding any
    /// earlier one. Returns the superseded id.
    pub fn record_diff_result(&self, result: &DiffResult) -> Result<Option<String>, DatabaseError> {
        self.db.with_tx(|tx| diff_repo::insert_superseding(tx, result))
    }

    pub fn activate_summary(&self, summary: &ChangeSummary) -> Result<(), DatabaseError> {
        self.db.with_tx(|tx| summary_repo::activate(tx, summary).map(|_| ()))
    }

    pub fn activate_manual_overlay(&self, overlay: &ManualOverlay) -> Result<(), DatabaseError> {
        self.db.with_tx(|tx| overlay_repo::activate(tx, overlay))
    }

    pub fn deactivate_manual_overlay(&self, diff_result_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.db.with_conn(|c| overlay_repo::deactivate(c, diff_result_id))? > 0)
    }

    pub fn active_manual_overlay(
        &self,
        diff_result_id: &str,
    ) -> Result<Option<ManualOverlay>, DatabaseError> {
        self.db.with_conn(|c| overlay_repo::active_for_diff(c, diff_result_id))
    }

    pub fn active_summary(&self, diff_result_id: &str) -> Result<Option<ChangeSummary>, DatabaseError> {
        self.db.with_conn(|c| summary_repo::active_for_diff(c, diff_result_id))
    }

    pub fn summary_history(&self, diff_result_id: &str) -> Result<Vec<ChangeSummary>, DatabaseError> {
        self.db.with_conn(|c| summary_repo::history(c, diff_result_id))
    }

    pub fn page(&self, version_id: &str, page_number: u32) -> Result<Page, OrchestratorError> {
        self.db
            .with_conn(|c| page_repo::find(c, version_id, page_number))?
            .ok_or_else(|| OrchestratorError::PageNotFound {
                version_id: version_id.to_string(),
                page: page_number,
            })
    }

    pub fn pages_of_version(&self, version_id: &str) -> Result<Vec<Page>, DatabaseError> {
        self.db.with_conn(|c| page_repo::list_for_version(c, version_id))
    }

    pub fn set_page_ocr_ref(
        &self,
        version_id: &str,
        page_number: u32,
        ocr_ref: &ObjectRef,
    ) -> Result<bool, DatabaseError> {
        self.db
            .with_conn(|c| page_repo::set_ocr_ref(c, version_id, page_number, ocr_ref))
    }

    pub fn diff_result(&self, id: &str) -> Result<Option<DiffResult>, DatabaseError> {
        self.db.with_conn(|c| diff_repo::find_by_id(c, id))
    }

    pub fn current_diff(&self, job_id: &str, page_number: u32) -> Result<Option<DiffResult>, DatabaseError> {
        self.db
            .with_conn(|c| diff_repo::current_for_page(c, job_id, page_number))
    }

    pub fn current_diffs(&self, job_id: &str) -> Result<Vec<DiffResult>, DatabaseError> {
        self.db.with_conn(|c| diff_repo::list_current(c, job_id))
    }

    pub fn diff_history(&self, job_id: &str, page_number: u32) -> Result<Vec<DiffResult>, DatabaseError> {
        self.db
            .with_conn(|c| diff_repo::history_for_page(c, job_id, page_number))
    }
}

fn find_job(conn: &Connection, job_id: &str) -> Result<Job, OrchestratorError> {
    job_repo::find_by_id(conn, job_id)?
        .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
}

fn find_stage(conn: &Connection, key: &StageKey) -> Result<JobStage, OrchestratorError> {
    stage_repo::find(conn, key)?.ok_or_else(|| OrchestratorError::StageNotFound(key.to_string()))
}

fn downstream_of(stage: StageKind) -> Vec<StageKind> {
    let mut stages = Vec::new();
    let mut next = stage.next();
    while let Some(s) = next {
        stages.push(s);
        next = s.next();
    }
    stages
}

/// Completes the fan-in parent and moves the job to its final status: it
/// completes when at least one page made it through (or there were none),
/// and fails when every page failed.
fn settle_parent(
    conn: &Connection,
    parent: &StageKey,
    fan_in: FanIn,
) -> Result<JobStatus, DatabaseError> {
    stage_repo::complete(conn, parent, None)?;
    let (status, error) = if fan_in.completed > 0 || fan_in.expected == 0 {
        (JobStatus::Completed, None)
    } else {
        (
            JobStatus::Failed,
            Some(format!("all {} pages failed", fan_in.expected)),
        )
    };
    job_repo::transition(
        conn,
        &parent.job_id,
        &[JobStatus::Created, JobStatus::InProgress],
        status,
        error.as_deref(),
    )?;
    Ok(status)
}
