//! Drives jobs through OCR, Diff and Summary.
//!
//! The orchestrator owns no mutable state of its own: every decision goes
//! through the [`StageStore`], and work is handed to workers over the
//! [`MessageBus`]. Chaining publishes are fire-and-forget; a failed publish
//! leaves the next stage `pending`, where [`Orchestrator::stalled_stages`]
//! finds it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::broadcast::{StageEvent, StageEventBroadcaster};
use crate::bus::{MessageBus, Topic};
use crate::config::PipelineMode;
use crate::pages::pair_pages;
use crate::pipeline::error::OrchestratorError;
use crate::pipeline::model::{
    Job, JobPage, JobReport, JobStage, JobStatus, NewJob, StageKey, StageKind, StageStatus,
};
use crate::pipeline::retry::{FailureDecision, RetryPolicy};
use crate::pipeline::store::{Attempt, Completion, Failure, StageStore};
use crate::pipeline::tasks::{encode, DiffTask, Metadata, OcrTask, SummaryTask};

pub struct Orchestrator {
    store: StageStore,
    bus: Arc<dyn MessageBus>,
    policy: RetryPolicy,
    events: Option<StageEventBroadcaster>,
}

impl Orchestrator {
    pub fn new(store: StageStore, bus: Arc<dyn MessageBus>, policy: RetryPolicy) -> Self {
        Self {
            store,
            bus,
            policy,
            events: None,
        }
    }

    /// Emits every observed transition on `events`.
    pub fn with_events(mut self, events: StageEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &StageStore {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Pairs the pages of both versions, persists the job with its stage
    /// rows and publishes the OCR work.
    pub fn create_job(&self, request: &NewJob) -> Result<Job, OrchestratorError> {
        let old_pages = self.store.pages_of_version(&request.old_version_id)?;
        let new_pages = self.store.pages_of_version(&request.new_version_id)?;
        let pairs = pair_pages(&old_pages, &new_pages);

        let now = Utc::now();
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: request.project_id.clone(),
            old_version_id: request.old_version_id.clone(),
            new_version_id: request.new_version_id.clone(),
            mode: request.mode,
            status: JobStatus::Created,
            total_pages: pairs.len() as u32,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        let _span = tracing::info_span!("job.create", job_id = %job.id, mode = job.mode.as_str()).entered();

        let job_pages: Vec<JobPage> = pairs
            .into_iter()
            .enumerate()
            .map(|(i, pair)| JobPage {
                job_id: job.id.clone(),
                page_number: i as u32 + 1,
                old_page_number: pair.old_page_number,
                new_page_number: pair.new_page_number,
                drawing_name: pair.drawing_name,
            })
            .collect();
        if job_pages.len() < old_pages.len().max(new_pages.len()) {
            warn!(
                "Job {}: {} old and {} new pages, only {} paired",
                job.id,
                old_pages.len(),
                new_pages.len(),
                job_pages.len()
            );
        }

        self.store.insert_job(&job, &job_pages)?;
        info!("Created {} job {} with {} page pairs", job.mode.as_str(), job.id, job_pages.len());
        self.emit(StageEvent::job(&job.id, JobStatus::Created, "Job created"));

        let first_keys: Vec<StageKey> = match job.mode {
            PipelineMode::Legacy => vec![StageKey::job_level(&job.id, StageKind::Ocr)],
            PipelineMode::Streaming => job_pages
                .iter()
                .map(|p| StageKey::page(&job.id, StageKind::Ocr, p.page_number))
                .collect(),
        };
        for key in &first_keys {
            if let Err(e) = self.publish_stage(key) {
                error!("Failed to publish {}: {}. The stage stays pending.", key, e);
            }
        }

        // An empty streaming job settles at insertion.
        let job = self.store.job(&job.id)?;
        if job.status.is_terminal() {
            self.emit(StageEvent::job(&job.id, job.status, "Job has no page pairs"));
        }
        Ok(job)
    }

    /// Marks the stage `in_progress` for a delivery.
    pub fn begin_attempt(&self, key: &StageKey) -> Result<Attempt, OrchestratorError> {
        let attempt = self.store.begin_attempt(key)?;
        match attempt {
            Attempt::Fresh | Attempt::Retry => {
                self.emit(StageEvent::stage(key, StageStatus::InProgress, "Stage started"));
            }
            Attempt::Redelivery => {
                debug!("Stage {} redelivered after completion, running as a correction", key);
            }
            Attempt::Skipped => debug!("Stage {} skipped", key),
        }
        Ok(attempt)
    }

    /// Records a successful run and chains the next stage, but only on the
    /// first transition into `completed` and only while the job is live.
    pub fn on_stage_completed(
        &self,
        key: &StageKey,
        result_ref: Option<&str>,
    ) -> Result<Completion, OrchestratorError> {
        let completion = self.store.complete_stage(key, result_ref)?;
        if completion.corrected && key.stage == StageKind::Diff {
            self.resummarize(key, completion.job_status);
        }
        if !completion.first_transition {
            return Ok(completion);
        }

        self.emit(StageEvent::stage(key, StageStatus::Completed, "Stage completed"));
        if completion.job_status.is_terminal() {
            info!("Job {} finished as {}", key.job_id, completion.job_status);
            self.emit(StageEvent::job(&key.job_id, completion.job_status, "Job finished"));
        }

        if completion.should_chain() {
            if let Some(next) = key.stage.next() {
                let next_key = key.with_stage(next);
                if let Err(e) = self.publish_stage(&next_key) {
                    error!("Failed to chain {}: {}. The stage stays pending.", next_key, e);
                }
            }
        }
        Ok(completion)
    }

    /// Queues summary work again after a corrected diff so the current
    /// diff gets its own active summary. A summary row that already
    /// completed takes the run as a correction and chains nothing.
    fn resummarize(&self, diff_key: &StageKey, job_status: JobStatus) {
        if matches!(job_status, JobStatus::Cancelled | JobStatus::Failed) {
            return;
        }
        let summary_key = diff_key.with_stage(StageKind::Summary);
        let queued = self.store.stage(&summary_key).and_then(|summary| {
            if summary.status == StageStatus::Skipped || summary.exhausted {
                return Ok(false);
            }
            self.publish_stage(&summary_key).map(|_| true)
        });
        match queued {
            Ok(true) => info!("Diff {} was corrected, summarizing it again", diff_key),
            Ok(false) => debug!("Summary of corrected {} is not running", diff_key),
            Err(e) => error!("Failed to queue summary for corrected {}: {}", diff_key, e),
        }
    }

    /// Records a failed run and decides what the bus should do with the
    /// delivery. Exhausted stages fail the job (legacy) or count as a
    /// failed page of the fan-in (streaming).
    pub fn on_stage_failed(
        &self,
        key: &StageKey,
        error: &str,
    ) -> Result<FailureDecision, OrchestratorError> {
        let retry_count = match self.store.fail_stage(key, error)? {
            Failure::Settled => return Ok(FailureDecision::Settled),
            Failure::Recorded { retry_count } => retry_count,
        };
        self.emit(StageEvent::stage(key, StageStatus::Failed, "Stage attempt failed").with_error(error));

        let decision = self.policy.decide(retry_count);
        match decision {
            FailureDecision::Retry { delay } => {
                warn!("Stage {} failed (attempt {}), retrying in {:?}: {}", key, retry_count, delay, error);
            }
            FailureDecision::Exhausted => {
                if let Some(status) = self.store.mark_exhausted(key, error)? {
                    self.emit(
                        StageEvent::job(&key.job_id, status, "Job settled after a stage gave up")
                            .with_error(error),
                    );
                }
            }
            FailureDecision::Settled => {}
        }
        Ok(decision)
    }

    /// Cancels the job; pending stages are skipped and in-flight ones are
    /// not chained. Returns `false` when the job had already finished.
    pub fn cancel_job(&self, job_id: &str) -> Result<bool, OrchestratorError> {
        let cancelled = self.store.cancel_job(job_id)?;
        if cancelled {
            info!("Cancelled job {}", job_id);
            self.emit(StageEvent::job(job_id, JobStatus::Cancelled, "Job cancelled"));
        }
        Ok(cancelled)
    }

    /// Resets a failed stage and publishes its work item again.
    pub fn retry_stage(&self, key: &StageKey) -> Result<(), OrchestratorError> {
        self.store.reset_failed(key)?;
        self.emit(StageEvent::stage(key, StageStatus::Pending, "Manual retry requested"));
        self.publish_stage(key)
    }

    pub fn job_report(&self, job_id: &str) -> Result<JobReport, OrchestratorError> {
        self.store.report(job_id)
    }

    pub fn stalled_stages(&self, older_than: Duration) -> Result<Vec<JobStage>, OrchestratorError> {
        self.store.stalled_stages(older_than)
    }

    /// Builds the work item for `key` from the stored records and
    /// publishes it on the stage's topic.
    pub fn publish_stage(&self, key: &StageKey) -> Result<(), OrchestratorError> {
        let job = self.store.job(&key.job_id)?;
        let payload = match (job.mode, key.page) {
            (PipelineMode::Legacy, None) => self.legacy_payload(key)?,
            (PipelineMode::Streaming, Some(page)) => self.streaming_payload(&job, key.stage, page)?,
            _ => return Err(OrchestratorError::NoWorkItem(key.to_string())),
        };
        self.bus.publish(Topic::from(key.stage), payload)?;
        debug!("Published {}", key);
        Ok(())
    }

    fn legacy_payload(&self, key: &StageKey) -> Result<Vec<u8>, OrchestratorError> {
        let job_id = key.job_id.clone();
        let metadata = Metadata::new();
        Ok(match key.stage {
            StageKind::Ocr => encode(&OcrTask::Legacy { job_id, metadata })?,
            StageKind::Diff => encode(&DiffTask::Legacy { job_id, metadata })?,
            StageKind::Summary => encode(&SummaryTask::Legacy { job_id, metadata })?,
        })
    }

    fn streaming_payload(
        &self,
        job: &Job,
        stage: StageKind,
        page_number: u32,
    ) -> Result<Vec<u8>, OrchestratorError> {
        let job_page = self.store.job_page(&job.id, page_number)?;
        let job_id = job.id.clone();
        let mut metadata = Metadata::new();
        metadata.insert("drawing_name".to_string(), job_page.drawing_name.clone().into());

        Ok(match stage {
            StageKind::Ocr | StageKind::Diff => {
                let old_ref = self
                    .store
                    .page(&job.old_version_id, job_page.old_page_number)?
                    .image_ref;
                let new_ref = self
                    .store
                    .page(&job.new_version_id, job_page.new_page_number)?
                    .image_ref;
                if stage == StageKind::Ocr {
                    encode(&OcrTask::Streaming {
                        job_id,
                        page_number,
                        old_ref,
                        new_ref,
                        metadata,
                    })?
                } else {
                    encode(&DiffTask::Streaming {
                        job_id,
                        page_number,
                        old_ref,
                        new_ref,
                        drawing_name: job_page.drawing_name,
                        metadata,
                    })?
                }
            }
            StageKind::Summary => {
                let diff = self.store.current_diff(&job.id, page_number)?.ok_or_else(|| {
                    OrchestratorError::DiffResultNotFound {
                        job_id: job.id.clone(),
                        page: page_number,
                    }
                })?;
                encode(&SummaryTask::Streaming {
                    job_id,
                    page_number,
                    diff_result_id: diff.id,
                    overlay_ref: diff.overlay_ref,
                    metadata,
                })?
            }
        })
    }

    fn emit(&self, event: StageEvent) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }
}
