//! In-process pipeline harness.
//!
//! `TestHarness` runs the full runtime (orchestrator, memory bus and the
//! three stage worker pools) over an in-memory SQLite database and an
//! in-memory object store, so every test starts from an empty system.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use image::RgbaImage;

use sheetdiff::config::{Config, PipelineMode};
use sheetdiff::db::{page_repo, Database};
use sheetdiff::pipeline::{DiffResult, Job, JobReport, JobStage, NewJob, Page, StageKey, StageStatus};
use sheetdiff::{MemoryObjectStore, ObjectStore, Runtime, Services, StageEventBroadcaster};

use super::sheets::png;

pub const JOB_TIMEOUT: Duration = Duration::from_secs(60);

pub struct TestHarness {
    pub runtime: Runtime,
    pub objects: Arc<MemoryObjectStore>,
    pub config: Config,
}

impl TestHarness {
    /// Starts a runtime with offline model services.
    pub fn new(config: Config) -> Self {
        Self::with_services(config, Services::offline(), None)
    }

    pub fn with_services(config: Config, services: Services, events: Option<StageEventBroadcaster>) -> Self {
        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        let objects = Arc::new(MemoryObjectStore::new());
        let shared: Arc<dyn ObjectStore> = objects.clone();
        let runtime = Runtime::start(&config, db, shared, services, events).expect("Failed to start runtime");
        Self {
            runtime,
            objects,
            config,
        }
    }

    /// Stores `sheets` as the pages of `version_id`, named in order.
    pub fn seed_version(&self, version_id: &str, sheets: &[(&str, &RgbaImage)]) -> Vec<Page> {
        let mut pages = Vec::new();
        for (i, (name, img)) in sheets.iter().enumerate() {
            let page_number = i as u32 + 1;
            let image_ref = self
                .objects
                .put(&format!("versions/{}/pages/{}.png", version_id, page_number), &png(img))
                .expect("Failed to store page image");
            let page = Page {
                version_id: version_id.to_string(),
                page_number,
                drawing_name: name.to_string(),
                image_ref,
                width: img.width(),
                height: img.height(),
                ocr_ref: None,
                source_name: None,
            };
            self.runtime
                .store()
                .db()
                .with_conn(|c| page_repo::upsert(c, &page))
                .expect("Failed to insert page");
            pages.push(page);
        }
        pages
    }

    pub fn compare(&self, old_version: &str, new_version: &str, mode: PipelineMode) -> Job {
        self.runtime
            .compare(&NewJob {
                project_id: "proj-test".to_string(),
                old_version_id: old_version.to_string(),
                new_version_id: new_version.to_string(),
                mode,
            })
            .expect("Failed to create job")
    }

    /// Waits for a terminal job status and for the bus to drain.
    pub fn finish(&self, job_id: &str) -> Job {
        let job = self
            .runtime
            .wait_for_job(job_id, JOB_TIMEOUT)
            .expect("Failed to poll job");
        assert!(
            job.status.is_terminal(),
            "job {} still {} after {:?}",
            job_id,
            job.status,
            JOB_TIMEOUT
        );
        self.settle();
        self.runtime.store().job(job_id).expect("Failed to reload job")
    }

    /// Waits until every published work item was acknowledged.
    pub fn settle(&self) {
        assert!(
            self.runtime.bus().wait_until_idle(JOB_TIMEOUT),
            "bus still has {} outstanding deliveries",
            self.runtime.bus().outstanding()
        );
    }

    /// Polls `condition` until it holds, failing the test after
    /// [`JOB_TIMEOUT`].
    pub fn wait_until(&self, what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + JOB_TIMEOUT;
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn report(&self, job_id: &str) -> JobReport {
        self.runtime
            .orchestrator()
            .job_report(job_id)
            .expect("Failed to load job report")
    }

    pub fn stage(&self, key: &StageKey) -> JobStage {
        self.runtime.store().stage(key).expect("Missing stage row")
    }

    pub fn stages_with(&self, job_id: &str, status: StageStatus) -> Vec<JobStage> {
        self.report(job_id)
            .stages
            .into_iter()
            .filter(|s| s.status == status)
            .collect()
    }

    pub fn current_diffs(&self, job_id: &str) -> Vec<DiffResult> {
        self.runtime
            .store()
            .current_diffs(job_id)
            .expect("Failed to load diff results")
    }

    pub fn shutdown(self) {
        self.runtime.shutdown();
    }
}
