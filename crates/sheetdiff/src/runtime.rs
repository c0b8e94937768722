//! In-process assembly of the whole pipeline: store, object store, bus,
//! orchestrator and the stage worker pool.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::info;

use crate::broadcast::StageEventBroadcaster;
use crate::bus::MemoryBus;
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::imaging::{FeatureAligner, OverlayCompositor};
use crate::pages::PageExtractor;
use crate::pipeline::model::{ChangeSummary, Job, ManualOverlay, NewJob, Page};
use crate::pipeline::orchestrator::Orchestrator;
use crate::pipeline::overlays;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::store::StageStore;
use crate::services::{HostedModelClient, OfflineServices, ServiceError, SummaryService, VisionService};
use crate::storage::{FsObjectStore, ObjectStore};
use crate::worker::{DiffWorker, OcrWorker, SummaryWorker, WorkerPool};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Model capabilities used by the OCR and summary stages.
#[derive(Clone)]
pub struct Services {
    pub vision: Arc<dyn VisionService>,
    pub summarizer: Arc<dyn SummaryService>,
}

impl Services {
    pub fn offline() -> Self {
        Self {
            vision: Arc::new(OfflineServices),
            summarizer: Arc::new(OfflineServices),
        }
    }

    /// The hosted model when `model` is configured, offline content
    /// otherwise.
    pub fn from_config(config: &Config) -> std::result::Result<Self, ServiceError> {
        match &config.model {
            Some(model) => {
                let client = Arc::new(HostedModelClient::from_config(model)?);
                info!("Using hosted model {} at {}", model.model, model.endpoint);
                Ok(Self {
                    vision: client.clone(),
                    summarizer: client,
                })
            }
            None => Ok(Self::offline()),
        }
    }
}

pub struct Runtime {
    store: StageStore,
    objects: Arc<dyn ObjectStore>,
    bus: MemoryBus,
    orchestrator: Arc<Orchestrator>,
    extractor: PageExtractor,
    summaries: SummaryWorker,
    pool: WorkerPool,
}

impl Runtime {
    /// Opens the configured SQLite database and filesystem object store.
    pub fn open(config: &Config, services: Services, events: Option<StageEventBroadcaster>) -> Result<Self> {
        let db = Database::open(Path::new(&config.storage.database))?;
        let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.storage.root)?);
        Self::start(config, db, objects, services, events)
    }

    pub fn start(
        config: &Config,
        db: Database,
        objects: Arc<dyn ObjectStore>,
        services: Services,
        events: Option<StageEventBroadcaster>,
    ) -> Result<Self> {
        let store = StageStore::new(db);
        let bus = MemoryBus::new();
        let mut orchestrator =
            Orchestrator::new(store.clone(), Arc::new(bus.clone()), RetryPolicy::from(&config.retry));
        if let Some(events) = events {
            orchestrator = orchestrator.with_events(events);
        }
        let orchestrator = Arc::new(orchestrator);

        let pool = WorkerPool::start(
            &bus,
            Arc::clone(&orchestrator),
            OcrWorker::new(store.clone(), Arc::clone(&objects), Arc::clone(&services.vision)),
            DiffWorker::new(
                store.clone(),
                Arc::clone(&objects),
                FeatureAligner::new(config.alignment.clone()),
                OverlayCompositor::new(config.overlay.clone()),
            ),
            SummaryWorker::new(store.clone(), Arc::clone(&objects), Arc::clone(&services.summarizer)),
            &config.workers,
        )?;

        Ok(Self {
            summaries: SummaryWorker::new(store.clone(), Arc::clone(&objects), services.summarizer),
            extractor: PageExtractor::new(config.pages.dpi),
            store,
            objects,
            bus,
            orchestrator,
            pool,
        })
    }

    pub fn store(&self) -> &StageStore {
        &self.store
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Splits a source document into pages of `version_id`.
    pub fn ingest(&self, version_id: &str, bytes: &[u8], filename: &str) -> Result<Vec<Page>> {
        Ok(self
            .extractor
            .ingest(self.store.db(), self.objects.as_ref(), version_id, bytes, filename)?)
    }

    pub fn compare(&self, request: &NewJob) -> Result<Job> {
        Ok(self.orchestrator.create_job(request)?)
    }

    /// Polls until the job is terminal or `timeout` passes, returning the
    /// latest state either way.
    pub fn wait_for_job(&self, job_id: &str, timeout: Duration) -> Result<Job> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.store.job(job_id)?;
            if job.status.is_terminal() || Instant::now() >= deadline {
                return Ok(job);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn regenerate_summary(&self, diff_result_id: &str) -> Result<ChangeSummary> {
        Ok(self.summaries.regenerate(diff_result_id)?)
    }

    pub fn set_manual_overlay(&self, diff_result_id: &str, png: &[u8], author: &str) -> Result<ManualOverlay> {
        overlays::set_manual_overlay(&self.store, self.objects.as_ref(), diff_result_id, png, author)
    }

    pub fn clear_manual_overlay(&self, diff_result_id: &str) -> Result<bool> {
        overlays::clear_manual_overlay(&self.store, diff_result_id)
    }

    /// Stops the workers after their in-flight deliveries and closes the bus.
    pub fn shutdown(self) {
        self.pool.shutdown();
        self.bus.shutdown();
    }
}
