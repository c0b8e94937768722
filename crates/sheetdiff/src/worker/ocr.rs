use std::sync::Arc;

use log::debug;

use crate::error::WorkerError;
use crate::pipeline::model::{Job, JobPage, StageKey, StageKind};
use crate::pipeline::store::{Attempt, StageStore};
use crate::pipeline::tasks::OcrTask;
use crate::services::prompts::OCR_PROMPT;
use crate::services::VisionService;
use crate::storage::{ObjectRef, ObjectStore};
use crate::worker::runner::{BatchReport, StageWorker};

/// Reads the text of both sheets of a page pair through the vision
/// service and records it on the page rows.
pub struct OcrWorker {
    store: StageStore,
    objects: Arc<dyn ObjectStore>,
    vision: Arc<dyn VisionService>,
}

impl OcrWorker {
    pub fn new(store: StageStore, objects: Arc<dyn ObjectStore>, vision: Arc<dyn VisionService>) -> Self {
        Self {
            store,
            objects,
            vision,
        }
    }

    /// OCR refs of the old and the new sheet, in that order.
    fn ocr_pair(&self, job: &Job, pair: &JobPage, force: bool) -> Result<[ObjectRef; 2], WorkerError> {
        let old = self.ocr_page(&job.old_version_id, pair.old_page_number, force)?;
        let new = self.ocr_page(&job.new_version_id, pair.new_page_number, force)?;
        Ok([old, new])
    }

    /// Pages are shared between jobs of the same version, so an existing
    /// OCR result is reused unless this run is a correction.
    fn ocr_page(&self, version_id: &str, page_number: u32, force: bool) -> Result<ObjectRef, WorkerError> {
        let page = self.store.page(version_id, page_number)?;
        if let (Some(existing), false) = (&page.ocr_ref, force) {
            debug!("Reusing OCR of {} page {}", version_id, page_number);
            return Ok(existing.clone());
        }

        let _span = tracing::info_span!("ocr.page", version_id, page_number).entered();
        let image = self.objects.get(&page.image_ref)?;
        let document = self.vision.extract(&image, OCR_PROMPT)?;
        let ocr_ref = self.objects.put(
            &format!("versions/{}/ocr/{}.json", version_id, page_number),
            &serde_json::to_vec(&document)?,
        )?;
        self.store.set_page_ocr_ref(version_id, page_number, &ocr_ref)?;
        Ok(ocr_ref)
    }
}

impl StageWorker for OcrWorker {
    type Task = OcrTask;

    fn process(&self, task: &OcrTask, attempt: Attempt) -> Result<Option<String>, WorkerError> {
        let force = attempt == Attempt::Redelivery;
        match task {
            OcrTask::Streaming {
                job_id,
                page_number,
                ..
            } => {
                let job = self.store.job(job_id)?;
                let pair = self.store.job_page(job_id, *page_number)?;
                let refs = self.ocr_pair(&job, &pair, force)?;
                Ok(Some(serde_json::to_string(&refs)?))
            }
            OcrTask::Legacy { job_id, .. } => {
                let job = self.store.job(job_id)?;
                let mut report = BatchReport::new();
                for pair in self.store.job_pages(job_id)? {
                    match self.ocr_pair(&job, &pair, force) {
                        Ok(_) => report.record_ok(),
                        Err(e) => report.record_err(pair.page_number, &e),
                    }
                }
                report.finish(&self.store, &StageKey::job_level(job_id, StageKind::Ocr))?;
                Ok(None)
            }
        }
    }
}
