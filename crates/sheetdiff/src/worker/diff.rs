use std::sync::Arc;

use chrono::Utc;
use log::info;

use crate::error::WorkerError;
use crate::imaging::codec::{decode, encode_png};
use crate::imaging::{FeatureAligner, OverlayCompositor};
use crate::pipeline::model::{DiffResult, StageKey, StageKind};
use crate::pipeline::store::{Attempt, StageStore};
use crate::pipeline::tasks::DiffTask;
use crate::storage::{ObjectRef, ObjectStore};
use crate::worker::runner::{BatchReport, StageWorker};

/// Aligns each old sheet onto its new revision and stores the overlay.
pub struct DiffWorker {
    store: StageStore,
    objects: Arc<dyn ObjectStore>,
    aligner: FeatureAligner,
    compositor: OverlayCompositor,
}

impl DiffWorker {
    pub fn new(
        store: StageStore,
        objects: Arc<dyn ObjectStore>,
        aligner: FeatureAligner,
        compositor: OverlayCompositor,
    ) -> Self {
        Self {
            store,
            objects,
            aligner,
            compositor,
        }
    }

    /// Diffs one page pair and records the result as the page's current
    /// diff, superseding any earlier run.
    pub fn diff_page(
        &self,
        job_id: &str,
        page_number: u32,
        drawing_name: &str,
        old_ref: &ObjectRef,
        new_ref: &ObjectRef,
    ) -> Result<DiffResult, WorkerError> {
        let _span = tracing::info_span!("diff.page", job_id, page_number).entered();
        let old = decode(&self.objects.get(old_ref)?)?;
        let new = decode(&self.objects.get(new_ref)?)?;

        let alignment = self.aligner.align_with_report(&old, &new)?;
        let output = self.compositor.composite(&alignment.image, &new)?;

        let id = uuid::Uuid::new_v4().to_string();
        let prefix = format!("jobs/{}/pages/{}/{}", job_id, page_number, id);
        let overlay_ref = self
            .objects
            .put(&format!("{}/overlay.png", prefix), &encode_png(&output.image)?)?;
        let baseline_ref = self
            .objects
            .put(&format!("{}/baseline.png", prefix), &encode_png(&alignment.image)?)?;
        let revised_ref = self
            .objects
            .put(&format!("{}/revised.png", prefix), &encode_png(&new)?)?;

        let result = DiffResult {
            id,
            job_id: job_id.to_string(),
            page_number,
            drawing_name: drawing_name.to_string(),
            change_count: output.stats.change_count,
            alignment_score: alignment.report.score,
            added_pixels: output.stats.added_pixels,
            removed_pixels: output.stats.removed_pixels,
            overlap_pixels: output.stats.overlap_pixels,
            overlay_ref,
            baseline_ref,
            revised_ref,
            composite_mode: output.stats.mode,
            alignment_report: Some(serde_json::to_value(&alignment.report)?),
            superseded_by: None,
            created_at: Utc::now(),
        };
        if let Some(previous) = self.store.record_diff_result(&result)? {
            info!("Diff {} supersedes {}", result.id, previous);
        }
        tracing::info!(
            changes = result.change_count,
            score = result.alignment_score,
            mode = result.composite_mode.as_str(),
            "Page diffed"
        );
        Ok(result)
    }
}

impl StageWorker for DiffWorker {
    type Task = DiffTask;

    fn process(&self, task: &DiffTask, _attempt: Attempt) -> Result<Option<String>, WorkerError> {
        match task {
            DiffTask::Streaming {
                job_id,
                page_number,
                old_ref,
                new_ref,
                drawing_name,
                ..
            } => {
                let result = self.diff_page(job_id, *page_number, drawing_name, old_ref, new_ref)?;
                Ok(Some(result.id))
            }
            DiffTask::Legacy { job_id, .. } => {
                let job = self.store.job(job_id)?;
                let mut report = BatchReport::new();
                let mut ids = Vec::new();
                for pair in self.store.job_pages(job_id)? {
                    let outcome = self
                        .store
                        .page(&job.old_version_id, pair.old_page_number)
                        .and_then(|old| {
                            let new = self.store.page(&job.new_version_id, pair.new_page_number)?;
                            Ok((old.image_ref, new.image_ref))
                        })
                        .map_err(WorkerError::from)
                        .and_then(|(old_ref, new_ref)| {
                            self.diff_page(job_id, pair.page_number, &pair.drawing_name, &old_ref, &new_ref)
                        });
                    match outcome {
                        Ok(result) => {
                            report.record_ok();
                            ids.push(result.id);
                        }
                        Err(e) => report.record_err(pair.page_number, &e),
                    }
                }
                report.finish(&self.store, &StageKey::job_level(job_id, StageKind::Diff))?;
                Ok(Some(serde_json::to_string(&ids)?))
            }
        }
    }
}
