use std::sync::Arc;

use chrono::Utc;
use log::debug;

use crate::error::WorkerError;
use crate::pipeline::model::{ChangeSummary, DiffResult, StageKey, StageKind};
use crate::pipeline::store::{Attempt, StageStore};
use crate::pipeline::tasks::SummaryTask;
use crate::services::prompts::summary_prompt;
use crate::services::{DiffMetadata, OcrDocument, SummaryService};
use crate::storage::{ObjectRef, ObjectStore};
use crate::worker::runner::{BatchReport, StageWorker};

/// Turns a diff overlay and its metrics into a change summary.
pub struct SummaryWorker {
    store: StageStore,
    objects: Arc<dyn ObjectStore>,
    summarizer: Arc<dyn SummaryService>,
}

impl SummaryWorker {
    pub fn new(
        store: StageStore,
        objects: Arc<dyn ObjectStore>,
        summarizer: Arc<dyn SummaryService>,
    ) -> Self {
        Self {
            store,
            objects,
            summarizer,
        }
    }

    /// Summarizes a diff result again and makes the new summary the active
    /// one. An active manual overlay is summarized instead of the
    /// generated overlay.
    pub fn regenerate(&self, diff_result_id: &str) -> Result<ChangeSummary, WorkerError> {
        let diff = self
            .store
            .diff_result(diff_result_id)?
            .ok_or_else(|| WorkerError::MissingRecord(format!("diff result {}", diff_result_id)))?;
        let overlay_ref = match self.store.active_manual_overlay(&diff.id)? {
            Some(manual) => manual.overlay_ref,
            None => diff.overlay_ref.clone(),
        };
        self.summarize(&diff, &overlay_ref)
    }

    fn summarize(&self, diff: &DiffResult, overlay_ref: &ObjectRef) -> Result<ChangeSummary, WorkerError> {
        let _span = tracing::info_span!("summary.diff", diff_result_id = %diff.id).entered();
        let overlay = self.objects.get(overlay_ref)?;
        let (old_text, new_text) = self.sheet_text(diff);
        let metadata = DiffMetadata {
            drawing_name: diff.drawing_name.clone(),
            page_number: diff.page_number,
            change_count: diff.change_count,
            added_pixels: diff.added_pixels,
            removed_pixels: diff.removed_pixels,
            overlap_pixels: diff.overlap_pixels,
            alignment_score: diff.alignment_score,
            composite_mode: diff.composite_mode.as_str().to_string(),
            old_text,
            new_text,
        };

        let content = self
            .summarizer
            .summarize(&overlay, &metadata, &summary_prompt(&metadata))?;
        let summary = ChangeSummary {
            id: uuid::Uuid::new_v4().to_string(),
            diff_result_id: diff.id.clone(),
            changes: content.changes,
            critical_change: content.critical_change,
            recommendations: content.recommendations,
            is_active: true,
            created_at: Utc::now(),
        };
        self.store.activate_summary(&summary)?;
        Ok(summary)
    }

    /// OCR text of both sheets, when the OCR stage produced any. Missing or
    /// unreadable text only makes the summary less specific.
    fn sheet_text(&self, diff: &DiffResult) -> (Option<OcrDocument>, Option<OcrDocument>) {
        let lookup = || -> Result<_, WorkerError> {
            let job = self.store.job(&diff.job_id)?;
            let pair = self.store.job_page(&diff.job_id, diff.page_number)?;
            let old = self.store.page(&job.old_version_id, pair.old_page_number)?;
            let new = self.store.page(&job.new_version_id, pair.new_page_number)?;
            Ok((self.load_ocr(old.ocr_ref.as_ref()), self.load_ocr(new.ocr_ref.as_ref())))
        };
        lookup().unwrap_or_else(|e| {
            debug!("No sheet text for diff {}: {}", diff.id, e);
            (None, None)
        })
    }

    fn load_ocr(&self, ocr_ref: Option<&ObjectRef>) -> Option<OcrDocument> {
        let bytes = self.objects.get(ocr_ref?).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

impl StageWorker for SummaryWorker {
    type Task = SummaryTask;

    fn process(&self, task: &SummaryTask, _attempt: Attempt) -> Result<Option<String>, WorkerError> {
        match task {
            SummaryTask::Streaming {
                job_id,
                page_number,
                diff_result_id,
                overlay_ref,
                ..
            } => {
                let diff = self
                    .store
                    .diff_result(diff_result_id)?
                    .ok_or_else(|| WorkerError::MissingRecord(format!("diff result {}", diff_result_id)))?;
                // A diff corrected after this task was queued is summarized
                // in its current form.
                let summary = match diff.superseded_by {
                    Some(_) => {
                        let current = self.store.current_diff(job_id, *page_number)?.ok_or_else(|| {
                            WorkerError::MissingRecord(format!("current diff of {} page {}", job_id, page_number))
                        })?;
                        debug!("Diff {} was superseded by {}", diff.id, current.id);
                        self.summarize(&current, &current.overlay_ref)?
                    }
                    None => self.summarize(&diff, overlay_ref)?,
                };
                Ok(Some(summary.id))
            }
            SummaryTask::Legacy { job_id, .. } => {
                let mut report = BatchReport::new();
                for diff in self.store.current_diffs(job_id)? {
                    match self.summarize(&diff, &diff.overlay_ref) {
                        Ok(_) => report.record_ok(),
                        Err(e) => report.record_err(diff.page_number, &e),
                    }
                }
                report.finish(&self.store, &StageKey::job_level(job_id, StageKind::Summary))?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::diff_repo::tests::sample_result;
    use crate::imaging::codec::encode_png;
    use crate::pipeline::overlays::set_manual_overlay;
    use crate::services::{OfflineServices, ServiceError, SummaryContent};
    use crate::worker::tests::{streaming_store, Fixture};
    use image::{Rgba, RgbaImage};
    use std::sync::Mutex;

    /// Records the overlay bytes it was shown.
    #[derive(Default)]
    struct Recording {
        overlays: Mutex<Vec<Vec<u8>>>,
    }

    impl SummaryService for Recording {
        fn summarize(
            &self,
            overlay_png: &[u8],
            metadata: &DiffMetadata,
            prompt: &str,
        ) -> Result<SummaryContent, ServiceError> {
            self.overlays.lock().unwrap().push(overlay_png.to_vec());
            OfflineServices.summarize(overlay_png, metadata, prompt)
        }
    }

    fn png(color: [u8; 4]) -> Vec<u8> {
        encode_png(&RgbaImage::from_pixel(8, 8, Rgba(color))).unwrap()
    }

    fn with_diff(f: &Fixture) -> DiffResult {
        let diff = sample_result("d1", &f.job_id, 1);
        f.objects.put(diff.overlay_ref.as_str(), &png([0, 255, 0, 255])).unwrap();
        f.store.record_diff_result(&diff).unwrap();
        diff
    }

    #[test]
    fn test_regenerations_keep_one_active_summary() {
        let f = streaming_store(1);
        with_diff(&f);
        let worker = SummaryWorker::new(f.store.clone(), f.objects.clone(), Arc::new(OfflineServices));

        let task = SummaryTask::Streaming {
            job_id: f.job_id.clone(),
            page_number: 1,
            diff_result_id: "d1".to_string(),
            overlay_ref: f.store.diff_result("d1").unwrap().unwrap().overlay_ref,
            metadata: Default::default(),
        };
        worker.process(&task, Attempt::Fresh).unwrap();
        let mut last = String::new();
        for _ in 0..3 {
            last = worker.regenerate("d1").unwrap().id;
        }

        let history = f.store.summary_history("d1").unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.iter().filter(|s| s.is_active).count(), 1);
        assert_eq!(f.store.active_summary("d1").unwrap().unwrap().id, last);
    }

    #[test]
    fn test_regenerate_prefers_manual_overlay() {
        let f = streaming_store(1);
        with_diff(&f);
        let manual = png([255, 0, 0, 255]);
        set_manual_overlay(&f.store, f.objects.as_ref(), "d1", &manual, "reviewer").unwrap();

        let recording = Arc::new(Recording::default());
        let worker = SummaryWorker::new(f.store.clone(), f.objects.clone(), recording.clone());
        worker.regenerate("d1").unwrap();
        assert_eq!(recording.overlays.lock().unwrap()[0], manual);
    }

    #[test]
    fn test_unknown_diff() {
        let f = streaming_store(1);
        let worker = SummaryWorker::new(f.store.clone(), f.objects.clone(), Arc::new(OfflineServices));
        assert!(matches!(worker.regenerate("nope"), Err(WorkerError::MissingRecord(_))));
    }
}
