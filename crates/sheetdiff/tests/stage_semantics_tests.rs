//! Stage state-machine behaviour observed through the running pipeline:
//! redelivery, regeneration, manual overlays, cancellation and retry
//! exhaustion.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use sheetdiff::config::PipelineMode;
use sheetdiff::pipeline::{FanIn, JobStatus, StageKey, StageKind, StageStatus};
use sheetdiff::services::{OcrDocument, OfflineServices, ServiceError, VisionService};
use sheetdiff::{ObjectStore, Services};

use common::{about_center, drawing_sheet, png, rescanned, ConfigBuilder, TestHarness};

/// Seeds `names.len()` sheet pairs and runs a job of `mode`.
fn seeded(harness: &TestHarness, names: &[&str], mode: PipelineMode) -> String {
    let shift = about_center(1.005, 0.4, 640, 480);
    let old: Vec<_> = (0..names.len()).map(|i| drawing_sheet(640, 480, 100 + i as u64)).collect();
    let new: Vec<_> = old.iter().map(|s| rescanned(s, &shift)).collect();
    harness.seed_version("v-old", &names.iter().copied().zip(old.iter()).collect::<Vec<_>>());
    harness.seed_version("v-new", &names.iter().copied().zip(new.iter()).collect::<Vec<_>>());
    harness.compare("v-old", "v-new", mode).id
}

#[test]
fn test_diff_redelivery_supersedes_and_resummarizes() {
    let harness = TestHarness::new(ConfigBuilder::new().build());
    let job_id = seeded(&harness, &["A-101"], PipelineMode::Streaming);
    harness.finish(&job_id);

    let key = StageKey::page(&job_id, StageKind::Diff, 1);
    let first = harness.runtime.store().current_diff(&job_id, 1).unwrap().unwrap();
    harness.runtime.orchestrator().publish_stage(&key).unwrap();
    harness.settle();

    let stage = harness.stage(&key);
    assert_eq!(stage.status, StageStatus::Completed);
    assert_eq!(stage.retry_count, 1);

    let history = harness.runtime.store().diff_history(&job_id, 1).unwrap();
    assert_eq!(history.len(), 2);
    let current: Vec<_> = history.iter().filter(|d| d.superseded_by.is_none()).collect();
    assert_eq!(current.len(), 1);
    assert_ne!(current[0].id, first.id);
    assert_eq!(stage.result_ref.as_deref(), Some(current[0].id.as_str()));

    let summary_key = StageKey::page(&job_id, StageKind::Summary, 1);
    let summary_stage = harness.stage(&summary_key);
    assert_eq!(summary_stage.status, StageStatus::Completed);
    assert_eq!(summary_stage.retry_count, 1);

    let store = harness.runtime.store();
    let active = store.active_summary(&current[0].id).unwrap().expect("corrected diff has a summary");
    assert_eq!(summary_stage.result_ref.as_deref(), Some(active.id.as_str()));
    assert!(store.active_summary(&first.id).unwrap().is_some());
    assert_eq!(store.job(&job_id).unwrap().status, JobStatus::Completed);
    harness.shutdown();
}

#[test]
fn test_repeated_regeneration_keeps_newest_summary_active() {
    let harness = TestHarness::new(ConfigBuilder::new().build());
    let job_id = seeded(&harness, &["A-101", "A-102"], PipelineMode::Streaming);
    harness.finish(&job_id);

    let diff = harness.current_diffs(&job_id).remove(0);
    let mut newest = None;
    for _ in 0..4 {
        newest = Some(harness.runtime.regenerate_summary(&diff.id).unwrap().id);
    }

    let history = harness.runtime.store().summary_history(&diff.id).unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history.iter().filter(|s| s.is_active).count(), 1);
    let active = harness.runtime.store().active_summary(&diff.id).unwrap().unwrap();
    assert_eq!(Some(active.id), newest);
    harness.shutdown();
}

#[test]
fn test_manual_overlay_lifecycle() {
    let harness = TestHarness::new(ConfigBuilder::new().build());
    let job_id = seeded(&harness, &["A-101"], PipelineMode::Streaming);
    harness.finish(&job_id);
    let diff = harness.current_diffs(&job_id).remove(0);

    let edited = png(&drawing_sheet(320, 240, 9));
    let first = harness.runtime.set_manual_overlay(&diff.id, &edited, "reviewer").unwrap();
    let second = harness.runtime.set_manual_overlay(&diff.id, &edited, "lead").unwrap();
    assert_ne!(first.id, second.id);
    let active = harness.runtime.store().active_manual_overlay(&diff.id).unwrap().unwrap();
    assert_eq!(active.id, second.id);
    assert_eq!(harness.objects.get(&active.overlay_ref).unwrap(), edited);

    harness.runtime.regenerate_summary(&diff.id).unwrap();

    assert!(harness.runtime.clear_manual_overlay(&diff.id).unwrap());
    assert!(!harness.runtime.clear_manual_overlay(&diff.id).unwrap());
    assert!(harness.runtime.store().active_manual_overlay(&diff.id).unwrap().is_none());

    assert!(harness.runtime.set_manual_overlay(&diff.id, b"not a png", "reviewer").is_err());
    assert!(harness.runtime.set_manual_overlay("missing", &edited, "reviewer").is_err());
    harness.shutdown();
}

/// Blocks every OCR call until the test releases it.
struct GatedVision {
    entered: Sender<()>,
    release: Receiver<()>,
}

impl VisionService for GatedVision {
    fn extract(&self, image_png: &[u8], prompt: &str) -> Result<OcrDocument, ServiceError> {
        let _ = self.entered.try_send(());
        // Disconnection is the release signal.
        let _ = self.release.recv();
        OfflineServices.extract(image_png, prompt)
    }
}

#[test]
fn test_cancellation_skips_pending_stages_only() {
    let (entered_tx, entered_rx) = bounded(8);
    let (release_tx, release_rx) = bounded::<()>(0);
    let services = Services {
        vision: Arc::new(GatedVision {
            entered: entered_tx,
            release: release_rx,
        }),
        summarizer: Arc::new(OfflineServices),
    };
    let config = ConfigBuilder::new().ocr_concurrency(1).build();
    let harness = TestHarness::with_services(config, services, None);
    let job_id = seeded(&harness, &["A-101", "A-102"], PipelineMode::Streaming);

    entered_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("OCR never started");
    let running: Vec<_> = harness
        .stages_with(&job_id, StageStatus::InProgress)
        .into_iter()
        .map(|s| s.key())
        .collect();
    assert_eq!(running.len(), 1);

    assert!(harness.runtime.orchestrator().cancel_job(&job_id).unwrap());
    assert!(!harness.runtime.orchestrator().cancel_job(&job_id).unwrap());
    drop(release_tx);
    harness.settle();

    let report = harness.report(&job_id);
    assert_eq!(report.job.status, JobStatus::Cancelled);
    for stage in &report.stages {
        if stage.key() == running[0] {
            assert_ne!(stage.status, StageStatus::Skipped);
        } else {
            assert_eq!(stage.status, StageStatus::Skipped, "{} was not skipped", stage.key());
        }
    }
    assert!(harness.current_diffs(&job_id).is_empty());
    harness.shutdown();
}

/// Fails every call and counts them.
#[derive(Default)]
struct UnavailableVision {
    calls: AtomicUsize,
}

impl VisionService for UnavailableVision {
    fn extract(&self, _image_png: &[u8], _prompt: &str) -> Result<OcrDocument, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ServiceError::Http("connection refused".to_string()))
    }
}

struct ExhaustionCase {
    name: &'static str,
    mode: PipelineMode,
    pages: &'static [&'static str],
    /// OCR stage rows expected to give up.
    exhausted: usize,
}

const EXHAUSTION_CASES: &[ExhaustionCase] = &[
    ExhaustionCase {
        name: "streaming_every_page_fails",
        mode: PipelineMode::Streaming,
        pages: &["A-101", "A-102"],
        exhausted: 2,
    },
    ExhaustionCase {
        name: "legacy_batch_fails",
        mode: PipelineMode::Legacy,
        pages: &["A-101", "A-102"],
        exhausted: 1,
    },
];

#[test]
fn test_exhausted_retries_fail_the_job() {
    for case in EXHAUSTION_CASES {
        let vision = Arc::new(UnavailableVision::default());
        let services = Services {
            vision: vision.clone(),
            summarizer: Arc::new(OfflineServices),
        };
        let config = ConfigBuilder::new().mode(case.mode).max_retries(2).build();
        let harness = TestHarness::with_services(config, services, None);
        let job_id = seeded(&harness, case.pages, case.mode);

        let job = harness.finish(&job_id);
        assert_eq!(job.status, JobStatus::Failed, "Case '{}'", case.name);
        assert!(job.error_message.is_some(), "Case '{}'", case.name);

        let report = harness.report(&job_id);
        let exhausted: Vec<_> = report.stages.iter().filter(|s| s.exhausted).collect();
        assert_eq!(exhausted.len(), case.exhausted, "Case '{}'", case.name);
        for stage in &exhausted {
            assert_eq!(stage.stage, StageKind::Ocr, "Case '{}'", case.name);
            assert_eq!(stage.status, StageStatus::Failed, "Case '{}'", case.name);
            assert_eq!(stage.retry_count, 2, "Case '{}'", case.name);
            assert!(stage.error_message.is_some(), "Case '{}'", case.name);
        }
        assert!(
            report
                .stages
                .iter()
                .filter(|s| s.stage == StageKind::Diff)
                .all(|s| s.status == StageStatus::Skipped),
            "Case '{}': diff stages must be skipped",
            case.name
        );
        assert!(vision.calls.load(Ordering::SeqCst) >= 2, "Case '{}'", case.name);
        harness.shutdown();
    }
}

/// Fails on the `failing` sheets and holds calls for the `gated` ones until
/// the test drops the release sender.
struct SelectiveVision {
    failing: Vec<Vec<u8>>,
    gated: Vec<Vec<u8>>,
    entered: Sender<()>,
    release: Receiver<()>,
}

impl VisionService for SelectiveVision {
    fn extract(&self, image_png: &[u8], prompt: &str) -> Result<OcrDocument, ServiceError> {
        if self.failing.iter().any(|p| p == image_png) {
            return Err(ServiceError::Http("connection reset".to_string()));
        }
        if self.gated.iter().any(|p| p == image_png) {
            let _ = self.entered.try_send(());
            let _ = self.release.recv();
        }
        OfflineServices.extract(image_png, prompt)
    }
}

#[test]
fn test_duplicate_delivery_after_exhaustion_leaves_fan_in_alone() {
    let shift = about_center(1.005, 0.4, 640, 480);
    let old = [drawing_sheet(640, 480, 300), drawing_sheet(640, 480, 301)];
    let new = [rescanned(&old[0], &shift), rescanned(&old[1], &shift)];

    let (entered_tx, entered_rx) = bounded(8);
    let (release_tx, release_rx) = bounded::<()>(0);
    let services = Services {
        vision: Arc::new(SelectiveVision {
            failing: vec![png(&old[0]), png(&new[0])],
            gated: vec![png(&old[1]), png(&new[1])],
            entered: entered_tx,
            release: release_rx,
        }),
        summarizer: Arc::new(OfflineServices),
    };
    let config = ConfigBuilder::new().ocr_concurrency(2).max_retries(2).build();
    let harness = TestHarness::with_services(config, services, None);
    harness.seed_version("v-old", &[("A-101", &old[0]), ("A-102", &old[1])]);
    harness.seed_version("v-new", &[("A-101", &new[0]), ("A-102", &new[1])]);
    let job_id = harness.compare("v-old", "v-new", PipelineMode::Streaming).id;

    let exhausted = StageKey::page(&job_id, StageKind::Ocr, 1);
    entered_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("second page OCR never started");
    harness.wait_until("first page OCR to give up", || harness.stage(&exhausted).exhausted);
    harness.wait_until("only the held OCR to remain", || harness.runtime.bus().outstanding() == 1);

    harness.runtime.orchestrator().publish_stage(&exhausted).unwrap();
    harness.wait_until("the duplicate to be acknowledged", || {
        harness.runtime.bus().outstanding() == 1
    });

    let parent = StageKey::job_level(&job_id, StageKind::Summary);
    let stage = harness.stage(&exhausted);
    assert_eq!(stage.status, StageStatus::Failed);
    assert_eq!(stage.retry_count, 2);
    assert_eq!(harness.runtime.store().job(&job_id).unwrap().status, JobStatus::InProgress);
    assert_eq!(
        harness.stage(&StageKey::page(&job_id, StageKind::Ocr, 2)).status,
        StageStatus::InProgress
    );
    assert_eq!(
        harness.stage(&parent).fan_in,
        Some(FanIn {
            expected: 2,
            completed: 0,
            failed: 1
        })
    );

    drop(release_tx);
    let job = harness.finish(&job_id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        harness.stage(&parent).fan_in,
        Some(FanIn {
            expected: 2,
            completed: 1,
            failed: 1
        })
    );
    for stage in [StageKind::Diff, StageKind::Summary] {
        assert_eq!(
            harness.stage(&StageKey::page(&job_id, stage, 1)).status,
            StageStatus::Skipped
        );
    }
    let diffs = harness.current_diffs(&job_id);
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].drawing_name, "A-102");
    harness.shutdown();
}
