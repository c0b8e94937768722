//! End-to-end runs of the OCR -> Diff -> Summary pipeline in both modes.
//!
//! Each case seeds two versions of a small drawing set (the newer one
//! re-plotted with a slight misregistration and its sheets reordered),
//! runs a job to completion and checks the persisted outcome.

mod common;

use std::time::Duration;

use sheetdiff::config::PipelineMode;
use sheetdiff::pipeline::{JobStatus, StageKind, StageStatus};
use sheetdiff::{ObjectStore, Services, StageEvent, StageEventBroadcaster};

use common::{about_center, drawing_sheet, png, rescanned, with_added_block, ConfigBuilder, TestHarness};

/// A single pipeline scenario.
struct PipelineCase {
    name: &'static str,
    mode: PipelineMode,
    /// Drawing names of the older set, in page order.
    old_names: &'static [&'static str],
    /// Drawing names of the newer set, in page order.
    new_names: &'static [&'static str],
    /// Expected stage rows once the job exists.
    expected_stages: usize,
}

const PIPELINE_CASES: &[PipelineCase] = &[
    PipelineCase {
        name: "streaming_reordered_pair",
        mode: PipelineMode::Streaming,
        old_names: &["A-101", "A-102"],
        new_names: &["A-102", "A-101"],
        // parent summary + 3 stages per page
        expected_stages: 7,
    },
    PipelineCase {
        name: "streaming_single_sheet",
        mode: PipelineMode::Streaming,
        old_names: &["S-201"],
        new_names: &["S-201"],
        expected_stages: 4,
    },
    PipelineCase {
        name: "legacy_reordered_pair",
        mode: PipelineMode::Legacy,
        old_names: &["A-101", "A-102"],
        new_names: &["A-102", "A-101"],
        expected_stages: 3,
    },
];

fn seed_from_name(name: &str) -> u64 {
    name.bytes().map(u64::from).sum()
}

fn run_case(case: &PipelineCase) {
    let harness = TestHarness::new(ConfigBuilder::new().mode(case.mode).build());
    let shift = about_center(1.01, 0.8, 800, 600);

    let old_sheets: Vec<_> = case
        .old_names
        .iter()
        .map(|n| drawing_sheet(800, 600, seed_from_name(n)))
        .collect();
    let new_sheets: Vec<_> = case
        .new_names
        .iter()
        .map(|n| rescanned(&drawing_sheet(800, 600, seed_from_name(n)), &shift))
        .collect();
    let old: Vec<_> = case.old_names.iter().copied().zip(old_sheets.iter()).collect();
    let new: Vec<_> = case.new_names.iter().copied().zip(new_sheets.iter()).collect();
    harness.seed_version("v-old", &old);
    harness.seed_version("v-new", &new);

    let job = harness.compare("v-old", "v-new", case.mode);
    assert_eq!(job.total_pages as usize, case.new_names.len(), "Case '{}'", case.name);
    assert_eq!(harness.report(&job.id).stages.len(), case.expected_stages, "Case '{}'", case.name);

    let job = harness.finish(&job.id);
    assert_eq!(job.status, JobStatus::Completed, "Case '{}': {:?}", case.name, job.error_message);

    let report = harness.report(&job.id);
    assert!(
        report.stages.iter().all(|s| s.status == StageStatus::Completed),
        "Case '{}': unfinished stages {:?}",
        case.name,
        report
            .stages
            .iter()
            .filter(|s| s.status != StageStatus::Completed)
            .map(|s| s.key().to_string())
            .collect::<Vec<_>>()
    );

    let diffs = harness.current_diffs(&job.id);
    assert_eq!(diffs.len(), case.new_names.len(), "Case '{}'", case.name);
    for diff in &diffs {
        let pair = harness.runtime.store().job_page(&job.id, diff.page_number).unwrap();
        assert_eq!(diff.drawing_name, pair.drawing_name, "Case '{}'", case.name);
        assert_eq!(
            case.old_names[pair.old_page_number as usize - 1],
            case.new_names[pair.new_page_number as usize - 1],
            "Case '{}': sheets paired across different drawings",
            case.name
        );
        assert!(
            diff.overlap_pixels > diff.added_pixels + diff.removed_pixels,
            "Case '{}': page {} mostly classified as changed",
            case.name,
            diff.page_number
        );
        let summary = harness.runtime.store().active_summary(&diff.id).unwrap();
        assert!(summary.is_some(), "Case '{}': page {} has no summary", case.name, diff.page_number);
        assert!(harness.objects.get(&diff.overlay_ref).is_ok());
    }

    for page in harness.runtime.store().pages_of_version("v-new").unwrap() {
        assert!(page.ocr_ref.is_some(), "Case '{}': new page {} not OCRed", case.name, page.page_number);
    }

    harness.shutdown();
}

#[test]
fn test_pipeline_cases() {
    for case in PIPELINE_CASES {
        run_case(case);
    }
}

#[test]
fn test_ingested_rasters_are_compared() {
    let harness = TestHarness::new(ConfigBuilder::new().build());
    let sheet = drawing_sheet(800, 600, 42);
    let revised = with_added_block(&rescanned(&sheet, &about_center(1.0, 0.5, 800, 600)), 380, 260, 60);

    let old = harness.runtime.ingest("v-1", &png(&sheet), "M-401.png").unwrap();
    let new = harness.runtime.ingest("v-2", &png(&revised), "M-401.png").unwrap();
    assert_eq!(old.len(), 1);
    assert_eq!(new[0].drawing_name, "M-401");
    assert_eq!(new[0].source_name.as_deref(), Some("M-401.png"));

    let job = harness.compare("v-1", "v-2", PipelineMode::Streaming);
    let job = harness.finish(&job.id);
    assert_eq!(job.status, JobStatus::Completed);

    let diffs = harness.current_diffs(&job.id);
    assert_eq!(diffs.len(), 1);
    assert!(diffs[0].added_pixels > 0, "the added block must show as new ink");
    assert!(diffs[0].change_count >= 1);
    harness.shutdown();
}

#[test]
fn test_events_follow_the_job() {
    let events = StageEventBroadcaster::new(1024);
    let mut rx = events.subscribe();
    let harness = TestHarness::with_services(ConfigBuilder::new().build(), Services::offline(), Some(events));

    let sheet = drawing_sheet(640, 480, 7);
    harness.seed_version("v-old", &[("E-501", &sheet)]);
    harness.seed_version("v-new", &[("E-501", &sheet)]);
    let job = harness.compare("v-old", "v-new", PipelineMode::Streaming);
    harness.finish(&job.id);

    let mut received: Vec<StageEvent> = Vec::new();
    while let Ok(event) = rx.try_recv() {
        received.push(event);
    }
    assert!(received.iter().all(|e| e.job_id == job.id));

    let stage_completions = received
        .iter()
        .filter(|e| {
            matches!(
                e.kind,
                sheetdiff::broadcast::StageEventKind::Stage {
                    status: StageStatus::Completed,
                    ..
                }
            )
        })
        .count();
    assert!(stage_completions >= StageKind::ALL.len());

    let last_job_event = received
        .iter()
        .rev()
        .find_map(|e| match e.kind {
            sheetdiff::broadcast::StageEventKind::Job { status } => Some(status),
            _ => None,
        });
    assert_eq!(last_job_event, Some(JobStatus::Completed));
    harness.shutdown();
}

#[test]
fn test_empty_version_pair_completes_immediately() {
    let harness = TestHarness::new(ConfigBuilder::new().build());
    let job = harness.compare("v-none", "v-nothing", PipelineMode::Streaming);
    let job = harness.runtime.wait_for_job(&job.id, Duration::from_secs(5)).unwrap();
    assert_eq!(job.total_pages, 0);
    assert!(job.status.is_terminal());
    harness.shutdown();
}
