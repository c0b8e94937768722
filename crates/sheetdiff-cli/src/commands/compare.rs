use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use clap::Args;
use log::{info, warn};
use serde::Serialize;

use sheetdiff::pipeline::{ChangeSummary, Job, JobReport};
use sheetdiff::{Config, NewJob, PipelineMode, Runtime, Services, StageEventBroadcaster};

use super::{print_json, read_input};

const WAIT_SLICE: Duration = Duration::from_millis(250);

#[derive(Args)]
pub struct CompareCommand {
    /// Older drawing set
    pub old: PathBuf,

    /// Newer drawing set
    pub new: PathBuf,

    /// Project the job is filed under
    #[arg(long, default_value = "default")]
    pub project: String,

    /// Stage layout; defaults to the configured mode
    #[arg(long, value_parser = parse_mode)]
    pub mode: Option<PipelineMode>,

    /// Give up waiting after this many seconds (the job keeps its state)
    #[arg(long, default_value_t = 600)]
    pub timeout_secs: u64,

    /// Write each page's overlay PNG into this directory
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Print stage transitions to stderr as they happen
    #[arg(long)]
    pub follow: bool,
}

fn parse_mode(s: &str) -> Result<PipelineMode, String> {
    PipelineMode::parse(s).ok_or_else(|| format!("unknown mode '{}' (expected legacy or streaming)", s))
}

#[derive(Serialize)]
struct PageOutcome {
    page_number: u32,
    drawing_name: String,
    diff_result_id: String,
    change_count: u32,
    alignment_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    overlay_file: Option<PathBuf>,
    summary: Option<ChangeSummary>,
}

#[derive(Serialize)]
struct CompareOutput {
    job: Job,
    pages: Vec<PageOutcome>,
    failed_stages: usize,
}

impl CompareCommand {
    pub fn execute(&self, config: &Config) -> Result<()> {
        let events = StageEventBroadcaster::default();
        if self.follow {
            follow_events(&events);
        }
        let runtime = Runtime::open(config, Services::from_config(config)?, Some(events))?;

        let result = self.run(&runtime, config);
        runtime.shutdown();
        result
    }

    fn run(&self, runtime: &Runtime, config: &Config) -> Result<()> {
        let old_version = format!("v-{}", uuid::Uuid::new_v4());
        let new_version = format!("v-{}", uuid::Uuid::new_v4());
        self.ingest(runtime, &old_version, &self.old)?;
        self.ingest(runtime, &new_version, &self.new)?;

        let job = runtime.compare(&NewJob {
            project_id: self.project.clone(),
            old_version_id: old_version,
            new_version_id: new_version,
            mode: self.mode.unwrap_or(config.mode),
        })?;
        info!("Started job {} with {} paired sheet(s)", job.id, job.total_pages);

        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .context("Failed to install Ctrl-C handler")?;

        let job = self.wait(runtime, &job.id, &interrupted)?;
        let report = runtime.orchestrator().job_report(&job.id)?;
        let pages = self.collect_pages(runtime, &report)?;
        print_json(&CompareOutput {
            failed_stages: report.stages.iter().filter(|s| s.exhausted).count(),
            job: report.job,
            pages,
        })
    }

    fn ingest(&self, runtime: &Runtime, version_id: &str, path: &Path) -> Result<()> {
        let (bytes, filename) = read_input(path)?;
        let pages = runtime
            .ingest(version_id, &bytes, &filename)
            .with_context(|| format!("Failed to ingest {}", path.display()))?;
        info!("Ingested {} page(s) from {}", pages.len(), filename);
        Ok(())
    }

    fn wait(&self, runtime: &Runtime, job_id: &str, interrupted: &AtomicBool) -> Result<Job> {
        let deadline = Instant::now() + Duration::from_secs(self.timeout_secs);
        loop {
            let job = runtime.wait_for_job(job_id, WAIT_SLICE)?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            if interrupted.load(Ordering::SeqCst) {
                warn!("Interrupted, cancelling job {}", job_id);
                runtime.orchestrator().cancel_job(job_id)?;
                return Ok(runtime.store().job(job_id)?);
            }
            if Instant::now() >= deadline {
                bail!(
                    "Job {} still {} after {}s; check it later with `sheetdiff status {}`",
                    job_id,
                    job.status,
                    self.timeout_secs,
                    job_id
                );
            }
        }
    }

    fn collect_pages(&self, runtime: &Runtime, report: &JobReport) -> Result<Vec<PageOutcome>> {
        if let Some(dir) = &self.export {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let mut pages = Vec::new();
        for diff in runtime.store().current_diffs(&report.job.id)? {
            let overlay_file = match &self.export {
                Some(dir) => {
                    let path = dir.join(format!("{:03}-{}.png", diff.page_number, file_safe(&diff.drawing_name)));
                    fs::write(&path, runtime.objects().get(&diff.overlay_ref)?)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    Some(path)
                }
                None => None,
            };
            pages.push(PageOutcome {
                page_number: diff.page_number,
                drawing_name: diff.drawing_name.clone(),
                summary: runtime.store().active_summary(&diff.id)?,
                diff_result_id: diff.id,
                change_count: diff.change_count,
                alignment_score: diff.alignment_score,
                overlay_file,
            });
        }
        Ok(pages)
    }
}

fn follow_events(events: &StageEventBroadcaster) {
    let mut rx = events.subscribe();
    thread::spawn(move || loop {
        match rx.blocking_recv() {
            Ok(event) => match &event.error {
                Some(error) => eprintln!("[{}] {} ({})", event.job_id, event.message, error),
                None => eprintln!("[{}] {}", event.job_id, event.message),
            },
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                eprintln!("... {} event(s) skipped", skipped);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    });
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
