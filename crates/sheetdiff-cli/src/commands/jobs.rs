use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;
use log::info;

use sheetdiff::{Config, Runtime, Services, StageKey, StageKind};

use super::{print_json, read_input};

fn open_runtime(config: &Config) -> Result<Runtime> {
    Ok(Runtime::open(config, Services::from_config(config)?, None)?)
}

fn parse_stage(s: &str) -> Result<StageKind, String> {
    StageKind::parse(s).ok_or_else(|| format!("unknown stage '{}' (expected ocr, diff or summary)", s))
}

#[derive(Args)]
pub struct StatusCommand {
    /// Job to inspect
    pub job_id: String,
}

impl StatusCommand {
    pub fn execute(&self, config: &Config) -> Result<()> {
        let runtime = open_runtime(config)?;
        let report = runtime.orchestrator().job_report(&self.job_id);
        runtime.shutdown();
        print_json(&report?)
    }
}

#[derive(Args)]
pub struct RetryCommand {
    pub job_id: String,

    /// Stage to retry: ocr, diff or summary
    #[arg(value_parser = parse_stage)]
    pub stage: StageKind,

    /// Page of a streaming job; omit for legacy job-level stages
    #[arg(long)]
    pub page: Option<u32>,

    /// Seconds to wait for the job to finish afterwards
    #[arg(long, default_value_t = 600)]
    pub timeout_secs: u64,
}

impl RetryCommand {
    pub fn execute(&self, config: &Config) -> Result<()> {
        let key = match self.page {
            Some(page) => StageKey::page(&self.job_id, self.stage, page),
            None => StageKey::job_level(&self.job_id, self.stage),
        };

        let runtime = open_runtime(config)?;
        let result = (|| -> Result<()> {
            runtime.orchestrator().retry_stage(&key)?;
            info!("Retrying {}", key);
            let job = runtime.wait_for_job(&self.job_id, Duration::from_secs(self.timeout_secs))?;
            print_json(&runtime.orchestrator().job_report(&job.id)?)
        })();
        runtime.shutdown();
        result
    }
}

#[derive(Args)]
pub struct RegenerateCommand {
    pub diff_result_id: String,
}

impl RegenerateCommand {
    pub fn execute(&self, config: &Config) -> Result<()> {
        let runtime = open_runtime(config)?;
        let summary = runtime.regenerate_summary(&self.diff_result_id);
        runtime.shutdown();
        print_json(&summary?)
    }
}

#[derive(Args)]
pub struct ManualOverlayCommand {
    pub diff_result_id: String,

    /// PNG to install as the active overlay
    #[arg(long, conflicts_with = "clear")]
    pub set: Option<PathBuf>,

    /// Deactivate the current manual overlay
    #[arg(long)]
    pub clear: bool,

    /// Reviewer recorded with the overlay
    #[arg(long, default_value = "cli")]
    pub author: String,
}

impl ManualOverlayCommand {
    pub fn execute(&self, config: &Config) -> Result<()> {
        let png = match (&self.set, self.clear) {
            (Some(path), false) => Some(read_input(path)?.0),
            (None, true) => None,
            _ => bail!("pass either --set <PNG> or --clear"),
        };

        let runtime = open_runtime(config)?;
        let result = match png {
            Some(png) => runtime
                .set_manual_overlay(&self.diff_result_id, &png, &self.author)
                .map_err(anyhow::Error::from)
                .and_then(|overlay| print_json(&overlay)),
            None => runtime
                .clear_manual_overlay(&self.diff_result_id)
                .map_err(anyhow::Error::from)
                .map(|cleared| {
                    if cleared {
                        info!("Cleared manual overlay of {}", self.diff_result_id);
                    } else {
                        info!("{} had no active manual overlay", self.diff_result_id);
                    }
                }),
        };
        runtime.shutdown();
        result
    }
}
