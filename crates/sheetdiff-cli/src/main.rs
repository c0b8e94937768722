//! `sheetdiff` - align drawing revisions, render change overlays and run
//! OCR/diff/summary comparisons from the command line.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use log::info;

mod commands;

use commands::compare::CompareCommand;
use commands::jobs::{ManualOverlayCommand, RegenerateCommand, RetryCommand, StatusCommand};
use commands::overlay::OverlayCommand;

#[derive(Parser)]
#[command(
    name = "sheetdiff",
    version,
    about = "Compare drawing-set revisions sheet by sheet",
    after_help = "EXAMPLES:\n  \
                  # Align two renderings and write the colour-coded overlay\n  \
                  sheetdiff overlay rev-a.png rev-b.png -o changes.png\n\n  \
                  # Compare two PDF drawing sets and export every overlay\n  \
                  sheetdiff compare set-a.pdf set-b.pdf --export ./overlays\n\n  \
                  # Summarize a diff again after a manual overlay edit\n  \
                  sheetdiff regenerate <DIFF_RESULT_ID>"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON configuration file
    #[arg(short, long, global = true, env = "SHEETDIFF_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Align two sheets and write the change overlay
    Overlay(OverlayCommand),

    /// Ingest two document versions and run a full comparison job
    Compare(CompareCommand),

    /// Show a job and every stage row
    Status(StatusCommand),

    /// Re-run a failed or exhausted stage
    Retry(RetryCommand),

    /// Produce a fresh change summary for a diff result
    Regenerate(RegenerateCommand),

    /// Replace or clear the reviewer-supplied overlay of a diff result
    ManualOverlay(ManualOverlayCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    sheetdiff::logging::init_tracing(cli.json_logs);

    let config = match &cli.config {
        Some(path) => sheetdiff::load_config(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => sheetdiff::Config::default(),
    };
    info!("sheetdiff v{} ({} mode)", env!("CARGO_PKG_VERSION"), config.mode.as_str());

    match cli.command {
        Commands::Overlay(cmd) => cmd.execute(&config),
        Commands::Compare(cmd) => cmd.execute(&config),
        Commands::Status(cmd) => cmd.execute(&config),
        Commands::Retry(cmd) => cmd.execute(&config),
        Commands::Regenerate(cmd) => cmd.execute(&config),
        Commands::ManualOverlay(cmd) => cmd.execute(&config),
    }
}
