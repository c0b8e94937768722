use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use clap::Args;
use image::RgbaImage;
use log::info;
use serde::Serialize;

use sheetdiff::imaging::{decode, encode_png, AlignmentReport, PixelStats};
use sheetdiff::{Config, FeatureAligner, OverlayCompositor, PageExtractor};

use super::{print_json, read_input};

#[derive(Args)]
pub struct OverlayCommand {
    /// Older revision (PDF or raster image)
    pub old: PathBuf,

    /// Newer revision (PDF or raster image)
    pub new: PathBuf,

    /// Where to write the overlay PNG
    #[arg(short, long)]
    pub output: PathBuf,

    /// 1-based page to compare when an input is a multi-page document
    #[arg(long, default_value_t = 1)]
    pub page: u32,

    /// Also write the old sheet warped onto the new sheet's frame
    #[arg(long)]
    pub aligned: Option<PathBuf>,
}

#[derive(Serialize)]
struct OverlayOutput {
    output: PathBuf,
    alignment: AlignmentReport,
    stats: PixelStats,
    overlap_ratio: f64,
}

impl OverlayCommand {
    pub fn execute(&self, config: &Config) -> Result<()> {
        let extractor = PageExtractor::new(config.pages.dpi);
        let old = self.load_sheet(&extractor, &self.old)?;
        let new = self.load_sheet(&extractor, &self.new)?;

        let alignment = FeatureAligner::new(config.alignment.clone())
            .align_with_report(&old, &new)
            .context("Could not register the two sheets")?;
        info!(
            "Aligned with {} inliers (score {:.3}, rotation {:.2} deg, scale {:.4})",
            alignment.report.inliers,
            alignment.report.score,
            alignment.report.rotation_deg,
            alignment.report.scale
        );

        let composite = OverlayCompositor::new(config.overlay.clone()).composite(&alignment.image, &new)?;
        fs::write(&self.output, encode_png(&composite.image)?)
            .with_context(|| format!("Failed to write {}", self.output.display()))?;
        if let Some(path) = &self.aligned {
            fs::write(path, encode_png(&alignment.image)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }

        print_json(&OverlayOutput {
            output: self.output.clone(),
            overlap_ratio: composite.stats.overlap_ratio(),
            alignment: alignment.report,
            stats: composite.stats,
        })
    }

    fn load_sheet(&self, extractor: &PageExtractor, path: &Path) -> Result<RgbaImage> {
        let (bytes, filename) = read_input(path)?;
        let pages = extractor.extract(&bytes, &filename)?;
        let Some(page) = pages.iter().find(|p| p.page_number == self.page) else {
            bail!("{} has {} page(s), page {} requested", filename, pages.len(), self.page);
        };
        Ok(decode(&page.png)?)
    }
}
