use image::{Rgba, RgbaImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use serde::{Deserialize, Serialize};

use crate::config::AlignmentConfig;
use crate::error::AlignmentError;
use crate::imaging::codec::{fit_within, to_gray};
use crate::imaging::features::{detect_and_describe, match_features};
use crate::imaging::transform::{
    ransac, reprojection_error, AffineTransform, Constraints, Correspondence, RansacParams,
    MIN_CORRESPONDENCES,
};

const MIN_KEYPOINTS: usize = 2;
/// Hypothesis points closer than this (working pixels) pin rotation poorly.
const MIN_SAMPLE_SPREAD: f64 = 32.0;
const PAPER: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Diagnostics for one registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentReport {
    /// Maps old-image pixel coordinates onto the new image's frame.
    pub transform: AffineTransform,
    pub scale: f64,
    pub rotation_deg: f64,
    pub shear: f64,
    pub keypoints_old: usize,
    pub keypoints_new: usize,
    pub matches: usize,
    pub inliers: usize,
    /// Inlier ratio in [0, 1].
    pub score: f64,
    pub mean_error_before: f64,
    pub mean_error_after: f64,
}

#[derive(Debug, Clone)]
pub struct Alignment {
    pub image: RgbaImage,
    pub report: AlignmentReport,
}

/// Registers an old sheet rendering onto the frame of the new one.
#[derive(Debug, Clone, Default)]
pub struct FeatureAligner {
    config: AlignmentConfig,
}

impl FeatureAligner {
    pub fn new(config: AlignmentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AlignmentConfig {
        &self.config
    }

    pub fn align(&self, old: &RgbaImage, new: &RgbaImage) -> Result<RgbaImage, AlignmentError> {
        self.align_with_report(old, new).map(|a| a.image)
    }

    pub fn align_with_report(
        &self,
        old: &RgbaImage,
        new: &RgbaImage,
    ) -> Result<Alignment, AlignmentError> {
        let _span = tracing::info_span!(
            "imaging.align",
            old_w = old.width(),
            old_h = old.height(),
            new_w = new.width(),
            new_h = new.height()
        )
        .entered();

        for img in [old, new] {
            if img.width() == 0 || img.height() == 0 {
                return Err(AlignmentError::Image(format!(
                    "image has zero area ({}x{})",
                    img.width(),
                    img.height()
                )));
            }
        }

        // Both sides share one working factor so pixel thresholds mean the
        // same thing on each.
        let longest = old.width().max(old.height()).max(new.width()).max(new.height());
        let factor = if longest > self.config.working_max_dimension {
            self.config.working_max_dimension as f64 / longest as f64
        } else {
            1.0
        };
        let working = |img: &RgbaImage| {
            let gray = to_gray(img);
            if factor < 1.0 {
                let limit = ((gray.width().max(gray.height()) as f64) * factor).round() as u32;
                fit_within(&gray, limit.max(1)).0
            } else {
                gray
            }
        };
        let old_gray = working(old);
        let new_gray = working(new);

        let old_features = detect_and_describe(&old_gray, &self.config);
        let new_features = detect_and_describe(&new_gray, &self.config);
        tracing::debug!(
            old = old_features.len(),
            new = new_features.len(),
            "Detected keypoints"
        );
        if old_features.len() < MIN_KEYPOINTS || new_features.len() < MIN_KEYPOINTS {
            return Err(AlignmentError::InsufficientKeypoints {
                old: old_features.len(),
                new: new_features.len(),
            });
        }

        let matches = match_features(&old_features, &new_features, self.config.ratio_threshold);
        if matches.len() < MIN_CORRESPONDENCES {
            return Err(AlignmentError::InsufficientMatches {
                found: matches.len(),
            });
        }

        let pairs: Vec<Correspondence> = matches
            .iter()
            .map(|m| {
                let p = old_features[m.query].keypoint;
                let q = new_features[m.train].keypoint;
                ((p.x as f64, p.y as f64), (q.x as f64, q.y as f64))
            })
            .collect();

        let constraints = Constraints::from(&self.config);
        let outcome = ransac(
            &pairs,
            &constraints,
            RansacParams {
                iterations: self.config.ransac_iterations,
                threshold: self.config.ransac_reprojection_px as f64,
                seed: self.config.ransac_seed,
                min_sample_spread: MIN_SAMPLE_SPREAD,
            },
        )
        .map_err(|candidates_rejected| AlignmentError::NoConstrainedModel {
            matches: matches.len(),
            candidates_rejected,
        })?;

        let transform = outcome.transform.rescaled(factor);
        let full_pairs: Vec<Correspondence> = outcome
            .inliers
            .iter()
            .map(|&i| {
                let ((px, py), (qx, qy)) = pairs[i];
                ((px / factor, py / factor), (qx / factor, qy / factor))
            })
            .collect();
        let n = full_pairs.len() as f64;
        let mean_error_before = full_pairs
            .iter()
            .map(|&(p, q)| ((p.0 - q.0).powi(2) + (p.1 - q.1).powi(2)).sqrt())
            .sum::<f64>()
            / n;
        let mean_error_after = full_pairs
            .iter()
            .map(|pair| reprojection_error(&transform, pair))
            .sum::<f64>()
            / n;

        let image = warp_to_frame(old, &transform, new.width(), new.height())?;

        let dec = transform.decompose();
        let report = AlignmentReport {
            transform,
            scale: (dec.scale_x * dec.scale_y).sqrt(),
            rotation_deg: dec.rotation_deg,
            shear: dec.shear,
            keypoints_old: old_features.len(),
            keypoints_new: new_features.len(),
            matches: matches.len(),
            inliers: outcome.inliers.len(),
            score: outcome.inliers.len() as f64 / matches.len() as f64,
            mean_error_before,
            mean_error_after,
        };
        tracing::info!(
            scale = report.scale,
            rotation_deg = report.rotation_deg,
            inliers = report.inliers,
            matches = report.matches,
            "Aligned sheet"
        );

        Ok(Alignment { image, report })
    }
}

/// Resamples `img` through `transform` onto a `width` x `height` canvas,
/// filling uncovered pixels with white paper.
pub fn warp_to_frame(
    img: &RgbaImage,
    transform: &AffineTransform,
    width: u32,
    height: u32,
) -> Result<RgbaImage, AlignmentError> {
    let projection = Projection::from_matrix(transform.to_matrix())
        .ok_or_else(|| AlignmentError::Image("transform is not invertible".to_string()))?;
    let mut out = RgbaImage::from_pixel(width, height, PAPER);
    warp_into(img, &projection, Interpolation::Bilinear, PAPER, &mut out);
    Ok(out)
}
