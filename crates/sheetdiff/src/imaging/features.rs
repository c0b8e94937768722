//! Oriented FAST keypoints with rotated BRIEF descriptors.
//!
//! Keypoints are detected on every level of a scale pyramid and reported in
//! level-0 coordinates. Orientation comes from the intensity centroid of the
//! ink inside a circular patch, and the binary test pattern is rotated by
//! that angle before sampling, which makes descriptors comparable across
//! small rotations and scale changes between revisions.

use std::collections::HashMap;

use image::imageops::FilterType;
use image::GrayImage;
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::AlignmentConfig;

/// Radius of the orientation/descriptor patch at each pyramid level.
const PATCH_RADIUS: i32 = 15;
/// Rotated pattern offsets can reach `PATCH_RADIUS * sqrt(2)`.
const EDGE_GUARD: u32 = 22;
const DESCRIPTOR_PAIRS: usize = 256;
const PATTERN_SEED: u64 = 0x0B12_EF00_D5EE_D001;
/// Non-maximum suppression cell size, in level pixels.
const NMS_CELL: u32 = 6;
const BLUR_SIGMA: f32 = 2.0;

/// 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u64; 4]);

impl Descriptor {
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Keypoint {
    /// Level-0 coordinates of the image the detector was run on.
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub level: u32,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct Feature {
    pub keypoint: Keypoint,
    pub descriptor: Descriptor,
}

/// Correspondence between feature `query` of the first set and feature
/// `train` of the second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureMatch {
    pub query: usize,
    pub train: usize,
    pub distance: u32,
}

struct BriefPattern {
    pairs: Vec<[(f32, f32); 2]>,
}

impl BriefPattern {
    fn new() -> Self {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let bound = PATCH_RADIUS - 2;
        let sample = |rng: &mut StdRng| -> (f32, f32) {
            // Sum of two uniforms concentrates tests toward the centre.
            let x = (rng.random_range(-bound..=bound) + rng.random_range(-bound..=bound)) / 2;
            let y = (rng.random_range(-bound..=bound) + rng.random_range(-bound..=bound)) / 2;
            (x as f32, y as f32)
        };
        let pairs = (0..DESCRIPTOR_PAIRS)
            .map(|_| [sample(&mut rng), sample(&mut rng)])
            .collect();
        Self { pairs }
    }
}

/// Detects and describes features on `gray`.
///
/// Points whose level-0 position falls inside the border margin are
/// dropped; at most `config.max_features` are kept, strongest first, with
/// the budget split across pyramid levels by area.
pub fn detect_and_describe(gray: &GrayImage, config: &AlignmentConfig) -> Vec<Feature> {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let margin_x = width as f32 * config.border_margin_ratio;
    let margin_y = height as f32 * config.border_margin_ratio;
    let pattern = BriefPattern::new();
    let levels = config.pyramid_levels.max(1);

    let weights: Vec<f32> = (0..levels)
        .map(|l| config.pyramid_scale.powi(-2 * l as i32))
        .collect();
    let weight_sum: f32 = weights.iter().sum();

    let mut features = Vec::new();
    for level in 0..levels {
        let factor = config.pyramid_scale.powi(level as i32);
        let lw = (width as f32 / factor).round() as u32;
        let lh = (height as f32 / factor).round() as u32;
        if lw <= 2 * EDGE_GUARD || lh <= 2 * EDGE_GUARD {
            break;
        }
        let (sx, sy) = (width as f32 / lw as f32, height as f32 / lh as f32);
        let level_img = if level == 0 {
            gray.clone()
        } else {
            image::imageops::resize(gray, lw, lh, FilterType::Triangle)
        };
        let smoothed = gaussian_blur_f32(&level_img, BLUR_SIGMA);

        let quota = ((config.max_features as f32) * weights[level as usize] / weight_sum)
            .ceil()
            .max(1.0) as usize;

        let mut best_per_cell: HashMap<(u32, u32), imageproc::corners::Corner> = HashMap::new();
        for corner in corners_fast9(&level_img, config.fast_threshold) {
            if corner.x < EDGE_GUARD
                || corner.y < EDGE_GUARD
                || corner.x >= lw - EDGE_GUARD
                || corner.y >= lh - EDGE_GUARD
            {
                continue;
            }
            let x0 = level_to_base(corner.x, sx);
            let y0 = level_to_base(corner.y, sy);
            if x0 < margin_x
                || y0 < margin_y
                || x0 > width as f32 - margin_x
                || y0 > height as f32 - margin_y
            {
                continue;
            }
            let cell = (corner.x / NMS_CELL, corner.y / NMS_CELL);
            match best_per_cell.get(&cell) {
                Some(existing) if existing.score >= corner.score => {}
                _ => {
                    best_per_cell.insert(cell, corner);
                }
            }
        }

        let mut corners: Vec<_> = best_per_cell.into_values().collect();
        corners.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.y.cmp(&b.y))
                .then(a.x.cmp(&b.x))
        });
        corners.truncate(quota);

        for corner in corners {
            let angle = intensity_centroid_angle(&smoothed, corner.x as i32, corner.y as i32);
            let descriptor = describe(&smoothed, corner.x as f32, corner.y as f32, angle, &pattern);
            features.push(Feature {
                keypoint: Keypoint {
                    x: level_to_base(corner.x, sx),
                    y: level_to_base(corner.y, sy),
                    angle,
                    level,
                    score: corner.score,
                },
                descriptor,
            });
        }
    }

    features.truncate(config.max_features);
    features
}

/// Maps a pixel centre of a pyramid level onto level 0. `ratio` is the
/// actual base/level size ratio after rounding.
fn level_to_base(coord: u32, ratio: f32) -> f32 {
    (coord as f32 + 0.5) * ratio - 0.5
}

fn intensity_centroid_angle(img: &GrayImage, cx: i32, cy: i32) -> f32 {
    let mut m01 = 0.0f32;
    let mut m10 = 0.0f32;
    let r2 = PATCH_RADIUS * PATCH_RADIUS;
    for dy in -PATCH_RADIUS..=PATCH_RADIUS {
        for dx in -PATCH_RADIUS..=PATCH_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let ink = 255.0 - img.get_pixel((cx + dx) as u32, (cy + dy) as u32).0[0] as f32;
            m10 += dx as f32 * ink;
            m01 += dy as f32 * ink;
        }
    }
    m01.atan2(m10)
}

fn describe(img: &GrayImage, cx: f32, cy: f32, angle: f32, pattern: &BriefPattern) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let (w, h) = img.dimensions();
    let sample = |(px, py): (f32, f32)| -> u8 {
        let x = (cx + cos * px - sin * py).round().clamp(0.0, (w - 1) as f32) as u32;
        let y = (cy + sin * px + cos * py).round().clamp(0.0, (h - 1) as f32) as u32;
        img.get_pixel(x, y).0[0]
    };

    let mut bits = [0u64; 4];
    for (i, [p, q]) in pattern.pairs.iter().enumerate() {
        if sample(*p) < sample(*q) {
            bits[i / 64] |= 1u64 << (i % 64);
        }
    }
    Descriptor(bits)
}

/// Brute-force Hamming nearest neighbour with Lowe's ratio test.
///
/// A match is kept only when the best distance is strictly below
/// `ratio * second_best`. When several queries pick the same train feature
/// only the closest survives.
pub fn match_features(query: &[Feature], train: &[Feature], ratio: f32) -> Vec<FeatureMatch> {
    if train.len() < 2 {
        return Vec::new();
    }

    let mut by_train: HashMap<usize, FeatureMatch> = HashMap::new();
    for (qi, q) in query.iter().enumerate() {
        let mut best = (u32::MAX, usize::MAX);
        let mut second = u32::MAX;
        for (ti, t) in train.iter().enumerate() {
            let d = q.descriptor.hamming(&t.descriptor);
            if d < best.0 {
                second = best.0;
                best = (d, ti);
            } else if d < second {
                second = d;
            }
        }
        if best.1 == usize::MAX || (best.0 as f32) >= ratio * second as f32 {
            continue;
        }
        let candidate = FeatureMatch {
            query: qi,
            train: best.1,
            distance: best.0,
        };
        match by_train.get(&best.1) {
            Some(existing) if existing.distance <= candidate.distance => {}
            _ => {
                by_train.insert(best.1, candidate);
            }
        }
    }

    let mut matches: Vec<FeatureMatch> = by_train.into_values().collect();
    matches.sort_by_key(|m| (m.query, m.train));
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut};
    use imageproc::rect::Rect;

    fn sample_drawing() -> GrayImage {
        let mut img = GrayImage::from_pixel(400, 300, Luma([255]));
        draw_filled_rect_mut(&mut img, Rect::at(60, 50).of_size(80, 40), Luma([0]));
        draw_filled_rect_mut(&mut img, Rect::at(220, 160).of_size(30, 90), Luma([0]));
        draw_line_segment_mut(&mut img, (40.0, 250.0), (350.0, 70.0), Luma([0]));
        draw_line_segment_mut(&mut img, (100.0, 30.0), (180.0, 270.0), Luma([0]));
        img
    }

    #[test]
    fn test_level_coordinates_use_the_rounded_ratio() {
        let (width, scale) = (1000u32, 1.2f32);
        let lw = (width as f32 / scale).round() as u32;
        let ratio = width as f32 / lw as f32;

        assert_eq!(level_to_base(17, 1.0), 17.0);
        // Both edge pixel centres land symmetrically inside the base image.
        let first = level_to_base(0, ratio);
        let last = level_to_base(lw - 1, ratio);
        assert!((first + last - (width - 1) as f32).abs() < 1e-3);
        assert!(last <= (width - 1) as f32);
    }

    #[test]
    fn test_hamming_distance() {
        let a = Descriptor([0, 0, 0, 0]);
        let b = Descriptor([0b1011, 0, u64::MAX, 1]);
        assert_eq!(a.hamming(&a), 0);
        assert_eq!(a.hamming(&b), 3 + 64 + 1);
    }

    #[test]
    fn test_blank_image_has_no_features() {
        let img = GrayImage::from_pixel(200, 200, Luma([255]));
        assert!(detect_and_describe(&img, &AlignmentConfig::default()).is_empty());
    }

    #[test]
    fn test_detection_is_deterministic_and_capped() {
        let img = sample_drawing();
        let config = AlignmentConfig {
            max_features: 20,
            border_margin_ratio: 0.0,
            ..AlignmentConfig::default()
        };
        let a = detect_and_describe(&img, &config);
        let b = detect_and_describe(&img, &config);
        assert!(!a.is_empty());
        assert!(a.len() <= 20);
        assert_eq!(a.len(), b.len());
        for (fa, fb) in a.iter().zip(b.iter()) {
            assert_eq!(fa.descriptor, fb.descriptor);
        }
    }

    #[test]
    fn test_border_margin_masks_edge_features() {
        let mut img = GrayImage::from_pixel(400, 400, Luma([255]));
        // Ink only near the left edge.
        draw_filled_rect_mut(&mut img, Rect::at(25, 150).of_size(20, 20), Luma([0]));
        let config = AlignmentConfig {
            border_margin_ratio: 0.2,
            pyramid_levels: 1,
            ..AlignmentConfig::default()
        };
        assert!(detect_and_describe(&img, &config).is_empty());
    }

    #[test]
    fn test_self_matching_pairs_identical_points() {
        let img = sample_drawing();
        let config = AlignmentConfig {
            border_margin_ratio: 0.0,
            ..AlignmentConfig::default()
        };
        let features = detect_and_describe(&img, &config);
        let matches = match_features(&features, &features, 1.0);
        for m in &matches {
            assert_eq!(m.distance, 0);
            let a = features[m.query].keypoint;
            let b = features[m.train].keypoint;
            assert_eq!((a.x, a.y), (b.x, b.y));
        }
    }

    #[test]
    fn test_ratio_test_rejects_ambiguous_matches() {
        let make = |bits: [u64; 4]| Feature {
            keypoint: Keypoint {
                x: 0.0,
                y: 0.0,
                angle: 0.0,
                level: 0,
                score: 1.0,
            },
            descriptor: Descriptor(bits),
        };
        let query = vec![make([0, 0, 0, 0])];
        // Two train candidates at the same distance.
        let train = vec![make([1, 0, 0, 0]), make([2, 0, 0, 0])];
        assert!(match_features(&query, &train, 0.75).is_empty());

        let train = vec![make([1, 0, 0, 0]), make([u64::MAX, 0, 0, 0])];
        let matches = match_features(&query, &train, 0.75);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].train, 0);
    }
}
