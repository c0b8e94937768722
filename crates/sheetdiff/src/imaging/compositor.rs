//! Colour-coded change overlay for an aligned sheet pair.
//!
//! Removed linework is painted red, added linework green and unchanged
//! linework neutral gray, all on white paper, with a thin black edge layer
//! on top so both revisions stay legible where they coincide.

use image::imageops::FilterType;
use image::{GrayImage, Luma, Rgba, RgbaImage};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::morphology::dilate;
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};

use crate::config::OverlayConfig;
use crate::error::CompositeError;
use crate::imaging::codec::{fit_scale, to_gray};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeMode {
    Soft,
    Binary,
}

impl CompositeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Binary => "binary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "soft" => Some(Self::Soft),
            "binary" => Some(Self::Binary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelStats {
    pub added_pixels: u64,
    pub removed_pixels: u64,
    pub overlap_pixels: u64,
    /// 8-connected changed regions at least `min_change_area` pixels large.
    pub change_count: u32,
    pub mode: CompositeMode,
    pub width: u32,
    pub height: u32,
}

impl PixelStats {
    /// Share of inked pixels classified as unchanged.
    pub fn overlap_ratio(&self) -> f64 {
        let inked = self.added_pixels + self.removed_pixels + self.overlap_pixels;
        if inked == 0 {
            1.0
        } else {
            self.overlap_pixels as f64 / inked as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompositeOutput {
    pub image: RgbaImage,
    pub stats: PixelStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelClass {
    Paper,
    Removed,
    Added,
    Overlap,
}

#[derive(Debug, Clone, Default)]
pub struct OverlayCompositor {
    config: OverlayConfig,
}

impl OverlayCompositor {
    pub fn new(config: OverlayConfig) -> Self {
        Self { config }
    }

    /// Builds the overlay. The gamma-mask path degrades to a binary
    /// threshold overlay rather than failing; only empty inputs are errors.
    pub fn composite(
        &self,
        aligned_old: &RgbaImage,
        new: &RgbaImage,
    ) -> Result<CompositeOutput, CompositeError> {
        let _span = tracing::info_span!("imaging.composite").entered();

        for img in [aligned_old, new] {
            if img.width() == 0 || img.height() == 0 {
                return Err(CompositeError::EmptyImage {
                    width: img.width(),
                    height: img.height(),
                });
            }
        }

        let (old, new) = self.prepare(aligned_old, new);
        match self.composite_soft(&old, &new) {
            Ok(output) => Ok(output),
            Err(e) => {
                tracing::warn!(error = %e, "Soft compositing failed, using binary overlay");
                Ok(self.composite_binary(&old, &new))
            }
        }
    }

    /// Puts both images on the new image's canvas, within `max_dimension`.
    fn prepare(&self, old: &RgbaImage, new: &RgbaImage) -> (RgbaImage, RgbaImage) {
        let scale = fit_scale(new.width(), new.height(), self.config.max_dimension);
        let (w, h) = if scale < 1.0 {
            (
                ((new.width() as f64 * scale).round() as u32).max(1),
                ((new.height() as f64 * scale).round() as u32).max(1),
            )
        } else {
            new.dimensions()
        };
        let fit = |img: &RgbaImage| {
            if img.dimensions() == (w, h) {
                img.clone()
            } else {
                image::imageops::resize(img, w, h, FilterType::Triangle)
            }
        };
        (fit(old), fit(new))
    }

    fn validate(&self) -> Result<(), CompositeError> {
        let c = &self.config;
        let checks: [(&'static str, f32, bool); 6] = [
            ("mask_gamma", c.mask_gamma, c.mask_gamma.is_finite() && c.mask_gamma > 0.0),
            ("alpha_gamma", c.alpha_gamma, c.alpha_gamma.is_finite() && c.alpha_gamma > 0.0),
            ("ink_threshold", c.ink_threshold, (0.0..=1.0).contains(&c.ink_threshold)),
            ("edge_threshold", c.edge_threshold, (0.0..=1.0).contains(&c.edge_threshold)),
            ("edge_alpha", c.edge_alpha, (0.0..=1.0).contains(&c.edge_alpha)),
            ("canny_high", c.canny_high, c.canny_high.is_finite() && c.canny_low <= c.canny_high),
        ];
        for (name, value, ok) in checks {
            if !ok {
                return Err(CompositeError::InvalidParameter { name, value });
            }
        }
        Ok(())
    }

    fn soft_mask(&self, img: &RgbaImage) -> Result<Vec<f32>, CompositeError> {
        let (w, _) = img.dimensions();
        let mut mask = Vec::with_capacity(img.len() / 4);
        for (i, p) in img.pixels().enumerate() {
            let [r, g, b, a] = p.0;
            let luminance = (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32) / 255.0;
            let alpha = a as f32 / 255.0;
            let m = (1.0 - luminance).max(0.0).powf(self.config.mask_gamma)
                * alpha.powf(self.config.alpha_gamma);
            if !m.is_finite() {
                return Err(CompositeError::NonFinite {
                    x: i as u32 % w,
                    y: i as u32 / w,
                });
            }
            mask.push(m.clamp(0.0, 1.0));
        }
        Ok(mask)
    }

    fn composite_soft(
        &self,
        old: &RgbaImage,
        new: &RgbaImage,
    ) -> Result<CompositeOutput, CompositeError> {
        self.validate()?;
        if old.dimensions() != new.dimensions() {
            return Err(CompositeError::DimensionMismatch {
                old_w: old.width(),
                old_h: old.height(),
                new_w: new.width(),
                new_h: new.height(),
            });
        }
        let (w, h) = new.dimensions();
        let m_old = self.soft_mask(old)?;
        let m_new = self.soft_mask(new)?;

        let radius = self.config.overlap_buffer_px;
        let (d_old, d_new) = if radius > 0 {
            (max_filter(&m_old, w, h, radius), max_filter(&m_new, w, h, radius))
        } else {
            (m_old.clone(), m_new.clone())
        };
        let edges = self.edge_weights(old, &m_old, new, &m_new, w, h);

        let gray = self.config.overlap_gray as f32 / 255.0;
        let ink = self.config.ink_threshold;
        let mut image = RgbaImage::new(w, h);
        let mut classes = Vec::with_capacity(m_new.len());
        for i in 0..m_new.len() {
            let overlap_old = m_old[i].min(d_new[i]);
            let overlap_new = m_new[i].min(d_old[i]);
            let removed = m_old[i] - overlap_old;
            let added = m_new[i] - overlap_new;
            let overlap = overlap_old.max(overlap_new);

            let mut rgb = [1.0f32; 3];
            for (channel, target) in rgb.iter_mut().zip([gray, gray, gray]) {
                *channel = *channel * (1.0 - overlap) + target * overlap;
            }
            for (channel, target) in rgb.iter_mut().zip([1.0, 0.0, 0.0]) {
                *channel = *channel * (1.0 - removed) + target * removed;
            }
            for (channel, target) in rgb.iter_mut().zip([0.0, 1.0, 0.0]) {
                *channel = *channel * (1.0 - added) + target * added;
            }
            if edges[i] >= self.config.edge_threshold && edges[i] > 0.0 {
                for channel in rgb.iter_mut() {
                    *channel *= 1.0 - self.config.edge_alpha;
                }
            }
            if rgb.iter().any(|v| !v.is_finite()) {
                return Err(CompositeError::NonFinite {
                    x: i as u32 % w,
                    y: i as u32 / w,
                });
            }
            let [r, g, b] = rgb.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8);
            image.put_pixel(i as u32 % w, i as u32 / w, Rgba([r, g, b, 255]));

            let strongest = removed.max(added).max(overlap);
            classes.push(if strongest < ink || strongest <= 0.0 {
                PixelClass::Paper
            } else if strongest == overlap {
                PixelClass::Overlap
            } else if strongest == removed {
                PixelClass::Removed
            } else {
                PixelClass::Added
            });
        }

        Ok(CompositeOutput {
            image,
            stats: self.stats(&classes, w, h, CompositeMode::Soft),
        })
    }

    /// Per-pixel edge strength: Canny edges of each image weighted by that
    /// image's own ink, dilated by one pixel so edges on the paper side of
    /// a stroke still count.
    fn edge_weights(
        &self,
        old: &RgbaImage,
        m_old: &[f32],
        new: &RgbaImage,
        m_new: &[f32],
        w: u32,
        h: u32,
    ) -> Vec<f32> {
        let low = self.config.canny_low;
        let high = self.config.canny_high;
        let e_old = canny(&to_gray(old), low, high);
        let e_new = canny(&to_gray(new), low, high);
        let g_old = max_filter(m_old, w, h, 1);
        let g_new = max_filter(m_new, w, h, 1);
        e_old
            .pixels()
            .zip(e_new.pixels())
            .enumerate()
            .map(|(i, (a, b))| {
                let wa = a.0[0] as f32 / 255.0 * g_old[i];
                let wb = b.0[0] as f32 / 255.0 * g_new[i];
                wa.max(wb)
            })
            .collect()
    }

    fn composite_binary(&self, old: &RgbaImage, new: &RgbaImage) -> CompositeOutput {
        let (w, h) = new.dimensions();
        let threshold = self.config.binary_threshold;
        let ink_of = |img: &RgbaImage| {
            let gray = to_gray(img);
            GrayImage::from_fn(w, h, |x, y| {
                let inked = x < gray.width()
                    && y < gray.height()
                    && gray.get_pixel(x, y).0[0] < threshold;
                Luma([if inked { 255 } else { 0 }])
            })
        };
        let ink_old = ink_of(old);
        let ink_new = ink_of(new);
        let k = self.config.overlap_buffer_px.min(u8::MAX as u32) as u8;
        let (near_old, near_new) = if k > 0 {
            (dilate(&ink_old, Norm::LInf, k), dilate(&ink_new, Norm::LInf, k))
        } else {
            (ink_old.clone(), ink_new.clone())
        };

        let gray = self.config.overlap_gray;
        let mut image = RgbaImage::new(w, h);
        let mut classes = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                let o = ink_old.get_pixel(x, y).0[0] > 0;
                let n = ink_new.get_pixel(x, y).0[0] > 0;
                let class = match (o, n) {
                    (false, false) => PixelClass::Paper,
                    (true, _) if near_new.get_pixel(x, y).0[0] > 0 => PixelClass::Overlap,
                    (_, true) if near_old.get_pixel(x, y).0[0] > 0 => PixelClass::Overlap,
                    (true, _) => PixelClass::Removed,
                    (_, true) => PixelClass::Added,
                };
                let color = match class {
                    PixelClass::Paper => Rgba([255, 255, 255, 255]),
                    PixelClass::Overlap => Rgba([gray, gray, gray, 255]),
                    PixelClass::Removed => Rgba([255, 0, 0, 255]),
                    PixelClass::Added => Rgba([0, 255, 0, 255]),
                };
                image.put_pixel(x, y, color);
                classes.push(class);
            }
        }

        CompositeOutput {
            image,
            stats: self.stats(&classes, w, h, CompositeMode::Binary),
        }
    }

    fn stats(&self, classes: &[PixelClass], w: u32, h: u32, mode: CompositeMode) -> PixelStats {
        let count = |c: PixelClass| classes.iter().filter(|&&k| k == c).count() as u64;
        let changed = GrayImage::from_fn(w, h, |x, y| {
            match classes[(y * w + x) as usize] {
                PixelClass::Removed | PixelClass::Added => Luma([255]),
                _ => Luma([0]),
            }
        });
        PixelStats {
            added_pixels: count(PixelClass::Added),
            removed_pixels: count(PixelClass::Removed),
            overlap_pixels: count(PixelClass::Overlap),
            change_count: count_regions(&changed, self.config.min_change_area),
            mode,
            width: w,
            height: h,
        }
    }
}

fn count_regions(changed: &GrayImage, min_area: u32) -> u32 {
    let labels = connected_components(changed, Connectivity::Eight, Luma([0u8]));
    let mut areas: Vec<u32> = Vec::new();
    for p in labels.pixels() {
        let label = p.0[0] as usize;
        if label == 0 {
            continue;
        }
        if areas.len() < label {
            areas.resize(label, 0);
        }
        areas[label - 1] += 1;
    }
    areas.iter().filter(|&&a| a >= min_area).count() as u32
}

/// Separable square max filter of the given radius.
fn max_filter(mask: &[f32], w: u32, h: u32, radius: u32) -> Vec<f32> {
    let (w, h, r) = (w as usize, h as usize, radius as usize);
    let mut horizontal = vec![0.0f32; mask.len()];
    for y in 0..h {
        let row = &mask[y * w..(y + 1) * w];
        for x in 0..w {
            let lo = x.saturating_sub(r);
            let hi = (x + r).min(w - 1);
            horizontal[y * w + x] = row[lo..=hi].iter().copied().fold(0.0, f32::max);
        }
    }
    let mut out = vec![0.0f32; mask.len()];
    for x in 0..w {
        for y in 0..h {
            let lo = y.saturating_sub(r);
            let hi = (y + r).min(h - 1);
            out[y * w + x] = (lo..=hi)
                .map(|yy| horizontal[yy * w + x])
                .fold(0.0, f32::max);
        }
    }
    out
}
