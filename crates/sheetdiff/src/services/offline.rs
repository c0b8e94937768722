//! Network-free stand-ins for the hosted model.

use crate::imaging::codec::decode;
use crate::services::{
    DiffMetadata, OcrDocument, ServiceError, SummaryContent, SummaryService, VisionService,
};

/// Share of changed ink above which a sheet is flagged as critically changed.
const CRITICAL_CHANGE_RATIO: f64 = 0.05;

/// Deterministic OCR and summary content derived from image facts and diff
/// metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineServices;

impl VisionService for OfflineServices {
    fn extract(&self, image_png: &[u8], _prompt: &str) -> Result<OcrDocument, ServiceError> {
        let image = decode(image_png).map_err(|e| ServiceError::MalformedResponse(e.to_string()))?;
        let mut doc = OcrDocument::default();
        doc.sections.insert(
            "image".to_string(),
            format!("{}x{} px sheet", image.width(), image.height()),
        );
        Ok(doc)
    }
}

impl SummaryService for OfflineServices {
    fn summarize(
        &self,
        _overlay_png: &[u8],
        metadata: &DiffMetadata,
        _prompt: &str,
    ) -> Result<SummaryContent, ServiceError> {
        if metadata.change_count == 0 {
            return Ok(SummaryContent {
                changes: vec![format!("No changes detected on {}", metadata.drawing_name)],
                critical_change: None,
                recommendations: Vec::new(),
            });
        }

        let changed = metadata.added_pixels + metadata.removed_pixels;
        let total = changed + metadata.overlap_pixels;
        let ratio = if total == 0 { 0.0 } else { changed as f64 / total as f64 };

        let mut changes = vec![format!(
            "{} changed region(s) on {}",
            metadata.change_count, metadata.drawing_name
        )];
        if metadata.added_pixels > 0 {
            changes.push(format!("{} px of linework added", metadata.added_pixels));
        }
        if metadata.removed_pixels > 0 {
            changes.push(format!("{} px of linework removed", metadata.removed_pixels));
        }

        let critical_change = (ratio > CRITICAL_CHANGE_RATIO).then(|| {
            format!(
                "{:.1}% of the ink on {} changed",
                ratio * 100.0,
                metadata.drawing_name
            )
        });

        let mut recommendations = vec![format!(
            "Review the highlighted regions on {} against the revision log",
            metadata.drawing_name
        )];
        if metadata.composite_mode == "binary" || metadata.alignment_score < 0.5 {
            recommendations.push("Verify the overlay manually; the automatic comparison was degraded".to_string());
        }

        Ok(SummaryContent {
            changes,
            critical_change,
            recommendations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::codec::encode_png;
    use image::{Rgba, RgbaImage};

    fn metadata(change_count: u32, added: u64, removed: u64, overlap: u64) -> DiffMetadata {
        DiffMetadata {
            drawing_name: "A-101".to_string(),
            page_number: 1,
            change_count,
            added_pixels: added,
            removed_pixels: removed,
            overlap_pixels: overlap,
            alignment_score: 0.9,
            composite_mode: "soft".to_string(),
            old_text: None,
            new_text: None,
        }
    }

    #[test]
    fn test_no_changes() {
        let content = OfflineServices.summarize(&[], &metadata(0, 0, 0, 100), "").unwrap();
        assert_eq!(content.changes, vec!["No changes detected on A-101".to_string()]);
        assert!(content.critical_change.is_none());
    }

    #[test]
    fn test_large_change_is_critical() {
        let content = OfflineServices.summarize(&[], &metadata(3, 400, 200, 1000), "").unwrap();
        assert_eq!(content.changes.len(), 3);
        assert!(content.critical_change.unwrap().starts_with("37.5%"));
    }

    #[test]
    fn test_small_change_is_not_critical() {
        let content = OfflineServices.summarize(&[], &metadata(1, 10, 0, 10_000), "").unwrap();
        assert!(content.critical_change.is_none());
        assert_eq!(content.recommendations.len(), 1);
    }

    #[test]
    fn test_extract_reports_dimensions() {
        let png = encode_png(&RgbaImage::from_pixel(12, 8, Rgba([255, 255, 255, 255]))).unwrap();
        let doc = OfflineServices.extract(&png, "").unwrap();
        assert_eq!(doc.sections["image"], "12x8 px sheet");
        assert!(OfflineServices.extract(b"junk", "").is_err());
    }
}
