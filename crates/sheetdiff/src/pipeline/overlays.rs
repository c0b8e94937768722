//! Reviewer-supplied overlays that replace the generated one for display.

use chrono::Utc;
use log::info;

use crate::error::Result;
use crate::imaging::codec::decode;
use crate::pipeline::error::OrchestratorError;
use crate::pipeline::model::ManualOverlay;
use crate::pipeline::store::StageStore;
use crate::storage::ObjectStore;

/// Stores `png` and makes it the active overlay of the diff result,
/// deactivating any previous manual overlay.
pub fn set_manual_overlay(
    store: &StageStore,
    objects: &dyn ObjectStore,
    diff_result_id: &str,
    png: &[u8],
    author: &str,
) -> Result<ManualOverlay> {
    let diff = store
        .diff_result(diff_result_id)?
        .ok_or_else(|| OrchestratorError::DiffNotFound(diff_result_id.to_string()))?;
    // Reject uploads that are not images before they replace anything.
    decode(png)?;

    let id = uuid::Uuid::new_v4().to_string();
    let overlay_ref = objects.put(
        &format!("jobs/{}/pages/{}/manual/{}.png", diff.job_id, diff.page_number, id),
        png,
    )?;
    let overlay = ManualOverlay {
        id,
        diff_result_id: diff.id,
        overlay_ref,
        author: author.to_string(),
        is_active: true,
        created_at: Utc::now(),
    };
    store.activate_manual_overlay(&overlay)?;
    info!("Manual overlay {} set on diff {} by {}", overlay.id, overlay.diff_result_id, author);
    Ok(overlay)
}

/// Returns `false` when no manual overlay was active.
pub fn clear_manual_overlay(store: &StageStore, diff_result_id: &str) -> Result<bool> {
    Ok(store.deactivate_manual_overlay(diff_result_id)?)
}

pub fn active_manual_overlay(store: &StageStore, diff_result_id: &str) -> Result<Option<ManualOverlay>> {
    Ok(store.active_manual_overlay(diff_result_id)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{diff_repo, job_repo, Database};
    use crate::error::SheetDiffError;
    use crate::imaging::codec::encode_png;
    use crate::storage::MemoryObjectStore;
    use image::{Rgba, RgbaImage};

    fn setup() -> StageStore {
        let db = Database::open_in_memory().unwrap();
        db.with_tx(|tx| {
            job_repo::insert(tx, &job_repo::tests::sample_job("job-1"))?;
            diff_repo::insert_superseding(tx, &diff_repo::tests::sample_result("d1", "job-1", 1))?;
            Ok::<_, crate::db::DatabaseError>(())
        })
        .unwrap();
        StageStore::new(db)
    }

    fn png() -> Vec<u8> {
        encode_png(&RgbaImage::from_pixel(4, 4, Rgba([255, 0, 0, 255]))).unwrap()
    }

    #[test]
    fn test_set_replace_and_clear() {
        let store = setup();
        let objects = MemoryObjectStore::new();

        let first = set_manual_overlay(&store, &objects, "d1", &png(), "ana").unwrap();
        let second = set_manual_overlay(&store, &objects, "d1", &png(), "ben").unwrap();
        assert!(objects.exists(&first.overlay_ref).unwrap());

        let active = active_manual_overlay(&store, "d1").unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(active.author, "ben");

        assert!(clear_manual_overlay(&store, "d1").unwrap());
        assert!(!clear_manual_overlay(&store, "d1").unwrap());
        assert!(active_manual_overlay(&store, "d1").unwrap().is_none());
    }

    #[test]
    fn test_rejects_unknown_diff_and_non_images() {
        let store = setup();
        let objects = MemoryObjectStore::new();
        assert!(matches!(
            set_manual_overlay(&store, &objects, "nope", &png(), "ana"),
            Err(SheetDiffError::Orchestrator(OrchestratorError::DiffNotFound(_)))
        ));
        assert!(matches!(
            set_manual_overlay(&store, &objects, "d1", b"not a png", "ana"),
            Err(SheetDiffError::Image(_))
        ));
        assert!(objects.is_empty());
    }
}
