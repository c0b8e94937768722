//! Manual overlay repository. A reviewer-supplied overlay replaces the
//! generated one for display; at most one is active per diff result.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{parse_ref, parse_ts, DatabaseError};
use crate::pipeline::model::ManualOverlay;

fn from_row(row: &Row<'_>) -> Result<(String, String, String, String, bool, String), rusqlite::Error> {
    Ok((
        row.get("id")?,
        row.get("diff_result_id")?,
        row.get("overlay_ref")?,
        row.get("author")?,
        row.get("is_active")?,
        row.get("created_at")?,
    ))
}

fn into_overlay(
    (id, diff_result_id, overlay_ref, author, is_active, created_at): (
        String,
        String,
        String,
        String,
        bool,
        String,
    ),
) -> Result<ManualOverlay, DatabaseError> {
    Ok(ManualOverlay {
        id,
        diff_result_id,
        overlay_ref: parse_ref("manual_overlays.overlay_ref", overlay_ref)?,
        author,
        is_active,
        created_at: parse_ts("manual_overlays.created_at", &created_at)?,
    })
}

/// Deactivates any active overlay of the diff result and inserts `overlay`
/// as active. Run inside a transaction.
pub fn activate(conn: &Connection, overlay: &ManualOverlay) -> Result<(), DatabaseError> {
    deactivate(conn, &overlay.diff_result_id)?;
    conn.execute(
        "INSERT INTO manual_overlays (id, diff_result_id, overlay_ref, author, is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)",
        params![
            overlay.id,
            overlay.diff_result_id,
            overlay.overlay_ref.as_str(),
            overlay.author,
            overlay.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Returns how many overlays were deactivated (0 or 1).
pub fn deactivate(conn: &Connection, diff_result_id: &str) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE manual_overlays SET is_active = 0 WHERE diff_result_id = ?1 AND is_active = 1",
        params![diff_result_id],
    )?)
}

pub fn active_for_diff(
    conn: &Connection,
    diff_result_id: &str,
) -> Result<Option<ManualOverlay>, DatabaseError> {
    conn.query_row(
        "SELECT * FROM manual_overlays WHERE diff_result_id = ?1 AND is_active = 1",
        params![diff_result_id],
        from_row,
    )
    .optional()?
    .map(into_overlay)
    .transpose()
}
