//! Diff result repository.
//!
//! At most one result per `(job, page)` is current (`superseded_by IS
//! NULL`); a correction inserts a new row and points its predecessor at it.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{parse_ref, parse_ts, DatabaseError};
use crate::imaging::CompositeMode;
use crate::pipeline::model::DiffResult;

#[derive(Debug, Clone)]
struct DiffRow {
    id: String,
    job_id: String,
    page_number: u32,
    drawing_name: String,
    change_count: u32,
    alignment_score: f64,
    added_pixels: i64,
    removed_pixels: i64,
    overlap_pixels: i64,
    overlay_ref: String,
    baseline_ref: String,
    revised_ref: String,
    composite_mode: String,
    alignment_report: Option<String>,
    superseded_by: Option<String>,
    created_at: String,
}

impl DiffRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            page_number: row.get("page_number")?,
            drawing_name: row.get("drawing_name")?,
            change_count: row.get("change_count")?,
            alignment_score: row.get("alignment_score")?,
            added_pixels: row.get("added_pixels")?,
            removed_pixels: row.get("removed_pixels")?,
            overlap_pixels: row.get("overlap_pixels")?,
            overlay_ref: row.get("overlay_ref")?,
            baseline_ref: row.get("baseline_ref")?,
            revised_ref: row.get("revised_ref")?,
            composite_mode: row.get("composite_mode")?,
            alignment_report: row.get("alignment_report")?,
            superseded_by: row.get("superseded_by")?,
            created_at: row.get("created_at")?,
        })
    }

    fn into_result(self) -> Result<DiffResult, DatabaseError> {
        let count = |column: &'static str, v: i64| {
            u64::try_from(v).map_err(|_| DatabaseError::Corrupt {
                column,
                value: v.to_string(),
            })
        };
        Ok(DiffResult {
            added_pixels: count("diff_results.added_pixels", self.added_pixels)?,
            removed_pixels: count("diff_results.removed_pixels", self.removed_pixels)?,
            overlap_pixels: count("diff_results.overlap_pixels", self.overlap_pixels)?,
            overlay_ref: parse_ref("diff_results.overlay_ref", self.overlay_ref)?,
            baseline_ref: parse_ref("diff_results.baseline_ref", self.baseline_ref)?,
            revised_ref: parse_ref("diff_results.revised_ref", self.revised_ref)?,
            composite_mode: CompositeMode::parse(&self.composite_mode).ok_or(
                DatabaseError::Corrupt {
                    column: "diff_results.composite_mode",
                    value: self.composite_mode.clone(),
                },
            )?,
            alignment_report: self
                .alignment_report
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: parse_ts("diff_results.created_at", &self.created_at)?,
            id: self.id,
            job_id: self.job_id,
            page_number: self.page_number,
            drawing_name: self.drawing_name,
            change_count: self.change_count,
            alignment_score: self.alignment_score,
            superseded_by: self.superseded_by,
        })
    }
}

/// Inserts `result` as the current result for its page, superseding the
/// previous one. Returns the superseded id. Run inside a transaction.
pub fn insert_superseding(
    conn: &Connection,
    result: &DiffResult,
) -> Result<Option<String>, DatabaseError> {
    let previous = current_for_page(conn, &result.job_id, result.page_number)?.map(|r| r.id);
    if let Some(ref prev) = previous {
        conn.execute(
            "UPDATE diff_results SET superseded_by = ?2 WHERE id = ?1",
            params![prev, result.id],
        )?;
    }

    let report = result
        .alignment_report
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO diff_results (id, job_id, page_number, drawing_name, change_count,
            alignment_score, added_pixels, removed_pixels, overlap_pixels, overlay_ref,
            baseline_ref, revised_ref, composite_mode, alignment_report, superseded_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, NULL, ?15)",
        params![
            result.id,
            result.job_id,
            result.page_number,
            result.drawing_name,
            result.change_count,
            result.alignment_score,
            result.added_pixels as i64,
            result.removed_pixels as i64,
            result.overlap_pixels as i64,
            result.overlay_ref.as_str(),
            result.baseline_ref.as_str(),
            result.revised_ref.as_str(),
            result.composite_mode.as_str(),
            report,
            result.created_at.to_rfc3339(),
        ],
    )?;
    Ok(previous)
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<DiffResult>, DatabaseError> {
    conn.query_row(
        "SELECT * FROM diff_results WHERE id = ?1",
        params![id],
        DiffRow::from_row,
    )
    .optional()?
    .map(DiffRow::into_result)
    .transpose()
}

pub fn current_for_page(
    conn: &Connection,
    job_id: &str,
    page_number: u32,
) -> Result<Option<DiffResult>, DatabaseError> {
    conn.query_row(
        "SELECT * FROM diff_results
         WHERE job_id = ?1 AND page_number = ?2 AND superseded_by IS NULL",
        params![job_id, page_number],
        DiffRow::from_row,
    )
    .optional()?
    .map(DiffRow::into_result)
    .transpose()
}

/// Current results of a job, by page.
pub fn list_current(conn: &Connection, job_id: &str) -> Result<Vec<DiffResult>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM diff_results WHERE job_id = ?1 AND superseded_by IS NULL
         ORDER BY page_number",
    )?;
    let rows: Vec<DiffRow> = stmt
        .query_map(params![job_id], DiffRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(DiffRow::into_result).collect()
}

/// Every result ever produced for a page, oldest first.
pub fn history_for_page(
    conn: &Connection,
    job_id: &str,
    page_number: u32,
) -> Result<Vec<DiffResult>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM diff_results WHERE job_id = ?1 AND page_number = ?2
         ORDER BY created_at, rowid",
    )?;
    let rows: Vec<DiffRow> = stmt
        .query_map(params![job_id, page_number], DiffRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(DiffRow::into_result).collect()
}
