//! Page repository: rasterized pages per version and the page pairing of
//! each job.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{now, parse_ref, DatabaseError};
use crate::pipeline::model::{JobPage, Page};
use crate::storage::ObjectRef;

#[derive(Debug, Clone)]
struct PageRow {
    version_id: String,
    page_number: u32,
    drawing_name: String,
    image_ref: String,
    width: u32,
    height: u32,
    ocr_ref: Option<String>,
    source_name: Option<String>,
}

impl PageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            version_id: row.get("version_id")?,
            page_number: row.get("page_number")?,
            drawing_name: row.get("drawing_name")?,
            image_ref: row.get("image_ref")?,
            width: row.get("width")?,
            height: row.get("height")?,
            ocr_ref: row.get("ocr_ref")?,
            source_name: row.get("source_name")?,
        })
    }

    fn into_page(self) -> Result<Page, DatabaseError> {
        Ok(Page {
            version_id: self.version_id,
            page_number: self.page_number,
            drawing_name: self.drawing_name,
            image_ref: parse_ref("pages.image_ref", self.image_ref)?,
            width: self.width,
            height: self.height,
            ocr_ref: self
                .ocr_ref
                .map(|r| parse_ref("pages.ocr_ref", r))
                .transpose()?,
            source_name: self.source_name,
        })
    }
}

/// Inserts or replaces a page. Re-ingesting a page keeps its OCR reference
/// only if the caller carries it over.
pub fn upsert(conn: &Connection, page: &Page) -> Result<(), DatabaseError> {
    let ts = now();
    conn.execute(
        "INSERT INTO pages (version_id, page_number, drawing_name, image_ref, width, height,
                            ocr_ref, source_name, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
         ON CONFLICT(version_id, page_number) DO UPDATE SET
            drawing_name = excluded.drawing_name,
            image_ref = excluded.image_ref,
            width = excluded.width,
            height = excluded.height,
            ocr_ref = excluded.ocr_ref,
            source_name = excluded.source_name,
            updated_at = excluded.updated_at",
        params![
            page.version_id,
            page.page_number,
            page.drawing_name,
            page.image_ref.as_str(),
            page.width,
            page.height,
            page.ocr_ref.as_ref().map(|r| r.as_str()),
            page.source_name,
            ts,
        ],
    )?;
    Ok(())
}

pub fn find(conn: &Connection, version_id: &str, page_number: u32) -> Result<Option<Page>, DatabaseError> {
    conn.query_row(
        "SELECT * FROM pages WHERE version_id = ?1 AND page_number = ?2",
        params![version_id, page_number],
        PageRow::from_row,
    )
    .optional()?
    .map(PageRow::into_page)
    .transpose()
}

pub fn list_for_version(conn: &Connection, version_id: &str) -> Result<Vec<Page>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM pages WHERE version_id = ?1 ORDER BY page_number")?;
    let rows: Vec<PageRow> = stmt
        .query_map(params![version_id], PageRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(PageRow::into_page).collect()
}

pub fn set_ocr_ref(
    conn: &Connection,
    version_id: &str,
    page_number: u32,
    ocr_ref: &ObjectRef,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE pages SET ocr_ref = ?3, updated_at = ?4 WHERE version_id = ?1 AND page_number = ?2",
        params![version_id, page_number, ocr_ref.as_str(), now()],
    )?;
    Ok(changed > 0)
}

pub fn insert_job_page(conn: &Connection, page: &JobPage) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO job_pages (job_id, page_number, old_page_number, new_page_number, drawing_name)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            page.job_id,
            page.page_number,
            page.old_page_number,
            page.new_page_number,
            page.drawing_name
        ],
    )?;
    Ok(())
}

fn job_page_from_row(row: &Row<'_>) -> Result<JobPage, rusqlite::Error> {
    Ok(JobPage {
        job_id: row.get("job_id")?,
        page_number: row.get("page_number")?,
        old_page_number: row.get("old_page_number")?,
        new_page_number: row.get("new_page_number")?,
        drawing_name: row.get("drawing_name")?,
    })
}

pub fn find_job_page(
    conn: &Connection,
    job_id: &str,
    page_number: u32,
) -> Result<Option<JobPage>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM job_pages WHERE job_id = ?1 AND page_number = ?2",
            params![job_id, page_number],
            job_page_from_row,
        )
        .optional()?)
}

pub fn list_job_pages(conn: &Connection, job_id: &str) -> Result<Vec<JobPage>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM job_pages WHERE job_id = ?1 ORDER BY page_number")?;
    let pages = stmt
        .query_map(params![job_id], job_page_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pages)
}
