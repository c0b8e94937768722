//! Job repository: CRUD and conditional status transitions for `jobs`.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{now, parse_opt_ts, parse_ts, DatabaseError};
use crate::config::PipelineMode;
use crate::pipeline::model::{Job, JobStatus};

/// A raw job row from the database.
#[derive(Debug, Clone)]
struct JobRow {
    id: String,
    project_id: String,
    old_version_id: String,
    new_version_id: String,
    mode: String,
    status: String,
    total_pages: u32,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            old_version_id: row.get("old_version_id")?,
            new_version_id: row.get("new_version_id")?,
            mode: row.get("mode")?,
            status: row.get("status")?,
            total_pages: row.get("total_pages")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    fn into_job(self) -> Result<Job, DatabaseError> {
        Ok(Job {
            mode: PipelineMode::parse(&self.mode).ok_or(DatabaseError::Corrupt {
                column: "jobs.mode",
                value: self.mode.clone(),
            })?,
            status: JobStatus::parse(&self.status).ok_or(DatabaseError::Corrupt {
                column: "jobs.status",
                value: self.status.clone(),
            })?,
            created_at: parse_ts("jobs.created_at", &self.created_at)?,
            updated_at: parse_ts("jobs.updated_at", &self.updated_at)?,
            completed_at: parse_opt_ts("jobs.completed_at", self.completed_at)?,
            id: self.id,
            project_id: self.project_id,
            old_version_id: self.old_version_id,
            new_version_id: self.new_version_id,
            total_pages: self.total_pages,
            error_message: self.error_message,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub project_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

pub fn insert(conn: &Connection, job: &Job) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, project_id, old_version_id, new_version_id, mode, status,
         total_pages, error_message, created_at, updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            job.id,
            job.project_id,
            job.old_version_id,
            job.new_version_id,
            job.mode.as_str(),
            job.status.as_str(),
            job.total_pages,
            job.error_message,
            job.created_at.to_rfc3339(),
            job.updated_at.to_rfc3339(),
            job.completed_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Job>, DatabaseError> {
    conn.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
        .optional()?
        .map(JobRow::into_job)
        .transpose()
}

pub fn status_of(conn: &Connection, id: &str) -> Result<Option<JobStatus>, DatabaseError> {
    let status: Option<String> = conn
        .query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |r| r.get(0))
        .optional()?;
    status
        .map(|s| {
            JobStatus::parse(&s).ok_or(DatabaseError::Corrupt {
                column: "jobs.status",
                value: s,
            })
        })
        .transpose()
}

/// Queries jobs with filters, returning (jobs, total_count).
pub fn query(conn: &Connection, filter: &JobFilter) -> Result<(Vec<Job>, u64), DatabaseError> {
    let mut conditions = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(status) = filter.status {
        conditions.push(format!("status = ?{}", param_values.len() + 1));
        param_values.push(Box::new(status.as_str()));
    }
    if let Some(ref project_id) = filter.project_id {
        conditions.push(format!("project_id = ?{}", param_values.len() + 1));
        param_values.push(Box::new(project_id.clone()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

    let limit = filter.limit.unwrap_or(100) as i64;
    let offset = filter.offset.unwrap_or(0) as i64;
    param_values.push(Box::new(limit));
    param_values.push(Box::new(offset));
    let query_sql = format!(
        "SELECT * FROM jobs {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
        where_clause,
        param_values.len() - 1,
        param_values.len()
    );

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&query_sql)?;
    let rows: Vec<JobRow> = stmt
        .query_map(params_ref.as_slice(), JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let jobs = rows
        .into_iter()
        .map(JobRow::into_job)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((jobs, total))
}

/// Moves a job to `to` only if its current status is one of `from`.
/// Returns whether the row changed. Terminal targets stamp `completed_at`.
pub fn transition(
    conn: &Connection,
    id: &str,
    from: &[JobStatus],
    to: JobStatus,
    error_message: Option<&str>,
) -> Result<bool, DatabaseError> {
    if from.is_empty() {
        return Ok(false);
    }
    let placeholders: Vec<String> = (0..from.len()).map(|i| format!("?{}", i + 5)).collect();
    let sql = format!(
        "UPDATE jobs SET status = ?2, updated_at = ?3,
             error_message = COALESCE(?4, error_message),
             completed_at = CASE WHEN ?2 IN ('completed', 'failed', 'cancelled')
                                 THEN ?3 ELSE completed_at END
         WHERE id = ?1 AND status IN ({})",
        placeholders.join(", ")
    );

    let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
        Box::new(id.to_string()),
        Box::new(to.as_str()),
        Box::new(now()),
        Box::new(error_message.map(str::to_string)),
    ];
    for status in from {
        values.push(Box::new(status.as_str()));
    }
    let params_ref: Vec<&dyn rusqlite::types::ToSql> = values.iter().map(|p| p.as_ref()).collect();
    let changed = conn.execute(&sql, params_ref.as_slice())?;
    Ok(changed > 0)
}

/// Deletes a job and, by cascade, its stages, pairings and diff results.
pub fn delete(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    Ok(conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])? > 0)
}
