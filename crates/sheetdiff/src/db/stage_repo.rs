//! Stage repository: one row per `(job, stage, page)`.
//!
//! Every status change here is a conditional UPDATE; callers learn whether
//! the row actually moved from the returned flag and build idempotence on
//! top of that.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{now, parse_opt_ts, parse_ts, DatabaseError};
use crate::pipeline::model::{FanIn, JobStage, StageKey, StageKind, StageStatus, NO_PAGE};

#[derive(Debug, Clone)]
struct StageRow {
    job_id: String,
    stage: String,
    page_key: i64,
    status: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
    error_message: Option<String>,
    result_ref: Option<String>,
    retry_count: u32,
    exhausted: bool,
    fan_in_expected: Option<u32>,
    fan_in_completed: u32,
    fan_in_failed: u32,
    stage_metadata: Option<String>,
}

impl StageRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            stage: row.get("stage")?,
            page_key: row.get("page_key")?,
            status: row.get("status")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
            error_message: row.get("error_message")?,
            result_ref: row.get("result_ref")?,
            retry_count: row.get("retry_count")?,
            exhausted: row.get("exhausted")?,
            fan_in_expected: row.get("fan_in_expected")?,
            fan_in_completed: row.get("fan_in_completed")?,
            fan_in_failed: row.get("fan_in_failed")?,
            stage_metadata: row.get("stage_metadata")?,
        })
    }

    fn into_stage(self) -> Result<JobStage, DatabaseError> {
        let stage = StageKind::parse(&self.stage).ok_or(DatabaseError::Corrupt {
            column: "job_stages.stage",
            value: self.stage.clone(),
        })?;
        let status = StageStatus::parse(&self.status).ok_or(DatabaseError::Corrupt {
            column: "job_stages.status",
            value: self.status.clone(),
        })?;
        let page_number = if self.page_key == NO_PAGE {
            None
        } else {
            Some(u32::try_from(self.page_key).map_err(|_| DatabaseError::Corrupt {
                column: "job_stages.page_key",
                value: self.page_key.to_string(),
            })?)
        };
        let stage_metadata = self
            .stage_metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(JobStage {
            job_id: self.job_id,
            stage,
            page_number,
            status,
            started_at: parse_opt_ts("job_stages.started_at", self.started_at)?,
            completed_at: parse_opt_ts("job_stages.completed_at", self.completed_at)?,
            updated_at: parse_ts("job_stages.updated_at", &self.updated_at)?,
            error_message: self.error_message,
            result_ref: self.result_ref,
            retry_count: self.retry_count,
            exhausted: self.exhausted,
            fan_in: self.fan_in_expected.map(|expected| FanIn {
                expected,
                completed: self.fan_in_completed,
                failed: self.fan_in_failed,
            }),
            stage_metadata,
        })
    }
}

/// Inserts a pending stage row. `fan_in_expected` is set only on the
/// streaming summary parent.
pub fn insert_pending(
    conn: &Connection,
    key: &StageKey,
    fan_in_expected: Option<u32>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO job_stages (job_id, stage, page_key, status, updated_at, fan_in_expected)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
        params![
            key.job_id,
            key.stage.as_str(),
            key.page_key(),
            now(),
            fan_in_expected
        ],
    )?;
    Ok(())
}

pub fn find(conn: &Connection, key: &StageKey) -> Result<Option<JobStage>, DatabaseError> {
    conn.query_row(
        "SELECT * FROM job_stages WHERE job_id = ?1 AND stage = ?2 AND page_key = ?3",
        params![key.job_id, key.stage.as_str(), key.page_key()],
        StageRow::from_row,
    )
    .optional()?
    .map(StageRow::into_stage)
    .transpose()
}

/// All stages of a job, ordered by stage then page.
pub fn list_for_job(conn: &Connection, job_id: &str) -> Result<Vec<JobStage>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM job_stages WHERE job_id = ?1
         ORDER BY CASE stage WHEN 'ocr' THEN 0 WHEN 'diff' THEN 1 ELSE 2 END, page_key",
    )?;
    let rows: Vec<StageRow> = stmt
        .query_map(params![job_id], StageRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(StageRow::into_stage).collect()
}

/// Moves the stage to `in_progress` if its status is one of `from`.
pub fn start(conn: &Connection, key: &StageKey, from: &[StageStatus]) -> Result<bool, DatabaseError> {
    let mut changed = 0;
    let ts = now();
    for status in from {
        changed += conn.execute(
            "UPDATE job_stages
             SET status = 'in_progress', started_at = ?4, updated_at = ?4
             WHERE job_id = ?1 AND stage = ?2 AND page_key = ?3 AND status = ?5",
            params![key.job_id, key.stage.as_str(), key.page_key(), ts, status.as_str()],
        )?;
        if changed > 0 {
            break;
        }
    }
    Ok(changed > 0)
}

/// Counts a redelivery against a stage that stays in its current status.
pub fn bump_retry_count(conn: &Connection, key: &StageKey) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE job_stages SET retry_count = retry_count + 1, updated_at = ?4
         WHERE job_id = ?1 AND stage = ?2 AND page_key = ?3",
        params![key.job_id, key.stage.as_str(), key.page_key(), now()],
    )?;
    Ok(changed > 0)
}

/// Marks the stage completed. Returns `false` when it already was (or was
/// skipped), in which case nothing is written.
pub fn complete(
    conn: &Connection,
    key: &StageKey,
    result_ref: Option<&str>,
) -> Result<bool, DatabaseError> {
    let ts = now();
    let changed = conn.execute(
        "UPDATE job_stages
         SET status = 'completed', completed_at = ?4, updated_at = ?4,
             result_ref = ?5, error_message = NULL
         WHERE job_id = ?1 AND stage = ?2 AND page_key = ?3
           AND status IN ('pending', 'in_progress', 'failed')",
        params![key.job_id, key.stage.as_str(), key.page_key(), ts, result_ref],
    )?;
    Ok(changed > 0)
}

/// Replaces the result reference of an already completed stage.
pub fn set_result_ref(
    conn: &Connection,
    key: &StageKey,
    result_ref: Option<&str>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE job_stages SET result_ref = ?4, updated_at = ?5
         WHERE job_id = ?1 AND stage = ?2 AND page_key = ?3",
        params![key.job_id, key.stage.as_str(), key.page_key(), result_ref, now()],
    )?;
    Ok(changed > 0)
}

/// Records a failed attempt: bumps `retry_count` and stores the error.
/// Only pending or in-progress stages can fail.
pub fn fail(conn: &Connection, key: &StageKey, error: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE job_stages
         SET status = 'failed', error_message = ?4, retry_count = retry_count + 1,
             updated_at = ?5
         WHERE job_id = ?1 AND stage = ?2 AND page_key = ?3
           AND status IN ('pending', 'in_progress')",
        params![key.job_id, key.stage.as_str(), key.page_key(), error, now()],
    )?;
    Ok(changed > 0)
}

/// Sets or clears the exhausted flag. Returns whether the flag flipped.
pub fn set_exhausted(conn: &Connection, key: &StageKey, exhausted: bool) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE job_stages SET exhausted = ?4, updated_at = ?5
         WHERE job_id = ?1 AND stage = ?2 AND page_key = ?3 AND exhausted != ?4",
        params![key.job_id, key.stage.as_str(), key.page_key(), exhausted, now()],
    )?;
    Ok(changed > 0)
}

/// Resets a failed stage to pending for a manual retry.
pub fn reset_failed(conn: &Connection, key: &StageKey) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE job_stages
         SET status = 'pending', exhausted = 0, retry_count = 0, updated_at = ?4
         WHERE job_id = ?1 AND stage = ?2 AND page_key = ?3 AND status = 'failed'",
        params![key.job_id, key.stage.as_str(), key.page_key(), now()],
    )?;
    Ok(changed > 0)
}

/// Marks pending stages of a job as skipped. With `page` set, only that
/// page's rows are touched; `stages` limits which stage kinds qualify.
pub fn skip_pending(
    conn: &Connection,
    job_id: &str,
    page: Option<u32>,
    stages: &[StageKind],
) -> Result<usize, DatabaseError> {
    let ts = now();
    let mut changed = 0;
    for stage in stages {
        changed += match page {
            Some(p) => conn.execute(
                "UPDATE job_stages SET status = 'skipped', updated_at = ?4
                 WHERE job_id = ?1 AND stage = ?2 AND page_key = ?3 AND status = 'pending'",
                params![job_id, stage.as_str(), i64::from(p), ts],
            )?,
            None => conn.execute(
                "UPDATE job_stages SET status = 'skipped', updated_at = ?3
                 WHERE job_id = ?1 AND stage = ?2 AND status = 'pending'",
                params![job_id, stage.as_str(), ts],
            )?,
        };
    }
    Ok(changed)
}

/// Returns skipped stages of one page to pending, so a manually retried
/// upstream stage can chain into them again.
pub fn reopen_skipped(
    conn: &Connection,
    job_id: &str,
    page: u32,
    stages: &[StageKind],
) -> Result<usize, DatabaseError> {
    let ts = now();
    let mut changed = 0;
    for stage in stages {
        changed += conn.execute(
            "UPDATE job_stages SET status = 'pending', updated_at = ?4
             WHERE job_id = ?1 AND stage = ?2 AND page_key = ?3 AND status = 'skipped'",
            params![job_id, stage.as_str(), i64::from(page), ts],
        )?;
    }
    Ok(changed)
}

/// Adjusts the fan-in counters of a parent stage and returns the new
/// totals. `None` when the row has no fan-in.
pub fn adjust_fan_in(
    conn: &Connection,
    key: &StageKey,
    completed_delta: i64,
    failed_delta: i64,
) -> Result<Option<FanIn>, DatabaseError> {
    conn.execute(
        "UPDATE job_stages
         SET fan_in_completed = MAX(fan_in_completed + ?4, 0),
             fan_in_failed = MAX(fan_in_failed + ?5, 0),
             updated_at = ?6
         WHERE job_id = ?1 AND stage = ?2 AND page_key = ?3 AND fan_in_expected IS NOT NULL",
        params![
            key.job_id,
            key.stage.as_str(),
            key.page_key(),
            completed_delta,
            failed_delta,
            now()
        ],
    )?;
    Ok(find(conn, key)?.and_then(|s| s.fan_in))
}

pub fn set_metadata(
    conn: &Connection,
    key: &StageKey,
    metadata: &serde_json::Value,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE job_stages SET stage_metadata = ?4, updated_at = ?5
         WHERE job_id = ?1 AND stage = ?2 AND page_key = ?3",
        params![
            key.job_id,
            key.stage.as_str(),
            key.page_key(),
            serde_json::to_string(metadata)?,
            now()
        ],
    )?;
    Ok(())
}

/// Pending or in-progress stages of live jobs not touched since `before`.
pub fn stalled(conn: &Connection, before: DateTime<Utc>) -> Result<Vec<JobStage>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT s.* FROM job_stages s JOIN jobs j ON j.id = s.job_id
         WHERE s.status IN ('pending', 'in_progress')
           AND j.status IN ('created', 'in_progress')
           AND s.updated_at < ?1
           AND NOT (s.stage = 'summary' AND s.fan_in_expected IS NOT NULL)
         ORDER BY s.updated_at",
    )?;
    let rows: Vec<StageRow> = stmt
        .query_map(params![before.to_rfc3339()], StageRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(StageRow::into_stage).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_repo;
    use crate::db::Database;

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|c| job_repo::insert(c, &job_repo::tests::sample_job("job-1")))
            .unwrap();
        db
    }

    #[test]
    fn test_insert_and_find() {
        let db = setup();
        let key = StageKey::page("job-1", StageKind::Diff, 0);
        db.with_conn(|c| insert_pending(c, &key, None)).unwrap();

        let stage = db.with_conn(|c| find(c, &key)).unwrap().unwrap();
        assert_eq!(stage.status, StageStatus::Pending);
        assert_eq!(stage.page_number, Some(0));
        assert_eq!(stage.key(), key);
        assert!(stage.fan_in.is_none());
    }

    #[test]
    fn test_complete_only_once() {
        let db = setup();
        let key = StageKey::job_level("job-1", StageKind::Ocr);
        db.with_conn(|c| insert_pending(c, &key, None)).unwrap();

        assert!(db
            .with_conn(|c| start(c, &key, &[StageStatus::Pending]))
            .unwrap());
        assert!(db.with_conn(|c| complete(c, &key, Some("r1"))).unwrap());
        assert!(!db.with_conn(|c| complete(c, &key, Some("r2"))).unwrap());

        let stage = db.with_conn(|c| find(c, &key)).unwrap().unwrap();
        assert_eq!(stage.status, StageStatus::Completed);
        assert_eq!(stage.result_ref.as_deref(), Some("r1"));
        assert!(stage.completed_at.is_some());
    }

    #[test]
    fn test_fail_counts_retries_but_not_on_completed() {
        let db = setup();
        let key = StageKey::page("job-1", StageKind::Ocr, 2);
        db.with_conn(|c| insert_pending(c, &key, None)).unwrap();

        assert!(db.with_conn(|c| fail(c, &key, "timeout")).unwrap());
        let stage = db.with_conn(|c| find(c, &key)).unwrap().unwrap();
        assert_eq!(stage.status, StageStatus::Failed);
        assert_eq!(stage.retry_count, 1);

        db.with_conn(|c| start(c, &key, &[StageStatus::Failed])).unwrap();
        db.with_conn(|c| complete(c, &key, None)).unwrap();
        assert!(!db.with_conn(|c| fail(c, &key, "late")).unwrap());
    }

    #[test]
    fn test_fan_in_counters() {
        let db = setup();
        let parent = StageKey::job_level("job-1", StageKind::Summary);
        db.with_conn(|c| insert_pending(c, &parent, Some(2))).unwrap();

        let fan_in = db
            .with_conn(|c| adjust_fan_in(c, &parent, 1, 0))
            .unwrap()
            .unwrap();
        assert_eq!(fan_in, FanIn { expected: 2, completed: 1, failed: 0 });
        assert!(!fan_in.is_settled());

        let fan_in = db
            .with_conn(|c| adjust_fan_in(c, &parent, 0, 1))
            .unwrap()
            .unwrap();
        assert!(fan_in.is_settled());

        let fan_in = db
            .with_conn(|c| adjust_fan_in(c, &parent, 0, -5))
            .unwrap()
            .unwrap();
        assert_eq!(fan_in.failed, 0);
    }

    #[test]
    fn test_skip_pending_for_one_page() {
        let db = setup();
        db.with_conn(|c| {
            for page in 0..2 {
                for stage in StageKind::ALL {
                    insert_pending(c, &StageKey::page("job-1", stage, page), None)?;
                }
            }
            Ok(())
        })
        .unwrap();

        let skipped = db
            .with_conn(|c| skip_pending(c, "job-1", Some(1), &[StageKind::Diff, StageKind::Summary]))
            .unwrap();
        assert_eq!(skipped, 2);

        let stages = db.with_conn(|c| list_for_job(c, "job-1")).unwrap();
        let skipped: Vec<_> = stages
            .iter()
            .filter(|s| s.status == StageStatus::Skipped)
            .map(|s| s.key())
            .collect();
        assert_eq!(
            skipped,
            vec![
                StageKey::page("job-1", StageKind::Diff, 1),
                StageKey::page("job-1", StageKind::Summary, 1),
            ]
        );
    }

    #[test]
    fn test_exhausted_flag_flips_once() {
        let db = setup();
        let key = StageKey::page("job-1", StageKind::Diff, 0);
        db.with_conn(|c| insert_pending(c, &key, None)).unwrap();

        assert!(db.with_conn(|c| set_exhausted(c, &key, true)).unwrap());
        assert!(!db.with_conn(|c| set_exhausted(c, &key, true)).unwrap());
        assert!(db.with_conn(|c| set_exhausted(c, &key, false)).unwrap());
    }

    #[test]
    fn test_stalled_excludes_fresh_and_terminal() {
        let db = setup();
        let key = StageKey::job_level("job-1", StageKind::Ocr);
        db.with_conn(|c| insert_pending(c, &key, None)).unwrap();

        let future = Utc::now() + chrono::Duration::minutes(5);
        let past = Utc::now() - chrono::Duration::minutes(5);
        assert_eq!(db.with_conn(|c| stalled(c, future)).unwrap().len(), 1);
        assert!(db.with_conn(|c| stalled(c, past)).unwrap().is_empty());

        db.with_conn(|c| {
            job_repo::transition(c, "job-1", &[crate::pipeline::model::JobStatus::Created],
                crate::pipeline::model::JobStatus::Cancelled, None)
        })
        .unwrap();
        assert!(db.with_conn(|c| stalled(c, future)).unwrap().is_empty());
    }
}
