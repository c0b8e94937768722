//! Change summary repository. Each diff result has at most one active
//! summary; older ones stay as inactive history.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{parse_ts, DatabaseError};
use crate::pipeline::model::ChangeSummary;

#[derive(Debug, Clone)]
struct SummaryRow {
    id: String,
    diff_result_id: String,
    changes: String,
    critical_change: Option<String>,
    recommendations: String,
    is_active: bool,
    created_at: String,
}

impl SummaryRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            diff_result_id: row.get("diff_result_id")?,
            changes: row.get("changes")?,
            critical_change: row.get("critical_change")?,
            recommendations: row.get("recommendations")?,
            is_active: row.get("is_active")?,
            created_at: row.get("created_at")?,
        })
    }

    fn into_summary(self) -> Result<ChangeSummary, DatabaseError> {
        Ok(ChangeSummary {
            changes: serde_json::from_str(&self.changes)?,
            recommendations: serde_json::from_str(&self.recommendations)?,
            created_at: parse_ts("change_summaries.created_at", &self.created_at)?,
            id: self.id,
            diff_result_id: self.diff_result_id,
            critical_change: self.critical_change,
            is_active: self.is_active,
        })
    }
}

/// Deactivates the current summary of the diff result and inserts
/// `summary` as the active one. Run inside a transaction.
pub fn activate(conn: &Connection, summary: &ChangeSummary) -> Result<usize, DatabaseError> {
    let deactivated = conn.execute(
        "UPDATE change_summaries SET is_active = 0 WHERE diff_result_id = ?1 AND is_active = 1",
        params![summary.diff_result_id],
    )?;
    conn.execute(
        "INSERT INTO change_summaries (id, diff_result_id, changes, critical_change,
            recommendations, is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
        params![
            summary.id,
            summary.diff_result_id,
            serde_json::to_string(&summary.changes)?,
            summary.critical_change,
            serde_json::to_string(&summary.recommendations)?,
            summary.created_at.to_rfc3339(),
        ],
    )?;
    Ok(deactivated)
}

pub fn active_for_diff(
    conn: &Connection,
    diff_result_id: &str,
) -> Result<Option<ChangeSummary>, DatabaseError> {
    conn.query_row(
        "SELECT * FROM change_summaries WHERE diff_result_id = ?1 AND is_active = 1",
        params![diff_result_id],
        SummaryRow::from_row,
    )
    .optional()?
    .map(SummaryRow::into_summary)
    .transpose()
}

/// All summaries of a diff result, oldest first.
pub fn history(conn: &Connection, diff_result_id: &str) -> Result<Vec<ChangeSummary>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM change_summaries WHERE diff_result_id = ?1 ORDER BY created_at, rowid",
    )?;
    let rows: Vec<SummaryRow> = stmt
        .query_map(params![diff_result_id], SummaryRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(SummaryRow::into_summary).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{diff_repo, job_repo, Database};
    use chrono::Utc;

    fn summary(id: &str, change: &str) -> ChangeSummary {
        ChangeSummary {
            id: id.to_string(),
            diff_result_id: "d1".to_string(),
            changes: vec![change.to_string()],
            critical_change: None,
            recommendations: vec!["Verify door schedule".to_string()],
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_tx(|tx| {
            job_repo::insert(tx, &job_repo::tests::sample_job("job-1"))?;
            diff_repo::insert_superseding(tx, &diff_repo::tests::sample_result("d1", "job-1", 0))?;
            Ok::<_, crate::db::DatabaseError>(())
        })
        .unwrap();
        db
    }

    #[test]
    fn test_regeneration_keeps_one_active() {
        let db = setup();
        for i in 0..3 {
            db.with_tx(|tx| activate(tx, &summary(&format!("s{}", i), &format!("change {}", i))))
                .unwrap();
        }

        let active = db.with_conn(|c| active_for_diff(c, "d1")).unwrap().unwrap();
        assert_eq!(active.id, "s2");
        assert_eq!(active.changes, vec!["change 2".to_string()]);

        let history = db.with_conn(|c| history(c, "d1")).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.iter().filter(|s| s.is_active).count(), 1);
    }

    #[test]
    fn test_no_summary_yet() {
        let db = setup();
        assert!(db.with_conn(|c| active_for_diff(c, "d1")).unwrap().is_none());
    }
}
