//! Snapshots repository.
//!
//! A snapshot is keyed by `(academic_year, term, week_no)`. Saving an existing
//! key replaces every content column in place, so the row id stays stable
//! across re-captures of the same week.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use xiqueer_core::{CourseOccurrence, NewSnapshot, ScheduleSnapshot};

use crate::error::Result;

const SNAPSHOT_COLUMNS: &str = "id, captured_at, host, path, academic_year, term, week_no, \
     max_week, period_start, period_end, request_digest, courses";

/// Repository for snapshot operations.
pub struct SnapshotRepo;

impl SnapshotRepo {
    /// Insert or replace the snapshot for its week, returning the row id.
    pub fn upsert(conn: &Connection, snapshot: &NewSnapshot) -> Result<i64> {
        let courses = serde_json::to_string(&snapshot.courses)?;

        let id = conn.query_row(
            "INSERT INTO snapshots (captured_at, host, path, academic_year, term, week_no,
                                    max_week, period_start, period_end, request_digest, courses)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(academic_year, term, week_no) DO UPDATE SET
                captured_at = excluded.captured_at,
                host = excluded.host,
                path = excluded.path,
                max_week = excluded.max_week,
                period_start = excluded.period_start,
                period_end = excluded.period_end,
                request_digest = excluded.request_digest,
                courses = excluded.courses
             RETURNING id",
            params![
                snapshot.captured_at.to_rfc3339(),
                snapshot.host,
                snapshot.path,
                snapshot.academic_year,
                snapshot.term,
                snapshot.week_no,
                snapshot.max_week,
                snapshot.period_start,
                snapshot.period_end,
                snapshot.request_digest,
                courses,
            ],
            |row| row.get(0),
        )?;

        Ok(id)
    }

    /// Get a snapshot by ID.
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<ScheduleSnapshot>> {
        let sql = format!("SELECT {} FROM snapshots WHERE id = ?1", SNAPSHOT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;

        let raw = stmt.query_row([id], read_row).optional()?;
        raw.map(RawSnapshot::into_snapshot).transpose()
    }

    /// All snapshots ordered by academic year, term and week.
    pub fn list(conn: &Connection) -> Result<Vec<ScheduleSnapshot>> {
        let sql = format!(
            "SELECT {} FROM snapshots ORDER BY academic_year, term, week_no",
            SNAPSHOT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;

        let raws: Vec<RawSnapshot> = stmt
            .query_map([], read_row)?
            .collect::<std::result::Result<_, _>>()?;

        raws.into_iter().map(RawSnapshot::into_snapshot).collect()
    }

    /// Snapshots whose id is in `ids`; unknown ids are skipped.
    pub fn get_by_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<ScheduleSnapshot>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM snapshots WHERE id IN ({})
             ORDER BY academic_year, term, week_no",
            SNAPSHOT_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;

        let raws: Vec<RawSnapshot> = stmt
            .query_map(params_from_iter(ids.iter()), read_row)?
            .collect::<std::result::Result<_, _>>()?;

        raws.into_iter().map(RawSnapshot::into_snapshot).collect()
    }

    /// Delete every snapshot, returning how many were removed.
    pub fn clear(conn: &Connection) -> Result<usize> {
        let deleted = conn.execute("DELETE FROM snapshots", [])?;
        Ok(deleted)
    }

    /// Number of stored snapshots.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Row as read from SQLite, before the course list is decoded.
struct RawSnapshot {
    id: i64,
    captured_at: String,
    host: String,
    path: String,
    academic_year: String,
    term: String,
    week_no: u32,
    max_week: u32,
    period_start: String,
    period_end: String,
    request_digest: String,
    courses: String,
}

impl RawSnapshot {
    fn into_snapshot(self) -> Result<ScheduleSnapshot> {
        let courses: Vec<CourseOccurrence> = serde_json::from_str(&self.courses)?;

        Ok(ScheduleSnapshot {
            id: self.id,
            captured_at: parse_datetime(&self.captured_at),
            host: self.host,
            path: self.path,
            academic_year: self.academic_year,
            term: self.term,
            week_no: self.week_no,
            max_week: self.max_week,
            period_start: self.period_start,
            period_end: self.period_end,
            request_digest: self.request_digest,
            courses,
        })
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawSnapshot> {
    Ok(RawSnapshot {
        id: row.get(0)?,
        captured_at: row.get(1)?,
        host: row.get(2)?,
        path: row.get(3)?,
        academic_year: row.get(4)?,
        term: row.get(5)?,
        week_no: row.get(6)?,
        max_week: row.get(7)?,
        period_start: row.get(8)?,
        period_end: row.get(9)?,
        request_digest: row.get(10)?,
        courses: row.get(11)?,
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            tracing::warn!("Unreadable capture time {:?}, using now", s);
            Utc::now()
        })
}
