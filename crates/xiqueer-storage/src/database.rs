//! High-level database interface.

use std::collections::BTreeMap;
use std::path::PathBuf;

use directories::ProjectDirs;
use tracing::{debug, info};
use xiqueer_core::{semester_title, NewSnapshot, ScheduleSnapshot, SemesterGroup};

use crate::error::{Result, StorageError};
use crate::models::Config;
use crate::pool::ConnectionPool;
use crate::repository::{ConfigRepo, SnapshotRepo};

/// Snapshot store and settings, shared by the capture pipeline and the CLI.
#[derive(Clone)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Open the database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Open the database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::open(&path)?;
        debug!("Store journal mode: {}", pool.journal_mode());

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "xiqueer", "xiqueer-catch")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().join("xiqueer.db"))
    }

    // === Snapshots ===

    /// Save a snapshot, replacing any stored snapshot of the same week.
    pub fn save_snapshot(&self, snapshot: &NewSnapshot) -> Result<i64> {
        let id = self.pool.write(|tx| SnapshotRepo::upsert(tx, snapshot))?;
        debug!(
            "Saved snapshot {} ({}-{} week {}, {} courses)",
            id,
            snapshot.academic_year,
            snapshot.term,
            snapshot.week_no,
            snapshot.courses.len()
        );
        Ok(id)
    }

    /// Get a snapshot by ID.
    pub fn get_snapshot(&self, id: i64) -> Result<Option<ScheduleSnapshot>> {
        self.pool.read(|conn| SnapshotRepo::get_by_id(conn, id))
    }

    /// All snapshots ordered by academic year, term and week.
    pub fn list_snapshots(&self) -> Result<Vec<ScheduleSnapshot>> {
        self.pool.read(|conn| SnapshotRepo::list(conn))
    }

    /// Snapshots with the given ids, in identity order.
    pub fn get_snapshots_by_ids(&self, ids: &[i64]) -> Result<Vec<ScheduleSnapshot>> {
        self.pool.read(|conn| SnapshotRepo::get_by_ids(conn, ids))
    }

    /// Delete every snapshot.
    pub fn clear_snapshots(&self) -> Result<usize> {
        let deleted = self.pool.write(|tx| SnapshotRepo::clear(tx))?;
        info!("Cleared {} snapshots", deleted);
        Ok(deleted)
    }

    /// Number of stored snapshots.
    pub fn snapshot_count(&self) -> Result<i64> {
        self.pool.read(|conn| SnapshotRepo::count(conn))
    }

    /// Snapshots grouped by semester, groups sorted by key.
    pub fn grouped_snapshots(&self) -> Result<Vec<SemesterGroup>> {
        let mut groups: BTreeMap<String, SemesterGroup> = BTreeMap::new();

        for snapshot in self.list_snapshots()? {
            groups
                .entry(snapshot.semester_key())
                .or_insert_with(|| SemesterGroup {
                    key: snapshot.semester_key(),
                    title: semester_title(&snapshot.academic_year, &snapshot.term),
                    snapshots: Vec::new(),
                })
                .snapshots
                .push(snapshot);
        }

        Ok(groups
            .into_values()
            .map(|mut group| {
                group.snapshots.sort_by_key(|s| s.week_no);
                group
            })
            .collect())
    }

    // === Config ===

    /// Get a setting.
    pub fn get_config(&self, key: &str) -> Result<Option<Config>> {
        self.pool.read(|conn| ConfigRepo::get(conn, key))
    }

    /// Set a setting.
    pub fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.pool.write(|tx| ConfigRepo::set(tx, key, value))
    }

    /// Remove a setting. Returns whether it existed.
    pub fn delete_config(&self, key: &str) -> Result<bool> {
        self.pool.write(|tx| ConfigRepo::delete(tx, key))
    }

    /// All settings.
    pub fn list_config(&self) -> Result<Vec<Config>> {
        self.pool.read(|conn| ConfigRepo::get_all(conn))
    }

    /// Typed setting with default.
    pub fn get_config_or<T: serde::de::DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        self.pool.read(|conn| ConfigRepo::get_or(conn, key, default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use xiqueer_core::CourseOccurrence;

    fn snapshot(year: &str, term: &str, week: u32) -> NewSnapshot {
        NewSnapshot {
            captured_at: Utc::now(),
            host: "jw.xxgc.edu.cn".to_string(),
            path: "/jwweb//wap/mycourseschedule.aspx".to_string(),
            academic_year: year.to_string(),
            term: term.to_string(),
            week_no: week,
            max_week: 18,
            period_start: String::new(),
            period_end: String::new(),
            request_digest: String::new(),
            courses: vec![CourseOccurrence {
                course_name: "Java程序设计".to_string(),
                weekday: 1,
                start_section: 1,
                end_section: 2,
                teacher: "李四".to_string(),
                location: "实验楼305".to_string(),
                week_no: week,
            }],
        }
    }

    #[test]
    fn test_snapshot_lifecycle() {
        let db = Database::in_memory().unwrap();

        let id = db.save_snapshot(&snapshot("2025", "0", 2)).unwrap();
        assert_eq!(db.snapshot_count().unwrap(), 1);
        assert_eq!(db.get_snapshot(id).unwrap().unwrap().week_no, 2);

        let again = db.save_snapshot(&snapshot("2025", "0", 2)).unwrap();
        assert_eq!(again, id);
        assert_eq!(db.snapshot_count().unwrap(), 1);

        assert_eq!(db.clear_snapshots().unwrap(), 1);
        assert!(db.list_snapshots().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_captures_of_one_week_share_a_row() {
        let db = Database::in_memory().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || db.save_snapshot(&snapshot("2025", "1", 6)).unwrap())
            })
            .collect();
        let ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(db.snapshot_count().unwrap(), 1);
    }

    #[test]
    fn test_grouped_snapshots() {
        let db = Database::in_memory().unwrap();

        db.save_snapshot(&snapshot("2025", "1", 3)).unwrap();
        db.save_snapshot(&snapshot("2025", "0", 7)).unwrap();
        db.save_snapshot(&snapshot("2025", "1", 1)).unwrap();
        db.save_snapshot(&snapshot("2024", "1", 12)).unwrap();

        let groups = db.grouped_snapshots().unwrap();
        let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["2024-1", "2025-0", "2025-1"]);

        assert_eq!(groups[1].title, "2025 学年 第1学期");
        assert_eq!(groups[2].title, "2025 学年 第2学期");

        let weeks: Vec<u32> = groups[2].snapshots.iter().map(|s| s.week_no).collect();
        assert_eq!(weeks, vec![1, 3]);
    }

    #[test]
    fn test_snapshots_by_ids() {
        let db = Database::in_memory().unwrap();

        let a = db.save_snapshot(&snapshot("2025", "0", 1)).unwrap();
        db.save_snapshot(&snapshot("2025", "0", 2)).unwrap();

        let picked = db.get_snapshots_by_ids(&[a]).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, a);
        assert!(db.get_snapshots_by_ids(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_config() {
        let db = Database::in_memory().unwrap();

        db.set_config("capture.target_host", &json!("jw.example.edu")).unwrap();
        let host: String = db
            .get_config_or("capture.target_host", String::new())
            .unwrap();
        assert_eq!(host, "jw.example.edu");

        assert!(db.delete_config("capture.target_host").unwrap());
        assert!(db.get_config("capture.target_host").unwrap().is_none());
        assert!(db.list_config().unwrap().is_empty());
    }

    #[test]
    fn test_file_database_reopens() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("xiqueer.db");

        let id = {
            let db = Database::with_path(&path).unwrap();
            db.save_snapshot(&snapshot("2025", "0", 4)).unwrap()
        };

        let db = Database::with_path(&path).unwrap();
        assert_eq!(db.get_snapshot(id).unwrap().unwrap().week_no, 4);
    }
}
