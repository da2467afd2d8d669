//! Timetable data models shared by the extractor, the merge engine and storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One course's weekly time slot as observed in a single captured week.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CourseOccurrence {
    /// Course name (`kcmc`).
    pub course_name: String,
    /// Day of week, 1 (Monday) through 7.
    pub weekday: u8,
    /// First class period, inclusive.
    pub start_section: u32,
    /// Last class period, inclusive.
    pub end_section: u32,
    /// Teacher (`rkjs`).
    pub teacher: String,
    /// Classroom (`skdd`).
    pub location: String,
    /// Academic week this occurrence was observed in.
    pub week_no: u32,
}

/// A stored timetable snapshot for one academic week.
///
/// Identity is `(academic_year, term, week_no)`; `id` is assigned by the store
/// and survives replacement of the snapshot's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSnapshot {
    /// Store-assigned identifier.
    pub id: i64,
    /// When the response was captured.
    pub captured_at: DateTime<Utc>,
    /// Host the response came from.
    pub host: String,
    /// Path and query of the captured request.
    pub path: String,
    /// Academic year (`xn`).
    pub academic_year: String,
    /// Term (`xq`).
    pub term: String,
    /// Week number (`zc`).
    pub week_no: u32,
    /// Declared number of weeks in the term (`maxzc`).
    pub max_week: u32,
    /// First day of the week (`qssj`).
    pub period_start: String,
    /// Last day of the week (`jssj`).
    pub period_end: String,
    /// Diagnostic fingerprint of the request parameters.
    pub request_digest: String,
    /// Course occurrences of this week.
    pub courses: Vec<CourseOccurrence>,
}

impl ScheduleSnapshot {
    /// Returns the semester key `"{academic_year}-{term}"`.
    pub fn semester_key(&self) -> String {
        format!("{}-{}", self.academic_year, self.term)
    }
}

/// A snapshot that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub captured_at: DateTime<Utc>,
    pub host: String,
    pub path: String,
    pub academic_year: String,
    pub term: String,
    pub week_no: u32,
    pub max_week: u32,
    pub period_start: String,
    pub period_end: String,
    pub request_digest: String,
    pub courses: Vec<CourseOccurrence>,
}

/// Snapshots of one semester, ordered by week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemesterGroup {
    /// `"{academic_year}-{term}"`.
    pub key: String,
    /// Human-readable title, e.g. `2025 学年 第2学期`.
    pub title: String,
    /// Snapshots sorted by week number.
    pub snapshots: Vec<ScheduleSnapshot>,
}

/// One merged timetable row ready for CSV export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleCsvRow {
    pub course_name: String,
    pub weekday: u8,
    pub start_section: u32,
    pub end_section: u32,
    pub teacher: String,
    pub location: String,
    /// Compressed week membership, e.g. `1-7单、10-16`.
    pub weeks_text: String,
}

/// Display title for a semester: the stored term is zero-based.
pub fn semester_title(academic_year: &str, term: &str) -> String {
    let term_display = match term.trim().parse::<i64>() {
        Ok(value) => match value.checked_add(1) {
            Some(next) => next.to_string(),
            None => term.to_string(),
        },
        Err(_) => term.to_string(),
    };
    format!("{} 学年 第{}学期", academic_year, term_display)
}
