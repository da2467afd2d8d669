//! Merging weekly snapshots into timetable rows.
//!
//! Identical slots (course, weekday, periods, teacher, location) seen in
//! several weeks collapse into one row whose week membership is written in
//! range notation:
//!
//! - `1-4` for consecutive weeks,
//! - `1-7单` / `2-8双` for odd or even biweekly runs,
//! - bare numbers for anything else, joined with `、`.

use std::collections::{BTreeSet, HashMap};

use crate::models::{ScheduleCsvRow, ScheduleSnapshot};

/// Separator between week range tokens.
pub const WEEK_SEPARATOR: &str = "、";

/// Suffix for odd-week runs.
const ODD_SUFFIX: &str = "单";

/// Suffix for even-week runs.
const EVEN_SUFFIX: &str = "双";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RowKey {
    course_name: String,
    weekday: u8,
    start_section: u32,
    end_section: u32,
    teacher: String,
    location: String,
}

/// Merges snapshots into deduplicated rows.
///
/// Week numbers come from each snapshot, not from the occurrences it holds.
/// Rows are ordered by weekday, periods and course name; teacher and location
/// break the remaining ties so the output does not depend on input order.
pub fn merge(snapshots: &[ScheduleSnapshot]) -> Vec<ScheduleCsvRow> {
    let mut index: HashMap<RowKey, usize> = HashMap::new();
    let mut groups: Vec<(RowKey, BTreeSet<u32>)> = Vec::new();

    for snapshot in snapshots {
        for course in &snapshot.courses {
            let key = RowKey {
                course_name: course.course_name.clone(),
                weekday: course.weekday,
                start_section: course.start_section,
                end_section: course.end_section,
                teacher: course.teacher.clone(),
                location: course.location.clone(),
            };
            let slot = *index.entry(key.clone()).or_insert_with(|| {
                groups.push((key, BTreeSet::new()));
                groups.len() - 1
            });
            groups[slot].1.insert(snapshot.week_no);
        }
    }

    let mut rows: Vec<ScheduleCsvRow> = groups
        .into_iter()
        .map(|(key, weeks)| {
            let weeks: Vec<u32> = weeks.into_iter().collect();
            ScheduleCsvRow {
                course_name: key.course_name,
                weekday: key.weekday,
                start_section: key.start_section,
                end_section: key.end_section,
                teacher: key.teacher,
                location: key.location,
                weeks_text: compress_weeks(&weeks),
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        (a.weekday, a.start_section, a.end_section, &a.course_name)
            .cmp(&(b.weekday, b.start_section, b.end_section, &b.course_name))
            .then_with(|| a.teacher.cmp(&b.teacher))
            .then_with(|| a.location.cmp(&b.location))
    });

    tracing::debug!(
        "Merged {} snapshots into {} rows",
        snapshots.len(),
        rows.len()
    );
    rows
}

/// Compresses week numbers into range notation. Order and duplicates in the
/// input do not matter.
pub fn compress_weeks(weeks: &[u32]) -> String {
    let mut weeks = weeks.to_vec();
    weeks.sort_unstable();
    weeks.dedup();

    let mut parts: Vec<String> = Vec::new();
    let last = weeks.len().saturating_sub(1);
    let mut i = 0;

    while i < weeks.len() {
        if i == last {
            parts.push(weeks[i].to_string());
            break;
        }

        match weeks[i + 1] - weeks[i] {
            1 => {
                let mut end = i + 1;
                while end < last && weeks[end + 1] - weeks[end] == 1 {
                    end += 1;
                }
                parts.push(format!("{}-{}", weeks[i], weeks[end]));
                i = end + 1;
            }
            2 => {
                let parity = weeks[i] % 2;
                let mut end = i + 1;
                while end < last
                    && weeks[end + 1] - weeks[end] == 2
                    && weeks[end + 1] % 2 == parity
                {
                    end += 1;
                }
                let suffix = if parity == 1 { ODD_SUFFIX } else { EVEN_SUFFIX };
                parts.push(format!("{}-{}{}", weeks[i], weeks[end], suffix));
                i = end + 1;
            }
            _ => {
                parts.push(weeks[i].to_string());
                i += 1;
            }
        }
    }

    parts.join(WEEK_SEPARATOR)
}
