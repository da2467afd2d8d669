//! CSV export of merged timetable rows.

use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::{CoreError, Result};
use crate::models::ScheduleCsvRow;

/// UTF-8 byte order mark, so spreadsheet apps detect the encoding.
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Header row of the exported file.
pub const CSV_HEADER: [&str; 7] = [
    "courseName",
    "weekday",
    "startSection",
    "endSection",
    "teacher",
    "location",
    "weeksText",
];

/// Outcome of an export, shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportResult {
    /// Whether a file was written.
    pub success: bool,
    /// Path of the written file (empty on failure).
    pub path: String,
    /// Failure reason, if any.
    pub message: Option<String>,
}

impl ExportResult {
    fn written(path: &Path) -> Self {
        Self {
            success: true,
            path: path.display().to_string(),
            message: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            path: String::new(),
            message: Some(message.into()),
        }
    }
}

/// Renders rows as BOM-prefixed UTF-8 CSV with `\n` line endings.
pub fn render_csv(rows: &[ScheduleCsvRow]) -> Result<Vec<u8>> {
    let mut out = UTF8_BOM.to_vec();
    {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(&mut out);

        writer.write_record(CSV_HEADER)?;
        for row in rows {
            writer.write_record([
                row.course_name.clone(),
                row.weekday.to_string(),
                row.start_section.to_string(),
                row.end_section.to_string(),
                row.teacher.clone(),
                row.location.clone(),
                row.weeks_text.clone(),
            ])?;
        }
        writer.flush()?;
    }
    Ok(out)
}

/// Writes rows to a timestamped CSV file inside `dir`.
pub fn write_csv(dir: &Path, rows: &[ScheduleCsvRow]) -> Result<PathBuf> {
    if rows.is_empty() {
        return Err(CoreError::EmptyExport);
    }

    std::fs::create_dir_all(dir)?;
    let path = dir.join(export_file_name());
    std::fs::write(&path, render_csv(rows)?)?;

    tracing::info!("Exported {} rows to {:?}", rows.len(), path);
    Ok(path)
}

/// Exports rows and folds any failure into the result.
pub fn export_rows(dir: &Path, rows: &[ScheduleCsvRow]) -> ExportResult {
    match write_csv(dir, rows) {
        Ok(path) => ExportResult::written(&path),
        Err(e) => {
            tracing::warn!("CSV export failed: {}", e);
            ExportResult::failed(e.to_string())
        }
    }
}

fn export_file_name() -> String {
    format!("xiqueer_schedule_{}.csv", Local::now().format("%Y%m%d_%H%M%S"))
}
