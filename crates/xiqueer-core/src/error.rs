//! Error types for timetable processing.

use thiserror::Error;

/// Core error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// CSV encoding error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error while writing an export.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Nothing to export.
    #[error("no timetable data to export")]
    EmptyExport,
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
