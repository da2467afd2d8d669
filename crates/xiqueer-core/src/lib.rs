//! Xiqueer Core - timetable extraction, merging and export.
//!
//! This crate holds the pure parts of the capture pipeline:
//!
//! - [`extractor`] turns a captured schedule response into one week of
//!   [`CourseOccurrence`]s
//! - [`merge`] folds weekly [`ScheduleSnapshot`]s into deduplicated rows with
//!   compressed week ranges
//! - [`export`] writes those rows as CSV
//!
//! ```
//! use xiqueer_core::{extract, merge};
//!
//! let body = "{jcflag:'0',zc:'1',xn:'2025',xq:'1',week1:[{kcmc:'高数',jcxx:'1-2'}],sjhjinfo:[]}";
//! let parsed = extract(body).unwrap();
//! assert_eq!(parsed.courses.len(), 1);
//! assert!(merge(&[]).is_empty());
//! ```

pub mod error;
pub mod export;
pub mod extractor;
pub mod merge;
pub mod models;

pub use error::{CoreError, Result};
pub use export::{export_rows, render_csv, write_csv, ExportResult, CSV_HEADER};
pub use extractor::{contains_payload, digest_request_params, extract, ParsedPayload, PAYLOAD_MARKER};
pub use merge::{compress_weeks, merge};
pub use models::{
    semester_title, CourseOccurrence, NewSnapshot, ScheduleCsvRow, ScheduleSnapshot,
    SemesterGroup,
};
