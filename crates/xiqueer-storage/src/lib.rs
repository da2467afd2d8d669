//! Xiqueer Storage - SQLite persistence for captured timetables.
//!
//! This crate stores one timetable snapshot per academic week and a small
//! key/value settings table. It handles:
//!
//! - Upserting snapshots by `(academic_year, term, week_no)`
//! - Listing, picking and clearing snapshots
//! - Grouping snapshots by semester for display
//! - Persisted capture settings
//!
//! # Example
//!
//! ```no_run
//! use xiqueer_storage::Database;
//!
//! let db = Database::in_memory().unwrap();
//! for group in db.grouped_snapshots().unwrap() {
//!     println!("{}: {} weeks", group.title, group.snapshots.len());
//! }
//! ```

mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
mod schema;

pub use database::Database;
pub use error::{Result, StorageError};
pub use models::Config;
pub use pool::ConnectionPool;
pub use repository::{ConfigRepo, SnapshotRepo};
