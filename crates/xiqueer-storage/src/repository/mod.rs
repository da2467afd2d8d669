//! Database repositories for each table.

pub mod config;
pub mod snapshots;

pub use config::ConfigRepo;
pub use snapshots::SnapshotRepo;
