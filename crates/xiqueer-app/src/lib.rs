//! Xiqueer Catch - capture host.
//!
//! Wires the capture proxy to the snapshot store:
//!
//! - [`settings`] resolves what to capture (flags, stored config, defaults)
//! - [`pipeline`] filters captured exchanges and saves timetable snapshots
//! - [`service`] starts and stops the proxy and publishes its state
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use xiqueer_app::{CapturePipeline, CaptureService, CaptureSettings};
//! use xiqueer_proxy::{CaptureStateCell, NoopProtector};
//! use xiqueer_storage::Database;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let db = Database::new()?;
//! let settings = CaptureSettings::load(&db)?;
//! let state = CaptureStateCell::new();
//! let pipeline = CapturePipeline::new(db, state.clone(), &settings);
//! let service = CaptureService::new(&settings, pipeline, state, Arc::new(NoopProtector));
//!
//! let port = service.start_capture()?;
//! println!("proxy on 127.0.0.1:{}", port);
//! service.stop_capture().await;
//! # Ok(())
//! # }
//! ```

pub mod pipeline;
pub mod service;
pub mod settings;

pub use pipeline::{CaptureOutcome, CapturePipeline};
pub use service::CaptureService;
pub use settings::{parse_config_value, CaptureSettings, SettingsOverrides};
