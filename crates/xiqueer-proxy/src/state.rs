//! Observable capture state.
//!
//! One [`CaptureStateCell`] is created by the host and cloned into everything
//! that reports progress: the capture service publishes start/stop and
//! startup failures, the capture pipeline publishes saved snapshots and store
//! errors. Observers subscribe and wait for changes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Point-in-time capture status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureState {
    /// Whether the proxy is accepting connections.
    pub running: bool,
    /// Snapshots saved since the cell was created or reset.
    pub captured_count: u64,
    /// Most recent user-visible failure.
    pub last_error: Option<String>,
    /// When the last snapshot was saved.
    pub last_capture_at: Option<DateTime<Utc>>,
}

/// Shared, observable [`CaptureState`].
#[derive(Debug, Clone)]
pub struct CaptureStateCell {
    tx: Arc<watch::Sender<CaptureState>>,
}

impl Default for CaptureStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureStateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(CaptureState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Replaces the state with `f(current)` atomically and returns the new state.
    pub fn update<F>(&self, f: F) -> CaptureState
    where
        F: FnOnce(&CaptureState) -> CaptureState,
    {
        let mut next = CaptureState::default();
        self.tx.send_modify(|state| {
            *state = f(state);
            next = state.clone();
        });
        next
    }

    /// Current state.
    pub fn snapshot(&self) -> CaptureState {
        self.tx.borrow().clone()
    }

    /// Receiver that is notified on every update.
    pub fn subscribe(&self) -> watch::Receiver<CaptureState> {
        self.tx.subscribe()
    }

    /// Back to the initial state.
    pub fn reset(&self) {
        self.tx.send_replace(CaptureState::default());
    }
}
