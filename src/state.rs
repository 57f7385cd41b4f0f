//! Application state shared with the HTTP handlers.
//!
//! The snapshot store is created once in `main` and injected both here and
//! into the poller.

use std::sync::Arc;

use crate::store::SnapshotStore;

/// Type alias for shared application state.
pub type SharedState = Arc<AppState>;

/// State handed to every request handler.
pub struct AppState {
    /// Latest snapshot and proxy status, written by the poller.
    pub store: Arc<SnapshotStore>,
}

impl AppState {
    pub fn new(store: Arc<SnapshotStore>) -> SharedState {
        Arc::new(Self { store })
    }
}
