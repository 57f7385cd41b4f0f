//! Shared snapshot store for the proxy.
//!
//! This module provides the `SnapshotStore` holding the most recent CareLink
//! document together with the current proxy status. The poller is the only
//! writer; HTTP handlers read it concurrently.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Schema-loose CareLink document as returned by the remote API.
pub type Snapshot = Value;

/// Proxy state shown on the status page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyStatus {
    #[default]
    Initialization,
    PerformingLogin,
    LoginSuccessful,
    TokenRequired,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Initialization => "Initialization",
            ProxyStatus::PerformingLogin => "Performing login",
            ProxyStatus::LoginSuccessful => "Login successful",
            ProxyStatus::TokenRequired => "Valid token required",
        }
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Most recent snapshot plus status.
///
/// The snapshot is always replaced as a whole `Arc`, so a reader holds either
/// the previous or the new document and never a partially written one.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    status: RwLock<ProxyStatus>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored snapshot.
    pub async fn set(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write().await = Some(snapshot);
    }

    /// Drops the stored snapshot so readers see "no data".
    pub async fn clear(&self) {
        *self.snapshot.write().await = None;
    }

    /// Returns the current snapshot, if any. The lock is released before
    /// the caller starts copying the document.
    pub async fn get(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.read().await.clone()
    }

    pub async fn set_status(&self, status: ProxyStatus) {
        *self.status.write().await = status;
    }

    pub async fn status(&self) -> ProxyStatus {
        *self.status.read().await
    }
}
