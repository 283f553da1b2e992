//! Connectivity tracking for paused fetches.
//!
//! When the manager reports the environment as offline, fetches that are about
//! to start an attempt move to [`FetchStatus::Paused`](crate::query::FetchStatus)
//! and wait for connectivity instead of failing.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// Shared, cloneable view of the current connectivity.
#[derive(Debug, Clone)]
pub struct OnlineManager {
    tx: Arc<watch::Sender<bool>>,
}

impl OnlineManager {
    /// Creates a manager that starts online.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Reports a connectivity change. Paused fetches resume once this is `true`.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            debug!(online, "Connectivity changed");
        }
    }

    /// Resolves once the manager reports online.
    pub async fn wait_online(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|online| *online).await;
    }
}

impl Default for OnlineManager {
    fn default() -> Self {
        Self::new()
    }
}
