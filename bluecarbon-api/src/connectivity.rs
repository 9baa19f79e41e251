//! Online/offline signal.
//!
//! One instance is created per session and handed to every component that
//! cares about connectivity (request client, outbound queue, reconnect
//! controller). The host platform feeds it from its own network monitor.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared online/offline flag with change notification.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Updates the flag. Subscribers are only woken on an actual change.
    /// Returns whether the value changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(
                "Network connection {}",
                if online { "restored" } else { "lost" }
            );
        }
        changed
    }

    /// A receiver that observes every subsequent change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::online()
    }
}
