//! Connectivity state shared between the host platform and the sync engine.
//!
//! The host reports reachability with [`ConnectivityMonitor::set_online`];
//! consumers read the current value, watch the latest state, or register a
//! listener that is called for every transition.

use std::sync::Arc;

use tokio::sync::watch;

use crate::events::{ListenerRegistry, Subscription};

#[derive(Clone, Debug)]
pub struct ConnectivityMonitor {
    sender: Arc<watch::Sender<bool>>,
    listeners: ListenerRegistry<bool>,
}

impl ConnectivityMonitor {
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    /// Record the current reachability. Returns `true` if the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
            self.listeners.emit(&online);
        }
        changed
    }

    /// Receiver holding the latest state. A receiver that lags behind
    /// several transitions only observes the most recent one.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Call `listener` synchronously with the new state on every transition.
    pub fn on_change(
        &self,
        listener: impl Fn(&bool) + Send + Sync + 'static,
    ) -> Subscription<bool> {
        self.listeners.subscribe(listener)
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
