//! # Network Monitor
//!
//! Connectivity signal consumed by the sync engine. A platform integration
//! feeds transitions into [`NetworkMonitor::set_online`]; the engine reads the
//! current value before each pass and the background service wakes on every
//! offline → online transition.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Connectivity source
pub trait Reachability: Send + Sync {
    /// Point-in-time connectivity
    fn is_online(&self) -> bool;

    /// Receiver that observes every connectivity change
    fn subscribe(&self) -> watch::Receiver<bool>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Online,
    Offline,
}

/// Reachability backed by a `watch` channel
#[derive(Debug)]
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx }
    }

    /// Record a connectivity reading; returns whether it changed
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
            tracing::info!("Network status changed: {:?}", self.status());
        }
        changed
    }

    pub fn status(&self) -> NetworkStatus {
        if *self.tx.borrow() {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        }
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Reachability for NetworkMonitor {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_online_reports_changes_only() {
        let monitor = NetworkMonitor::new(false);
        assert_eq!(monitor.status(), NetworkStatus::Offline);

        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let monitor = NetworkMonitor::new(false);
        let mut rx = monitor.subscribe();

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }
}
