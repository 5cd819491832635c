//! Reachability state shared by the facade, the orchestrator and the
//! background loop.
//!
//! The monitor never probes the network on its own. It holds whatever the
//! runtime last reported, so it can read "online" while the admin dashboard
//! is in fact unreachable; callers still have to handle transport failures.
//! [`spawn_reachability_probe`] is one such runtime signal source.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::PosBackend;
use crate::error::SyncError;

#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    /// Record a runtime online/offline signal. Returns true when the state
    /// actually changed.
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
            if online {
                info!("Connectivity: online");
            } else {
                info!("Connectivity: offline");
            }
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver that observes every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the monitor reports online, immediately if it already
    /// does. Fails with [`SyncError::Timeout`] after `timeout`.
    pub async fn wait_for_online(&self, timeout: Duration) -> Result<(), SyncError> {
        let mut rx = self.tx.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|online| *online)).await,
            Ok(Ok(_))
        );
        if reached {
            Ok(())
        } else {
            Err(SyncError::Timeout(timeout))
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Poll the backend health endpoint every `interval` and feed the result
/// into `monitor` until `cancel` fires.
pub fn spawn_reachability_probe(
    monitor: ConnectivityMonitor,
    backend: Arc<dyn PosBackend>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Reachability probe started (interval: {interval:?})");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reachability probe stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let online = backend.health().await;
                    if !monitor.set_online(online) {
                        debug!(online, "Reachability unchanged");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[test]
    fn test_set_online_reports_transitions_only() {
        let monitor = ConnectivityMonitor::new(false);
        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(monitor.is_online());
        assert!(monitor.set_online(false));
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_clones_share_state() {
        let monitor = ConnectivityMonitor::new(false);
        let other = monitor.clone();
        other.set_online(true);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_wait_for_online_resolves_immediately_when_online() {
        let monitor = ConnectivityMonitor::new(true);
        monitor
            .wait_for_online(Duration::from_millis(10))
            .await
            .expect("already online");
    }

    #[tokio::test]
    async fn test_wait_for_online_resolves_on_transition() {
        let monitor = ConnectivityMonitor::new(false);
        let flipper = monitor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flipper.set_online(true);
        });
        monitor
            .wait_for_online(Duration::from_secs(5))
            .await
            .expect("came online");
    }

    #[tokio::test]
    async fn test_wait_for_online_times_out() {
        let monitor = ConnectivityMonitor::new(false);
        let err = monitor
            .wait_for_online(Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout(d) if d == Duration::from_millis(30)));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();
        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_probe_feeds_monitor_until_cancelled() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_healthy(true);
        let monitor = ConnectivityMonitor::new(false);
        let cancel = CancellationToken::new();
        let handle = spawn_reachability_probe(
            monitor.clone(),
            backend.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        monitor
            .wait_for_online(Duration::from_secs(5))
            .await
            .expect("probe marked online");

        backend.set_healthy(false);
        let mut rx = monitor.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|online| !*online))
            .await
            .expect("probe marked offline")
            .unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }
}
