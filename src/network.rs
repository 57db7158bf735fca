//! Online/offline signal and sync eligibility.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::is_canonical_id;
use crate::remote::RemoteDataAccess;

/// Connectivity flag with change notifications.
pub struct NetworkStatus {
    tx: watch::Sender<bool>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the flag; subscribers are only woken on an actual change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            if online {
                info!("Network online");
            } else {
                info!("Network offline; remote writes will be queued");
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// A shop syncs only when its id is canonical and the device is online.
/// Legacy shops with non-canonical ids stay local-only forever.
pub fn is_sync_eligible(shop_id: Option<&str>, online: bool) -> bool {
    online && shop_id.is_some_and(is_canonical_id)
}

/// Poll the backend health check and feed the result into `network`.
pub fn spawn_connectivity_probe(
    remote: Arc<dyn RemoteDataAccess>,
    network: Arc<NetworkStatus>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let online = tokio::time::timeout(interval, remote.ping())
                        .await
                        .unwrap_or(false);
                    network.set_online(online);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeRemote, LEGACY_SHOP, SHOP_A};

    #[test]
    fn eligibility_requires_canonical_id_and_connectivity() {
        assert!(is_sync_eligible(Some(SHOP_A), true));
        assert!(!is_sync_eligible(Some(SHOP_A), false));
        assert!(!is_sync_eligible(Some(LEGACY_SHOP), true));
        assert!(!is_sync_eligible(None, true));
    }

    #[tokio::test]
    async fn subscribers_only_see_real_transitions() {
        let network = NetworkStatus::new(false);
        let mut rx = network.subscribe();

        network.set_online(false);
        assert!(!rx.has_changed().unwrap());

        network.set_online(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(network.is_online());
    }

    #[tokio::test]
    async fn probe_tracks_backend_reachability() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_unreachable(true);
        let network = Arc::new(NetworkStatus::new(true));
        let cancel = CancellationToken::new();

        let handle = spawn_connectivity_probe(
            remote.clone(),
            network.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        let mut rx = network.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|online| !*online))
            .await
            .expect("probe should flag offline")
            .unwrap();

        remote.set_unreachable(false);
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|online| *online))
            .await
            .expect("probe should flag online")
            .unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }
}
