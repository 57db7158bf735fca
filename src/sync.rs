//! Background sync engine for the shop POS.
//!
//! Drains the durable operation queue against the remote data-access
//! layer in FIFO order. Each operation is either confirmed (removed),
//! recognised as already applied by an earlier attempt (removed), or
//! counted as a failed attempt (retried on a later drain, dead-lettered
//! once the retry budget is spent).

use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult, RemoteError};
use crate::models::now_iso;
use crate::network::{is_sync_eligible, NetworkStatus};
use crate::queue::{FailureOutcome, OperationQueue};
use crate::remote::{apply_operation, with_timeout, RemoteDataAccess};
use crate::store::LocalStore;

const STATUS_CATEGORY: &str = "sync";
const LAST_SYNC_ATTEMPT_KEY: &str = "last_sync_attempt";
const LAST_SUCCESSFUL_SYNC_KEY: &str = "last_successful_sync";

/// Outcome counts of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Failures that exhausted the retry budget during this drain.
    pub dead_lettered: usize,
    /// Left untouched: written under another shop's session, blocked by an
    /// earlier failed write for the same record, or the backend went away
    /// mid-drain.
    pub deferred: usize,
    /// Nothing was attempted: not sync-eligible, or another drain was
    /// already running.
    pub skipped: bool,
}

/// Snapshot for the pending-sync badge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending: usize,
    pub dead_letters: usize,
    pub last_sync_attempt: Option<String>,
    pub last_successful_sync: Option<String>,
    pub is_online: bool,
    pub sync_eligible: bool,
    pub draining: bool,
}

pub struct SyncEngine {
    db: Arc<DbState>,
    store: Arc<LocalStore>,
    queue: Arc<OperationQueue>,
    remote: Arc<dyn RemoteDataAccess>,
    network: Arc<NetworkStatus>,
    request_timeout: Duration,
    draining: AtomicBool,
    trigger: Notify,
}

/// Clears the drain flag however the drain ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(
        db: Arc<DbState>,
        store: Arc<LocalStore>,
        queue: Arc<OperationQueue>,
        remote: Arc<dyn RemoteDataAccess>,
        network: Arc<NetworkStatus>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            db,
            store,
            queue,
            remote,
            network,
            request_timeout,
            draining: AtomicBool::new(false),
            trigger: Notify::new(),
        }
    }

    pub fn network(&self) -> &Arc<NetworkStatus> {
        &self.network
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    /// The active shop has a canonical id and the device is online.
    pub fn is_sync_eligible(&self) -> bool {
        let shop_id = self.store.active_shop_id().ok().flatten();
        is_sync_eligible(shop_id.as_deref(), self.network.is_online())
    }

    /// Ask the background loop for a drain as soon as possible.
    pub fn request_sync(&self) {
        self.trigger.notify_one();
    }

    /// Process every queued operation of the active shop once. Entries
    /// written under another shop's session stay queued untouched.
    pub async fn drain(&self) -> PosResult<DrainReport> {
        let active_shop = self.store.active_shop_id()?;
        let Some(active_shop) =
            active_shop.filter(|shop| is_sync_eligible(Some(shop.as_str()), self.network.is_online()))
        else {
            debug!("Drain skipped: shop not sync-eligible");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        };

        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain skipped: another drain is in progress");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let pending = self.queue.peek_all();
        let mut report = DrainReport::default();
        let mut blocked_targets: HashSet<String> = HashSet::new();
        let mut backend_gone = false;
        let mut other_shops = 0usize;

        for listed in pending {
            if listed.shop_id != active_shop {
                other_shops += 1;
                report.deferred += 1;
                continue;
            }
            let blocked = listed
                .target_entity_id
                .as_ref()
                .is_some_and(|target| blocked_targets.contains(target));
            if backend_gone || blocked {
                report.deferred += 1;
                continue;
            }

            // Re-read under a claim: the entry may have been coalesced into
            // or removed since the listing.
            let Some(attempt) = self.queue.begin_attempt(&listed.id)? else {
                continue;
            };
            let queued = attempt.entry();

            let operation = match queued.operation() {
                Ok(op) => op,
                Err(e) => {
                    warn!(
                        op_id = %queued.id,
                        kind = %queued.kind,
                        error = %e,
                        "Unknown sync operation; removing from queue"
                    );
                    self.queue.remove(&queued.id)?;
                    report.succeeded += 1;
                    continue;
                }
            };

            let result = with_timeout(
                self.request_timeout,
                apply_operation(self.remote.as_ref(), &operation),
            )
            .await;

            match result {
                Ok(()) => {
                    self.queue.remove(&queued.id)?;
                    report.succeeded += 1;
                }
                Err(e) if e.is_already_exists() => {
                    debug!(
                        op_id = %queued.id,
                        kind = %queued.kind,
                        "Remote already has this record; treating as synced"
                    );
                    self.queue.remove(&queued.id)?;
                    report.succeeded += 1;
                }
                Err(e) => {
                    warn!(
                        op_id = %queued.id,
                        kind = %queued.kind,
                        retry_count = queued.retry_count,
                        error = %e,
                        "Sync operation failed"
                    );
                    report.failed += 1;
                    if self.queue.mark_failed(&queued.id, &e.to_string())?
                        == FailureOutcome::DeadLettered
                    {
                        report.dead_lettered += 1;
                    }
                    if let Some(target) = &queued.target_entity_id {
                        blocked_targets.insert(target.clone());
                    }
                    if matches!(e, RemoteError::Unreachable(_)) {
                        warn!("Backend unreachable; deferring the rest of the queue");
                        backend_gone = true;
                    }
                }
            }
        }

        let fully_synced = report.failed == 0 && report.deferred == other_shops;
        self.record_sync_times(fully_synced)?;

        if report.succeeded > 0 || report.failed > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                deferred = report.deferred,
                "Sync drain complete"
            );
        }

        Ok(report)
    }

    fn record_sync_times(&self, fully_synced: bool) -> PosResult<()> {
        let now = now_iso();
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| PosError::Storage(e.to_string()))?;
        db::set_setting(&conn, STATUS_CATEGORY, LAST_SYNC_ATTEMPT_KEY, &now)
            .map_err(PosError::Storage)?;
        if fully_synced {
            db::set_setting(&conn, STATUS_CATEGORY, LAST_SUCCESSFUL_SYNC_KEY, &now)
                .map_err(PosError::Storage)?;
        }
        Ok(())
    }

    pub fn status(&self) -> SyncStatus {
        let (last_sync_attempt, last_successful_sync) = match self.db.conn.lock() {
            Ok(conn) => (
                db::get_setting(&conn, STATUS_CATEGORY, LAST_SYNC_ATTEMPT_KEY),
                db::get_setting(&conn, STATUS_CATEGORY, LAST_SUCCESSFUL_SYNC_KEY),
            ),
            Err(_) => (None, None),
        };

        SyncStatus {
            pending: self.queue.count(),
            dead_letters: self.queue.dead_letters().len(),
            last_sync_attempt,
            last_successful_sync,
            is_online: self.network.is_online(),
            sync_eligible: self.is_sync_eligible(),
            draining: self.draining.load(Ordering::SeqCst),
        }
    }
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Spawn the sync loop. It drains on the periodic tick (only while work is
/// pending), on every offline→online transition, and whenever
/// [`SyncEngine::request_sync`] is called. Stops when `cancel` fires.
pub fn start_sync_loop(
    engine: Arc<SyncEngine>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Sync loop started (interval: {}s)", interval.as_secs());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut online_rx = engine.network.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Sync loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if engine.queue.count() == 0 {
                        continue;
                    }
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*online_rx.borrow_and_update() {
                        continue;
                    }
                    info!("Network restored; resuming queued sync");
                }
                _ = engine.trigger.notified() => {}
            }

            if let Err(e) = engine.drain().await {
                warn!("Sync drain failed: {e}");
            }
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, ShopData};
    use crate::operations::Operation;
    use crate::queue::DEFAULT_MAX_RETRIES;
    use crate::testutil::{category, product, test_db, FakeRemote, LEGACY_SHOP, SHOP_A};
    use serde_json::json;

    struct Harness {
        db: Arc<DbState>,
        store: Arc<LocalStore>,
        queue: Arc<OperationQueue>,
        remote: Arc<FakeRemote>,
        engine: Arc<SyncEngine>,
    }

    fn harness(shop_id: &str, online: bool) -> Harness {
        let db = test_db();
        let store = Arc::new(LocalStore::load(db.clone()).unwrap());
        store.replace(shop_id, ShopData::default(), None).unwrap();
        let queue = Arc::new(OperationQueue::load(db.clone(), DEFAULT_MAX_RETRIES).unwrap());
        let remote = Arc::new(FakeRemote::new());
        let engine = Arc::new(SyncEngine::new(
            db.clone(),
            store.clone(),
            queue.clone(),
            remote.clone(),
            Arc::new(NetworkStatus::new(online)),
            Duration::from_secs(5),
        ));
        Harness {
            db,
            store,
            queue,
            remote,
            engine,
        }
    }

    #[tokio::test]
    async fn test_drain_is_noop_when_offline_or_legacy() {
        let offline = harness(SHOP_A, false);
        offline
            .queue
            .enqueue(SHOP_A, &Operation::CreateCategory(category(SHOP_A, "c1")))
            .unwrap();
        let report = offline.engine.drain().await.unwrap();
        assert!(report.skipped);
        assert_eq!(offline.queue.count(), 1);
        assert!(offline.remote.calls().is_empty());

        let legacy = harness(LEGACY_SHOP, true);
        legacy
            .queue
            .enqueue(LEGACY_SHOP, &Operation::CreateCategory(category(LEGACY_SHOP, "c1")))
            .unwrap();
        let report = legacy.engine.drain().await.unwrap();
        assert!(report.skipped);
        assert_eq!(legacy.queue.count(), 1);
        assert!(legacy.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fifo_replay_order() {
        let h = harness(SHOP_A, true);
        h.queue
            .enqueue(SHOP_A, &Operation::CreateProduct(product(SHOP_A, "x", 1.0, 5.0)))
            .unwrap();
        h.queue
            .enqueue(SHOP_A, &Operation::UpdateProduct {
                id: "x".into(),
                changes: json!({ "price": 9.0 }),
            })
            .unwrap();

        let report = h.engine.drain().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(
            h.remote.calls(),
            vec!["insert:products:x", "update:products:x"]
        );
        assert_eq!(
            h.remote.record(EntityKind::Product, "x").unwrap()["price"],
            9.0
        );
        assert_eq!(h.queue.count(), 0);
    }

    #[tokio::test]
    async fn test_replaying_a_create_twice_is_idempotent() {
        let h = harness(SHOP_A, true);
        let op = Operation::CreateCategory(category(SHOP_A, "c1"));

        h.queue.enqueue(SHOP_A, &op).unwrap();
        h.engine.drain().await.unwrap();
        let after_first = h.remote.record(EntityKind::Category, "c1");

        // Same create again, as if the first ack had been lost.
        h.queue.enqueue(SHOP_A, &op).unwrap();
        let report = h.engine.drain().await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(h.queue.count(), 0);
        assert_eq!(h.remote.record_count(EntityKind::Category), 1);
        assert_eq!(h.remote.record(EntityKind::Category, "c1"), after_first);
    }

    #[tokio::test]
    async fn test_always_failing_operation_is_dead_lettered_after_five_drains() {
        let h = harness(SHOP_A, true);
        h.remote.fail_writes_for("c1");
        h.queue
            .enqueue(SHOP_A, &Operation::CreateCategory(category(SHOP_A, "c1")))
            .unwrap();

        for drain in 1..DEFAULT_MAX_RETRIES {
            let report = h.engine.drain().await.unwrap();
            assert_eq!(report.failed, 1);
            assert_eq!(report.dead_lettered, 0);
            assert_eq!(h.queue.count(), 1, "still queued after drain {drain}");
        }

        let report = h.engine.drain().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(h.queue.count(), 0);
        assert_eq!(h.queue.dead_letters().len(), 1);
        assert_eq!(h.engine.status().dead_letters, 1);
    }

    #[tokio::test]
    async fn test_failed_record_blocks_later_writes_for_it() {
        let h = harness(SHOP_A, true);
        h.remote.fail_writes_for("x");
        h.queue
            .enqueue(SHOP_A, &Operation::CreateProduct(product(SHOP_A, "x", 1.0, 5.0)))
            .unwrap();
        h.queue
            .enqueue(SHOP_A, &Operation::UpdateProduct {
                id: "x".into(),
                changes: json!({ "price": 2.0 }),
            })
            .unwrap();
        h.queue
            .enqueue(SHOP_A, &Operation::CreateCategory(category(SHOP_A, "c1")))
            .unwrap();

        let report = h.engine.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.succeeded, 1);

        let pending = h.queue.peek_all();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(pending[1].retry_count, 0, "dependent write is not charged");
        assert_eq!(
            h.remote.calls(),
            vec!["insert:products:x", "insert:categories:c1"]
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_defers_rest_of_queue() {
        let h = harness(SHOP_A, true);
        h.queue
            .enqueue(SHOP_A, &Operation::CreateCategory(category(SHOP_A, "c1")))
            .unwrap();
        h.queue
            .enqueue(SHOP_A, &Operation::CreateCategory(category(SHOP_A, "c2")))
            .unwrap();
        h.remote.set_unreachable(true);

        let report = h.engine.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(h.queue.count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_operation_type_is_removed() {
        let h = harness(SHOP_A, true);
        {
            let conn = h.db.conn.lock().unwrap();
            let records = json!([{
                "id": "legacy-op",
                "shopId": SHOP_A,
                "type": "CREATE_LAYAWAY",
                "payload": { "id": "l1" },
                "targetEntityId": "l1",
                "enqueuedAt": "2026-01-01T00:00:00.000Z",
                "retryCount": 0
            }]);
            db::put_blob(
                &conn,
                crate::queue::QUEUE_BLOB_KEY,
                &serde_json::to_vec(&records).unwrap(),
            )
            .unwrap();
        }
        let queue = Arc::new(OperationQueue::load(h.db.clone(), DEFAULT_MAX_RETRIES).unwrap());
        assert_eq!(queue.count(), 1);

        let engine = SyncEngine::new(
            h.db.clone(),
            h.store.clone(),
            queue.clone(),
            h.remote.clone(),
            Arc::new(NetworkStatus::new(true)),
            Duration::from_secs(5),
        );
        let report = engine.drain().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(queue.count(), 0);
        assert!(h.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_drain_in_progress_guard() {
        let h = harness(SHOP_A, true);
        h.queue
            .enqueue(SHOP_A, &Operation::CreateCategory(category(SHOP_A, "c1")))
            .unwrap();

        h.engine.draining.store(true, Ordering::SeqCst);
        let report = h.engine.drain().await.unwrap();
        assert!(report.skipped);
        assert_eq!(h.queue.count(), 1);

        h.engine.draining.store(false, Ordering::SeqCst);
        let report = h.engine.drain().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(!h.engine.status().draining);
    }

    #[tokio::test]
    async fn test_concurrent_drains_apply_each_operation_once() {
        let h = harness(SHOP_A, true);
        for id in ["c1", "c2", "c3"] {
            h.queue
                .enqueue(SHOP_A, &Operation::CreateCategory(category(SHOP_A, id)))
                .unwrap();
        }

        let (a, b) = tokio::join!(h.engine.drain(), h.engine.drain());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.succeeded + b.succeeded, 3);
        assert_eq!(h.queue.count(), 0);
        assert_eq!(h.remote.record_count(EntityKind::Category), 3);
    }

    #[tokio::test]
    async fn test_sync_timestamps() {
        let h = harness(SHOP_A, true);
        h.remote.fail_writes_for("c1");
        h.queue
            .enqueue(SHOP_A, &Operation::CreateCategory(category(SHOP_A, "c1")))
            .unwrap();

        h.engine.drain().await.unwrap();
        let status = h.engine.status();
        assert!(status.last_sync_attempt.is_some());
        assert!(status.last_successful_sync.is_none());
        assert_eq!(status.pending, 1);

        h.remote.clear_failures();
        h.engine.drain().await.unwrap();
        let status = h.engine.status();
        assert!(status.last_successful_sync.is_some());
        assert_eq!(status.pending, 0);
        assert!(status.sync_eligible);
    }

    #[tokio::test]
    async fn test_queue_survives_restart_while_offline() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Arc::new(db::init(dir.path()).unwrap());
            let queue = OperationQueue::load(db, DEFAULT_MAX_RETRIES).unwrap();
            queue
                .enqueue(SHOP_A, &Operation::CreateCategory(category(SHOP_A, "c1")))
                .unwrap();
            queue
                .enqueue(SHOP_A, &Operation::DeleteCategory { id: "c0".into() })
                .unwrap();
            assert_eq!(queue.count(), 2);
        }

        let db = Arc::new(db::init(dir.path()).unwrap());
        let queue = OperationQueue::load(db, DEFAULT_MAX_RETRIES).unwrap();
        assert_eq!(queue.count(), 2);
    }

    #[tokio::test]
    async fn test_loop_drains_when_network_returns() {
        let h = harness(SHOP_A, false);
        h.queue
            .enqueue(SHOP_A, &Operation::CreateCategory(category(SHOP_A, "c1")))
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = start_sync_loop(h.engine.clone(), Duration::from_secs(3600), cancel.clone());

        h.engine.network().set_online(true);

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while h.queue.count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "queue should drain after reconnect");
        assert!(h.remote.record(EntityKind::Category, "c1").is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_loop_drains_on_request() {
        let h = harness(SHOP_A, true);
        let cancel = CancellationToken::new();
        let handle = start_sync_loop(h.engine.clone(), Duration::from_secs(3600), cancel.clone());

        h.queue
            .enqueue(SHOP_A, &Operation::CreateCategory(category(SHOP_A, "c1")))
            .unwrap();
        h.engine.request_sync();

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while h.queue.count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "queue should drain on request");

        cancel.cancel();
        handle.await.unwrap();
    }
}
