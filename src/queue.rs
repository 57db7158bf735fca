//! Durable FIFO queue of remote writes that have not been confirmed yet.
//!
//! The whole queue is rewritten to the `sync_queue` blob after every
//! change, so a crash between two calls never loses an acknowledged
//! enqueue. Operations that exhaust their retry budget move to a separate
//! dead-letter list instead of disappearing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::models::{new_id, now_iso};
use crate::operations::Operation;

pub const QUEUE_BLOB_KEY: &str = "sync_queue";
pub const DEAD_LETTER_BLOB_KEY: &str = "sync_dead_letters";
const CORRUPT_QUEUE_BLOB_KEY: &str = "sync_queue_corrupt";

/// Attempts allowed before an operation is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// One persisted queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    /// Shop whose session produced the write. Only that shop's session
    /// ever replays it.
    #[serde(default)]
    pub shop_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    #[serde(default)]
    pub target_entity_id: Option<String>,
    pub enqueued_at: String,
    #[serde(default)]
    pub retry_count: u32,
}

impl QueuedOperation {
    /// Decode the typed operation. Fails for tags this build does not know.
    pub fn operation(&self) -> Result<Operation, serde_json::Error> {
        Operation::decode(&self.kind, &self.payload)
    }

    fn is_update(&self) -> bool {
        self.kind.starts_with("UPDATE_")
    }
}

/// An operation that ran out of retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    #[serde(flatten)]
    pub operation: QueuedOperation,
    pub last_error: String,
    pub failed_at: String,
}

/// Result of [`OperationQueue::mark_failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still queued; will be retried on the next drain.
    Retrying { retry_count: u32 },
    /// Retry budget exhausted; moved out of the queue.
    DeadLettered,
    /// Already removed (e.g. by a concurrent drain).
    Missing,
}

#[derive(Default)]
struct QueueInner {
    pending: Vec<QueuedOperation>,
    dead: Vec<DeadLetter>,
    /// Entries currently being sent. Never coalesced into.
    in_flight: HashSet<String>,
}

/// A queue entry claimed for one remote attempt. Releases the claim on drop.
pub struct InFlight<'a> {
    queue: &'a OperationQueue,
    entry: QueuedOperation,
}

impl InFlight<'_> {
    pub fn entry(&self) -> &QueuedOperation {
        &self.entry
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.queue.inner.lock() {
            inner.in_flight.remove(&self.entry.id);
        }
    }
}

pub struct OperationQueue {
    db: Arc<DbState>,
    max_retries: u32,
    inner: Mutex<QueueInner>,
}

impl OperationQueue {
    /// Load the queue and dead letters persisted in `db`.
    pub fn load(db: Arc<DbState>, max_retries: u32) -> PosResult<Self> {
        let (pending, dead) = {
            let conn = db.conn.lock().map_err(|e| PosError::Storage(e.to_string()))?;
            let pending = read_list::<QueuedOperation>(&conn, QUEUE_BLOB_KEY)?;
            let dead = read_list::<DeadLetter>(&conn, DEAD_LETTER_BLOB_KEY)?;
            (pending, dead)
        };

        if !pending.is_empty() || !dead.is_empty() {
            info!(
                pending = pending.len(),
                dead_letters = dead.len(),
                "Loaded persisted sync queue"
            );
        }

        Ok(Self {
            db,
            max_retries: max_retries.max(1),
            inner: Mutex::new(QueueInner {
                pending,
                dead,
                in_flight: HashSet::new(),
            }),
        })
    }

    /// Append an operation on behalf of `shop_id`, or fold an update into an
    /// already-queued update of the same shop, type and target that is not
    /// being sent right now. Returns the id of the queue entry.
    pub fn enqueue(&self, shop_id: &str, operation: &Operation) -> PosResult<String> {
        let (kind, payload) = operation.encode()?;
        let target = operation.target_id().to_string();

        let mut inner = self.lock()?;

        if operation.is_update() {
            let QueueInner {
                pending, in_flight, ..
            } = &mut *inner;
            if let Some(existing) = pending.iter_mut().find(|queued| {
                queued.is_update()
                    && queued.kind == kind
                    && queued.shop_id == shop_id
                    && queued.target_entity_id.as_deref() == Some(target.as_str())
                    && !in_flight.contains(&queued.id)
            }) {
                coalesce_payload(&mut existing.payload, payload);
                let id = existing.id.clone();
                debug!(op_id = %id, kind = %kind, target = %target, "Coalesced queued update");
                self.persist_pending(pending)?;
                return Ok(id);
            }
        }

        let entry = QueuedOperation {
            id: new_id(),
            shop_id: shop_id.to_string(),
            kind,
            payload,
            target_entity_id: Some(target),
            enqueued_at: now_iso(),
            retry_count: 0,
        };
        let id = entry.id.clone();
        debug!(op_id = %id, kind = %entry.kind, shop_id, "Enqueued sync operation");
        inner.pending.push(entry);
        if let Err(e) = self.persist_pending(&inner.pending) {
            inner.pending.pop();
            return Err(e);
        }
        Ok(id)
    }

    /// Snapshot of the queue in FIFO order.
    pub fn peek_all(&self) -> Vec<QueuedOperation> {
        self.lock()
            .map(|inner| inner.pending.clone())
            .unwrap_or_default()
    }

    /// Claim an entry for one remote attempt, returning its current payload.
    /// `None` when the entry is gone or another attempt holds it.
    pub fn begin_attempt(&self, op_id: &str) -> PosResult<Option<InFlight<'_>>> {
        let mut inner = self.lock()?;
        let Some(entry) = inner.pending.iter().find(|queued| queued.id == op_id).cloned() else {
            return Ok(None);
        };
        if !inner.in_flight.insert(entry.id.clone()) {
            return Ok(None);
        }
        Ok(Some(InFlight { queue: self, entry }))
    }

    /// Drop an operation after confirmed success. Unknown ids are a no-op.
    pub fn remove(&self, op_id: &str) -> PosResult<bool> {
        let mut inner = self.lock()?;
        let before = inner.pending.len();
        inner.pending.retain(|queued| queued.id != op_id);
        if inner.pending.len() == before {
            return Ok(false);
        }
        self.persist_pending(&inner.pending)?;
        Ok(true)
    }

    /// Count one failed attempt. The attempt that reaches the retry bound
    /// moves the operation to the dead-letter list.
    pub fn mark_failed(&self, op_id: &str, error: &str) -> PosResult<FailureOutcome> {
        let mut inner = self.lock()?;
        let Some(index) = inner.pending.iter().position(|queued| queued.id == op_id) else {
            return Ok(FailureOutcome::Missing);
        };

        inner.pending[index].retry_count += 1;
        let retry_count = inner.pending[index].retry_count;

        if retry_count < self.max_retries {
            self.persist_pending(&inner.pending)?;
            return Ok(FailureOutcome::Retrying { retry_count });
        }

        let operation = inner.pending.remove(index);
        warn!(
            op_id = %operation.id,
            kind = %operation.kind,
            retry_count,
            error,
            "Sync operation exhausted retries; moved to dead letters"
        );
        inner.dead.push(DeadLetter {
            operation,
            last_error: error.to_string(),
            failed_at: now_iso(),
        });
        self.persist_pending(&inner.pending)?;
        self.persist_dead(&inner.dead)?;
        Ok(FailureOutcome::DeadLettered)
    }

    pub fn count(&self) -> usize {
        self.lock().map(|inner| inner.pending.len()).unwrap_or(0)
    }

    /// `true` while an earlier write for the same record is still waiting.
    /// Later writes for it must queue behind it to keep replay order.
    pub fn has_pending_for(&self, target_id: &str) -> bool {
        self.lock()
            .map(|inner| {
                inner
                    .pending
                    .iter()
                    .any(|queued| queued.target_entity_id.as_deref() == Some(target_id))
            })
            .unwrap_or(false)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock()
            .map(|inner| inner.dead.clone())
            .unwrap_or_default()
    }

    /// Give a dead-lettered operation a fresh retry budget at the back of
    /// the queue.
    pub fn requeue_dead_letter(&self, op_id: &str) -> PosResult<bool> {
        let mut inner = self.lock()?;
        let Some(index) = inner.dead.iter().position(|d| d.operation.id == op_id) else {
            return Ok(false);
        };
        let mut operation = inner.dead.remove(index).operation;
        operation.retry_count = 0;
        info!(op_id = %operation.id, kind = %operation.kind, "Requeued dead-lettered operation");
        inner.pending.push(operation);
        self.persist_pending(&inner.pending)?;
        self.persist_dead(&inner.dead)?;
        Ok(true)
    }

    pub fn discard_dead_letter(&self, op_id: &str) -> PosResult<bool> {
        let mut inner = self.lock()?;
        let before = inner.dead.len();
        inner.dead.retain(|d| d.operation.id != op_id);
        if inner.dead.len() == before {
            return Ok(false);
        }
        warn!(op_id, "Discarded dead-lettered operation");
        self.persist_dead(&inner.dead)?;
        Ok(true)
    }

    fn lock(&self) -> PosResult<std::sync::MutexGuard<'_, QueueInner>> {
        self.inner
            .lock()
            .map_err(|e| PosError::Storage(format!("queue lock poisoned: {e}")))
    }

    fn persist_pending(&self, pending: &[QueuedOperation]) -> PosResult<()> {
        self.write_blob(QUEUE_BLOB_KEY, &serde_json::to_vec(pending)?)
    }

    fn persist_dead(&self, dead: &[DeadLetter]) -> PosResult<()> {
        self.write_blob(DEAD_LETTER_BLOB_KEY, &serde_json::to_vec(dead)?)
    }

    fn write_blob(&self, key: &str, data: &[u8]) -> PosResult<()> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| PosError::Storage(e.to_string()))?;
        db::put_blob(&conn, key, data).map_err(PosError::Storage)
    }
}

/// Merge a newer update payload into a queued one. Field patches are
/// combined with the newer values winning; anything else is replaced.
fn coalesce_payload(existing: &mut Value, newer: Value) {
    let merged = match (existing.get("changes"), newer.get("changes")) {
        (Some(Value::Object(old)), Some(Value::Object(new))) => {
            let mut combined = old.clone();
            for (key, value) in new {
                combined.insert(key.clone(), value.clone());
            }
            Some(Value::Object(combined))
        }
        _ => None,
    };

    *existing = newer;
    if let (Some(changes), Value::Object(map)) = (merged, existing) {
        map.insert("changes".to_string(), changes);
    }
}

/// Read a JSON list blob. A corrupt blob is set aside under a separate key
/// and treated as empty so the app can still start.
fn read_list<T: serde::de::DeserializeOwned>(
    conn: &rusqlite::Connection,
    key: &str,
) -> PosResult<Vec<T>> {
    let Some(raw) = db::get_blob(conn, key).map_err(PosError::Storage)? else {
        return Ok(Vec::new());
    };
    match serde_json::from_slice::<Vec<T>>(&raw) {
        Ok(list) => Ok(list),
        Err(e) => {
            warn!(key, error = %e, "Persisted list is unreadable; setting it aside");
            db::put_blob(conn, CORRUPT_QUEUE_BLOB_KEY, &raw).map_err(PosError::Storage)?;
            db::delete_blob(conn, key).map_err(PosError::Storage)?;
            Ok(Vec::new())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now_iso, Category};
    use serde_json::json;

    const SHOP: &str = "s1";

    fn test_queue() -> (Arc<DbState>, OperationQueue) {
        let db = Arc::new(db::open_in_memory().expect("open db"));
        let queue = OperationQueue::load(db.clone(), DEFAULT_MAX_RETRIES).expect("load queue");
        (db, queue)
    }

    fn create_category(id: &str) -> Operation {
        Operation::CreateCategory(Category {
            id: id.into(),
            shop_id: "s1".into(),
            name: format!("Category {id}"),
            created_at: now_iso(),
            updated_at: now_iso(),
        })
    }

    fn update_product(id: &str, changes: Value) -> Operation {
        Operation::UpdateProduct {
            id: id.into(),
            changes,
        }
    }

    #[test]
    fn test_enqueue_preserves_fifo_order() {
        let (_db, queue) = test_queue();
        queue.enqueue(SHOP, &create_category("a")).unwrap();
        queue.enqueue(SHOP, &create_category("b")).unwrap();
        queue.enqueue(SHOP, &create_category("c")).unwrap();

        let targets: Vec<_> = queue
            .peek_all()
            .into_iter()
            .map(|q| q.target_entity_id.unwrap())
            .collect();
        assert_eq!(targets, vec!["a", "b", "c"]);
        assert!(queue.peek_all().iter().all(|q| q.retry_count == 0));
    }

    #[test]
    fn test_updates_to_same_target_coalesce() {
        let (_db, queue) = test_queue();
        let first = queue
            .enqueue(SHOP, &update_product("p1", json!({ "price": 2.0 })))
            .unwrap();
        let second = queue
            .enqueue(SHOP, &update_product("p1", json!({ "price": 3.0 })))
            .unwrap();

        assert_eq!(first, second);
        let all = queue.peek_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload["changes"], json!({ "price": 3.0 }));
    }

    #[test]
    fn test_coalescing_keeps_earlier_fields() {
        let (_db, queue) = test_queue();
        queue
            .enqueue(SHOP, &update_product("p1", json!({ "price": 2.0, "name": "Tea" })))
            .unwrap();
        queue
            .enqueue(SHOP, &update_product("p1", json!({ "price": 3.0 })))
            .unwrap();

        let all = queue.peek_all();
        assert_eq!(all.len(), 1);
        assert_eq!(
            all[0].payload["changes"],
            json!({ "price": 3.0, "name": "Tea" })
        );
    }

    #[test]
    fn test_creates_and_other_targets_never_coalesce() {
        let (_db, queue) = test_queue();
        queue.enqueue(SHOP, &create_category("a")).unwrap();
        queue.enqueue(SHOP, &create_category("a")).unwrap();
        queue
            .enqueue(SHOP, &update_product("p1", json!({ "price": 2.0 })))
            .unwrap();
        queue
            .enqueue(SHOP, &update_product("p2", json!({ "price": 2.0 })))
            .unwrap();
        queue
            .enqueue(SHOP, &Operation::UpdateCustomer {
                id: "p1".into(),
                changes: json!({ "name": "x" }),
            })
            .unwrap();
        assert_eq!(queue.count(), 5);
    }

    #[test]
    fn test_update_during_attempt_gets_its_own_entry() {
        let (_db, queue) = test_queue();
        let first = queue
            .enqueue(SHOP, &update_product("p1", json!({ "price": 7.0 })))
            .unwrap();

        let attempt = queue.begin_attempt(&first).unwrap().unwrap();
        assert!(queue.begin_attempt(&first).unwrap().is_none(), "claimed once");
        let second = queue
            .enqueue(SHOP, &update_product("p1", json!({ "name": "Renamed" })))
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(attempt.entry().payload["changes"], json!({ "price": 7.0 }));

        // The sent payload is acknowledged; the later edit stays queued.
        queue.remove(&first).unwrap();
        drop(attempt);
        let pending = queue.peek_all();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);
        assert_eq!(pending[0].payload["changes"], json!({ "name": "Renamed" }));

        // Released entries coalesce again.
        let third = queue
            .enqueue(SHOP, &update_product("p1", json!({ "price": 8.0 })))
            .unwrap();
        assert_eq!(third, second);
    }

    #[test]
    fn test_attempt_sees_latest_coalesced_payload() {
        let (_db, queue) = test_queue();
        let id = queue
            .enqueue(SHOP, &update_product("p1", json!({ "price": 7.0 })))
            .unwrap();
        let stale = queue.peek_all();
        queue
            .enqueue(SHOP, &update_product("p1", json!({ "name": "Renamed" })))
            .unwrap();

        let attempt = queue.begin_attempt(&stale[0].id).unwrap().unwrap();
        assert_eq!(attempt.entry().id, id);
        assert_eq!(
            attempt.entry().payload["changes"],
            json!({ "price": 7.0, "name": "Renamed" })
        );
    }

    #[test]
    fn test_entries_are_stamped_and_never_coalesce_across_shops() {
        let (_db, queue) = test_queue();
        queue
            .enqueue(SHOP, &update_product("p1", json!({ "price": 2.0 })))
            .unwrap();
        queue
            .enqueue("s2", &update_product("p1", json!({ "price": 3.0 })))
            .unwrap();

        let shops: Vec<_> = queue.peek_all().into_iter().map(|q| q.shop_id).collect();
        assert_eq!(shops, vec![SHOP, "s2"]);
    }

    #[test]
    fn test_bounded_retry_dead_letters_on_fifth_failure() {
        let (_db, queue) = test_queue();
        let id = queue.enqueue(SHOP, &create_category("a")).unwrap();

        for attempt in 1..DEFAULT_MAX_RETRIES {
            let outcome = queue.mark_failed(&id, "HTTP 500").unwrap();
            assert_eq!(
                outcome,
                FailureOutcome::Retrying {
                    retry_count: attempt
                }
            );
            assert_eq!(queue.count(), 1, "still queued after {attempt} failures");
        }

        let outcome = queue.mark_failed(&id, "HTTP 500").unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered);
        assert_eq!(queue.count(), 0);

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].operation.id, id);
        assert_eq!(dead[0].last_error, "HTTP 500");

        assert_eq!(
            queue.mark_failed(&id, "HTTP 500").unwrap(),
            FailureOutcome::Missing
        );
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_db, queue) = test_queue();
        let id = queue.enqueue(SHOP, &create_category("a")).unwrap();
        assert!(queue.remove(&id).unwrap());
        assert!(!queue.remove(&id).unwrap());
        assert_eq!(queue.count(), 0);
    }

    #[test]
    fn test_queue_survives_reload() {
        let (db, queue) = test_queue();
        queue.enqueue(SHOP, &create_category("a")).unwrap();
        let failing = queue.enqueue(SHOP, &create_category("b")).unwrap();
        queue.mark_failed(&failing, "timeout").unwrap();
        drop(queue);

        let reloaded = OperationQueue::load(db, DEFAULT_MAX_RETRIES).unwrap();
        let all = reloaded.peek_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].retry_count, 1);
        assert!(matches!(
            all[0].operation().unwrap(),
            Operation::CreateCategory(_)
        ));
    }

    #[test]
    fn test_dead_letter_requeue_and_discard() {
        let (db, queue) = test_queue();
        let a = queue.enqueue(SHOP, &create_category("a")).unwrap();
        let b = queue.enqueue(SHOP, &create_category("b")).unwrap();
        for _ in 0..DEFAULT_MAX_RETRIES {
            queue.mark_failed(&a, "rejected").unwrap();
            queue.mark_failed(&b, "rejected").unwrap();
        }
        assert_eq!(queue.dead_letters().len(), 2);

        assert!(queue.requeue_dead_letter(&a).unwrap());
        assert!(queue.discard_dead_letter(&b).unwrap());
        assert!(!queue.discard_dead_letter(&b).unwrap());

        let reloaded = OperationQueue::load(db, DEFAULT_MAX_RETRIES).unwrap();
        let pending = reloaded.peek_all();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a);
        assert_eq!(pending[0].retry_count, 0);
        assert!(reloaded.dead_letters().is_empty());
    }

    #[test]
    fn test_corrupt_blob_is_set_aside() {
        let db = Arc::new(db::open_in_memory().unwrap());
        {
            let conn = db.conn.lock().unwrap();
            db::put_blob(&conn, QUEUE_BLOB_KEY, b"{not json").unwrap();
        }
        let queue = OperationQueue::load(db.clone(), DEFAULT_MAX_RETRIES).unwrap();
        assert_eq!(queue.count(), 0);

        let conn = db.conn.lock().unwrap();
        assert!(db::get_blob(&conn, CORRUPT_QUEUE_BLOB_KEY)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_persisted_record_shape() {
        let (db, queue) = test_queue();
        queue.enqueue(SHOP, &create_category("a")).unwrap();

        let conn = db.conn.lock().unwrap();
        let raw = db::get_blob(&conn, QUEUE_BLOB_KEY).unwrap().unwrap();
        let records: Value = serde_json::from_slice(&raw).unwrap();
        let record = &records[0];
        assert_eq!(record["type"], "CREATE_CATEGORY");
        assert_eq!(record["shopId"], SHOP);
        assert_eq!(record["targetEntityId"], "a");
        assert_eq!(record["retryCount"], 0);
        assert!(record["enqueuedAt"].is_string());
        assert_eq!(record["payload"]["id"], "a");
    }
}
