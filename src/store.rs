//! In-memory snapshot of the active shop's data, persisted as a single
//! zstd-compressed JSON blob.
//!
//! The snapshot only ever holds one shop's records: it is replaced
//! wholesale after a remote login and filtered down to one shop after an
//! offline login. Mutations run against a copy and are swapped in and
//! persisted only when the closure succeeds.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::models::{ShopData, ShopScoped, User};

pub const SNAPSHOT_BLOB_KEY: &str = "snapshot";
const SNAPSHOT_ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalSnapshot {
    pub active_shop_id: Option<String>,
    pub current_user: Option<User>,
    pub data: ShopData,
}

impl LocalSnapshot {
    /// `true` when every cached record belongs to the active shop (or the
    /// snapshot is empty).
    pub fn is_homogeneous(&self) -> bool {
        match self.active_shop_id.as_deref() {
            Some(shop_id) => foreign_record_count(&self.data, shop_id) == 0,
            None => shop_ids(&self.data).is_empty(),
        }
    }
}

pub struct LocalStore {
    db: Arc<DbState>,
    snapshot: Mutex<LocalSnapshot>,
}

impl LocalStore {
    /// Load the persisted snapshot, starting empty when none exists or the
    /// blob cannot be decoded.
    pub fn load(db: Arc<DbState>) -> PosResult<Self> {
        let raw = {
            let conn = db.conn.lock().map_err(|e| PosError::Storage(e.to_string()))?;
            db::get_blob(&conn, SNAPSHOT_BLOB_KEY).map_err(PosError::Storage)?
        };

        let snapshot = match raw {
            Some(bytes) => decode_snapshot(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "Persisted snapshot unreadable; starting empty");
                LocalSnapshot::default()
            }),
            None => LocalSnapshot::default(),
        };

        if let Some(shop_id) = snapshot.active_shop_id.as_deref() {
            info!(shop_id, products = snapshot.data.products.len(), "Loaded local snapshot");
        }

        Ok(Self {
            db,
            snapshot: Mutex::new(snapshot),
        })
    }

    /// Clone of the current snapshot.
    pub fn snapshot(&self) -> PosResult<LocalSnapshot> {
        Ok(self.lock()?.clone())
    }

    /// Run a read-only closure against the snapshot.
    pub fn read<R>(&self, f: impl FnOnce(&LocalSnapshot) -> R) -> PosResult<R> {
        let guard = self.lock()?;
        Ok(f(&guard))
    }

    pub fn active_shop_id(&self) -> PosResult<Option<String>> {
        self.read(|s| s.active_shop_id.clone())
    }

    /// Apply a mutation atomically: the closure works on a copy, which
    /// replaces the live snapshot and is persisted only on `Ok`.
    pub fn update<R>(
        &self,
        f: impl FnOnce(&mut LocalSnapshot) -> PosResult<R>,
    ) -> PosResult<R> {
        let mut guard = self.lock()?;
        let mut working = guard.clone();
        let result = f(&mut working)?;
        self.persist(&working)?;
        *guard = working;
        Ok(result)
    }

    /// Replace everything with one shop's data set.
    pub fn replace(
        &self,
        shop_id: &str,
        data: ShopData,
        current_user: Option<User>,
    ) -> PosResult<()> {
        let mut data = data;
        let stray = retain_shop(&mut data, shop_id);
        if stray > 0 {
            warn!(shop_id, stray, "Dropped records for other shops from loaded data");
        }

        let snapshot = LocalSnapshot {
            active_shop_id: Some(shop_id.to_string()),
            current_user,
            data,
        };

        let mut guard = self.lock()?;
        self.persist(&snapshot)?;
        *guard = snapshot;
        info!(shop_id, "Local snapshot replaced");
        Ok(())
    }

    /// Forget the active shop and every cached record.
    pub fn clear(&self) -> PosResult<()> {
        let mut guard = self.lock()?;
        let empty = LocalSnapshot::default();
        self.persist(&empty)?;
        *guard = empty;
        info!("Local snapshot cleared");
        Ok(())
    }

    /// Drop every record not owned by `shop_id` and make it the active
    /// shop. Returns how many records were removed.
    pub fn retain_shop(&self, shop_id: &str) -> PosResult<usize> {
        self.update(|snapshot| {
            let removed = retain_shop(&mut snapshot.data, shop_id);
            if snapshot
                .current_user
                .as_ref()
                .is_some_and(|u| u.shop_id != shop_id)
            {
                snapshot.current_user = None;
            }
            snapshot.active_shop_id = Some(shop_id.to_string());
            if removed > 0 {
                info!(shop_id, removed, "Filtered local snapshot to active shop");
            }
            Ok(removed)
        })
    }

    fn lock(&self) -> PosResult<MutexGuard<'_, LocalSnapshot>> {
        self.snapshot
            .lock()
            .map_err(|e| PosError::Storage(format!("snapshot lock poisoned: {e}")))
    }

    fn persist(&self, snapshot: &LocalSnapshot) -> PosResult<()> {
        let json = serde_json::to_vec(snapshot)?;
        let compressed = zstd::encode_all(json.as_slice(), SNAPSHOT_ZSTD_LEVEL)
            .map_err(|e| PosError::Storage(format!("compress snapshot: {e}")))?;
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|e| PosError::Storage(e.to_string()))?;
        db::put_blob(&conn, SNAPSHOT_BLOB_KEY, &compressed).map_err(PosError::Storage)
    }
}

fn decode_snapshot(bytes: &[u8]) -> Result<LocalSnapshot, String> {
    let json = zstd::decode_all(bytes).map_err(|e| format!("decompress snapshot: {e}"))?;
    serde_json::from_slice(&json).map_err(|e| format!("parse snapshot: {e}"))
}

/// Insert `record`, or replace the existing record with the same id.
pub fn upsert<T: ShopScoped>(list: &mut Vec<T>, record: T) {
    match list.iter_mut().find(|existing| existing.id() == record.id()) {
        Some(existing) => *existing = record,
        None => list.push(record),
    }
}

pub fn find<'a, T: ShopScoped>(list: &'a [T], id: &str) -> Option<&'a T> {
    list.iter().find(|record| record.id() == id)
}

pub fn find_mut<'a, T: ShopScoped>(list: &'a mut [T], id: &str) -> Option<&'a mut T> {
    list.iter_mut().find(|record| record.id() == id)
}

fn retain_list<T: ShopScoped>(list: &mut Vec<T>, shop_id: &str) -> usize {
    let before = list.len();
    list.retain(|record| record.shop_id() == shop_id);
    before - list.len()
}

fn retain_option<T: ShopScoped>(slot: &mut Option<T>, shop_id: &str) -> usize {
    if slot.as_ref().is_some_and(|record| record.shop_id() != shop_id) {
        *slot = None;
        return 1;
    }
    0
}

/// Filter a data set down to one shop. Returns the number of records removed.
pub fn retain_shop(data: &mut ShopData, shop_id: &str) -> usize {
    retain_list(&mut data.products, shop_id)
        + retain_list(&mut data.categories, shop_id)
        + retain_list(&mut data.suppliers, shop_id)
        + retain_list(&mut data.stock_movements, shop_id)
        + retain_list(&mut data.sales, shop_id)
        + retain_list(&mut data.customers, shop_id)
        + retain_list(&mut data.debt_transactions, shop_id)
        + retain_list(&mut data.gift_cards, shop_id)
        + retain_list(&mut data.expenses, shop_id)
        + retain_list(&mut data.users, shop_id)
        + retain_list(&mut data.activity_logs, shop_id)
        + retain_list(&mut data.payment_records, shop_id)
        + retain_option(&mut data.settings, shop_id)
        + retain_option(&mut data.subscription, shop_id)
}

fn foreign_record_count(data: &ShopData, shop_id: &str) -> usize {
    shop_ids(data).iter().filter(|id| id.as_str() != shop_id).count()
}

/// Owning shop id of every record in the data set, with repetition.
pub fn shop_ids(data: &ShopData) -> Vec<String> {
    fn collect<T: ShopScoped>(out: &mut Vec<String>, list: &[T]) {
        out.extend(list.iter().map(|r| r.shop_id().to_string()));
    }

    let mut out = Vec::new();
    collect(&mut out, &data.products);
    collect(&mut out, &data.categories);
    collect(&mut out, &data.suppliers);
    collect(&mut out, &data.stock_movements);
    collect(&mut out, &data.sales);
    collect(&mut out, &data.customers);
    collect(&mut out, &data.debt_transactions);
    collect(&mut out, &data.gift_cards);
    collect(&mut out, &data.expenses);
    collect(&mut out, &data.users);
    collect(&mut out, &data.activity_logs);
    collect(&mut out, &data.payment_records);
    if let Some(settings) = &data.settings {
        out.push(settings.shop_id.clone());
    }
    if let Some(subscription) = &data.subscription {
        out.push(subscription.shop_id.clone());
    }
    out
}

// ===========================================================================
// Tests
// ===========================================================================
