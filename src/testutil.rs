//! Shared fixtures for unit tests: record builders and an in-memory backend.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::db;
use crate::error::RemoteError;
use crate::models::*;
use crate::remote::{AuthResponse, RemoteDataAccess};
use crate::PosApp;

pub const SHOP_A: &str = "0b6c7a4e-1f2d-4c3b-9a8e-5d6f7a8b9c01";
pub const SHOP_B: &str = "5e4d3c2b-1a0f-4e9d-8c7b-6a5f4e3d2c10";
/// Legacy, non-canonical shop id. Such shops never sync.
pub const LEGACY_SHOP: &str = "shop_1699999999";

pub fn test_db() -> Arc<db::DbState> {
    Arc::new(db::open_in_memory().expect("open in-memory db"))
}

/// Fully wired app over an in-memory database, with `shop_id`'s
/// [`shop_data`] loaded as the active shop.
pub fn test_app(shop_id: &str, online: bool) -> (PosApp, Arc<FakeRemote>) {
    let remote = Arc::new(FakeRemote::new());
    let app = PosApp::with_db(test_db(), remote.clone(), online).expect("wire app");
    app.store
        .replace(shop_id, shop_data(shop_id), None)
        .expect("seed local store");
    (app, remote)
}

pub fn product(shop_id: &str, id: &str, price: f64, stock: f64) -> Product {
    Product {
        id: id.into(),
        shop_id: shop_id.into(),
        name: format!("Product {id}"),
        sku: None,
        barcode: None,
        category_id: None,
        supplier_id: None,
        price,
        cost: price / 2.0,
        stock,
        is_archived: false,
        created_at: now_iso(),
        updated_at: now_iso(),
    }
}

pub fn category(shop_id: &str, id: &str) -> Category {
    Category {
        id: id.into(),
        shop_id: shop_id.into(),
        name: format!("Category {id}"),
        created_at: now_iso(),
        updated_at: now_iso(),
    }
}

pub fn customer(shop_id: &str, id: &str, debt_balance: f64) -> Customer {
    Customer {
        id: id.into(),
        shop_id: shop_id.into(),
        name: format!("Customer {id}"),
        phone: None,
        email: None,
        debt_balance,
        is_archived: false,
        created_at: now_iso(),
        updated_at: now_iso(),
    }
}

pub fn gift_card(shop_id: &str, id: &str, balance: f64) -> GiftCard {
    GiftCard {
        id: id.into(),
        shop_id: shop_id.into(),
        code: format!("GC-{id}"),
        initial_balance: balance,
        balance,
        is_active: true,
        created_at: now_iso(),
        updated_at: now_iso(),
    }
}

pub fn user(shop_id: &str, id: &str, email: &str) -> User {
    User {
        id: id.into(),
        shop_id: shop_id.into(),
        name: format!("User {id}"),
        email: email.into(),
        username: None,
        password_hash: None,
        role: UserRole::Owner,
        status: UserStatus::Active,
        last_login: None,
        created_at: now_iso(),
        updated_at: now_iso(),
    }
}

pub fn settings(shop_id: &str) -> ShopSettings {
    ShopSettings {
        id: shop_id.into(),
        shop_id: shop_id.into(),
        shop_name: format!("Shop {shop_id}"),
        currency: "USD".into(),
        tax_rate: 0.0,
        low_stock_threshold: 2.0,
        created_at: now_iso(),
        updated_at: now_iso(),
    }
}

pub fn subscription(shop_id: &str, days_left: i64) -> Subscription {
    let end = chrono::Utc::now() + chrono::Duration::days(days_left);
    Subscription {
        id: format!("sub-{shop_id}"),
        shop_id: shop_id.into(),
        plan: "basic".into(),
        status: SubscriptionStatus::Active,
        current_period_end: end.to_rfc3339(),
        created_at: now_iso(),
        updated_at: now_iso(),
    }
}

/// A small but complete data set for one shop.
pub fn shop_data(shop_id: &str) -> ShopData {
    ShopData {
        products: vec![
            product(shop_id, &format!("{shop_id}-p1"), 2.5, 10.0),
            product(shop_id, &format!("{shop_id}-p2"), 4.0, 3.0),
        ],
        categories: vec![category(shop_id, &format!("{shop_id}-c1"))],
        customers: vec![customer(shop_id, &format!("{shop_id}-cust1"), 0.0)],
        users: vec![user(shop_id, &format!("{shop_id}-u1"), "owner@shop.test")],
        settings: Some(settings(shop_id)),
        subscription: Some(subscription(shop_id, 30)),
        ..ShopData::default()
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

struct Account {
    identifier: String,
    secret: String,
    response: AuthResponse,
}

#[derive(Default)]
struct FakeInner {
    tables: HashMap<EntityKind, BTreeMap<String, Value>>,
    calls: Vec<String>,
    failing_ids: HashSet<String>,
    unreachable: bool,
    accounts: Vec<Account>,
    shops: HashMap<String, ShopData>,
}

/// Backend double that enforces unique ids per collection, records every
/// write as `verb:collection:id`, and can be told to fail.
#[derive(Default)]
pub struct FakeRemote {
    inner: Mutex<FakeInner>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn record(&self, kind: EntityKind, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(&kind)
            .and_then(|t| t.get(id).cloned())
    }

    pub fn record_count(&self, kind: EntityKind) -> usize {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(&kind)
            .map_or(0, BTreeMap::len)
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap().unreachable = unreachable;
    }

    /// Make every write targeting `id` fail with a server error.
    pub fn fail_writes_for(&self, id: &str) {
        self.inner.lock().unwrap().failing_ids.insert(id.to_string());
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().failing_ids.clear();
    }

    pub fn seed_shop(&self, shop_id: &str, data: ShopData) {
        self.inner
            .lock()
            .unwrap()
            .shops
            .insert(shop_id.to_string(), data);
    }

    pub fn add_account(&self, identifier: &str, secret: &str, user: User) {
        let settings = Some(settings(&user.shop_id));
        self.inner.lock().unwrap().accounts.push(Account {
            identifier: identifier.to_string(),
            secret: secret.to_string(),
            response: AuthResponse { user, settings },
        });
    }

    /// Put records straight into the backend tables without recording
    /// any calls.
    pub fn seed_records(&self, data: &ShopData) {
        fn put<T: serde::Serialize + ShopScoped>(inner: &mut FakeInner, list: &[T]) {
            let table = inner.tables.entry(T::KIND).or_default();
            for record in list {
                let value = serde_json::to_value(record).expect("serialize seed record");
                table.insert(record.id().to_string(), value);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        put(&mut inner, &data.products);
        put(&mut inner, &data.categories);
        put(&mut inner, &data.customers);
        put(&mut inner, &data.gift_cards);
        put(&mut inner, &data.users);
        put(&mut inner, data.settings.as_slice());
        put(&mut inner, data.subscription.as_slice());
    }

    fn check_write(inner: &mut FakeInner, call: String, id: &str) -> Result<(), RemoteError> {
        if inner.unreachable {
            return Err(RemoteError::Unreachable("fake backend offline".into()));
        }
        inner.calls.push(call);
        if inner.failing_ids.contains(id) {
            return Err(RemoteError::Rejected {
                status: 500,
                message: format!("forced failure for {id}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteDataAccess for FakeRemote {
    async fn insert(&self, kind: EntityKind, record: &Value) -> Result<(), RemoteError> {
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut inner = self.inner.lock().unwrap();
        Self::check_write(
            &mut inner,
            format!("insert:{}:{id}", kind.collection()),
            &id,
        )?;
        let table = inner.tables.entry(kind).or_default();
        if table.contains_key(&id) {
            return Err(RemoteError::AlreadyExists(format!(
                "duplicate key value violates unique constraint \"{}_pkey\"",
                kind.collection()
            )));
        }
        table.insert(id, record.clone());
        Ok(())
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        changes: &Value,
    ) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_write(&mut inner, format!("update:{}:{id}", kind.collection()), id)?;
        let Some(Value::Object(existing)) = inner
            .tables
            .get_mut(&kind)
            .and_then(|t| t.get_mut(id))
        else {
            return Err(RemoteError::Rejected {
                status: 404,
                message: format!("{} {id} not found", kind.collection()),
            });
        };
        if let Value::Object(patch) = changes {
            for (key, value) in patch {
                existing.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_write(&mut inner, format!("delete:{}:{id}", kind.collection()), id)?;
        if let Some(table) = inner.tables.get_mut(&kind) {
            table.remove(id);
        }
        Ok(())
    }

    async fn load_shop_data(&self, shop_id: &str) -> Result<ShopData, RemoteError> {
        let inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(RemoteError::Unreachable("fake backend offline".into()));
        }
        Ok(inner.shops.get(shop_id).cloned().unwrap_or_default())
    }

    async fn authenticate_user(
        &self,
        identifier: &str,
        secret: &str,
    ) -> Result<AuthResponse, RemoteError> {
        let inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(RemoteError::Unreachable("fake backend offline".into()));
        }
        inner
            .accounts
            .iter()
            .find(|a| a.identifier.eq_ignore_ascii_case(identifier) && a.secret == secret)
            .map(|a| a.response.clone())
            .ok_or_else(|| RemoteError::Unauthorized("Invalid login credentials".into()))
    }

    async fn ping(&self) -> bool {
        !self.inner.lock().unwrap().unreachable
    }
}

/// Delegates to a [`FakeRemote`] but holds every `update` until
/// [`GatedRemote::release`] is called.
pub struct GatedRemote {
    pub inner: Arc<FakeRemote>,
    entered: Notify,
    released: Notify,
}

impl GatedRemote {
    pub fn new(inner: Arc<FakeRemote>) -> Self {
        Self {
            inner,
            entered: Notify::new(),
            released: Notify::new(),
        }
    }

    /// Resolves once an `update` call is waiting at the gate.
    pub async fn update_started(&self) {
        self.entered.notified().await;
    }

    /// Let one held (or the next) `update` through.
    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl RemoteDataAccess for GatedRemote {
    async fn insert(&self, kind: EntityKind, record: &Value) -> Result<(), RemoteError> {
        self.inner.insert(kind, record).await
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        changes: &Value,
    ) -> Result<(), RemoteError> {
        self.entered.notify_one();
        self.released.notified().await;
        self.inner.update(kind, id, changes).await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError> {
        self.inner.delete(kind, id).await
    }

    async fn load_shop_data(&self, shop_id: &str) -> Result<ShopData, RemoteError> {
        self.inner.load_shop_data(shop_id).await
    }

    async fn authenticate_user(
        &self,
        identifier: &str,
        secret: &str,
    ) -> Result<AuthResponse, RemoteError> {
        self.inner.authenticate_user(identifier, secret).await
    }

    async fn ping(&self) -> bool {
        self.inner.ping().await
    }
}
