//! Domain records held in the local snapshot and written to the backend.
//!
//! Every record carries a client-generated `id`, the owning `shopId` and
//! ISO-8601 `createdAt`/`updatedAt` stamps. Field names serialize in
//! camelCase to match the backend's JSON shape.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current UTC time as an RFC 3339 string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Fresh client-side record id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Parse an RFC 3339 timestamp, returning `None` for anything malformed.
pub fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Access to the fields every shop-scoped record shares.
pub trait ShopScoped {
    const KIND: EntityKind;

    fn id(&self) -> &str;
    fn shop_id(&self) -> &str;
}

macro_rules! shop_scoped {
    ($($ty:ident => $kind:ident),+ $(,)?) => {
        $(
            impl ShopScoped for $ty {
                const KIND: EntityKind = EntityKind::$kind;

                fn id(&self) -> &str {
                    &self.id
                }

                fn shop_id(&self) -> &str {
                    &self.shop_id
                }
            }
        )+
    };
}

/// Backend collection a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Sale,
    Customer,
    Category,
    Supplier,
    Expense,
    GiftCard,
    User,
    ActivityLog,
    StockMovement,
    DebtTransaction,
    Subscription,
    PaymentRecord,
    Settings,
}

impl EntityKind {
    /// REST collection name.
    pub fn collection(self) -> &'static str {
        match self {
            EntityKind::Product => "products",
            EntityKind::Sale => "sales",
            EntityKind::Customer => "customers",
            EntityKind::Category => "categories",
            EntityKind::Supplier => "suppliers",
            EntityKind::Expense => "expenses",
            EntityKind::GiftCard => "gift_cards",
            EntityKind::User => "users",
            EntityKind::ActivityLog => "activity_logs",
            EntityKind::StockMovement => "stock_movements",
            EntityKind::DebtTransaction => "debt_transactions",
            EntityKind::Subscription => "subscriptions",
            EntityKind::PaymentRecord => "payment_records",
            EntityKind::Settings => "shop_settings",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Sale => "sale",
            EntityKind::Customer => "customer",
            EntityKind::Category => "category",
            EntityKind::Supplier => "supplier",
            EntityKind::Expense => "expense",
            EntityKind::GiftCard => "gift card",
            EntityKind::User => "user",
            EntityKind::ActivityLog => "activity log",
            EntityKind::StockMovement => "stock movement",
            EntityKind::DebtTransaction => "debt transaction",
            EntityKind::Subscription => "subscription",
            EntityKind::PaymentRecord => "payment record",
            EntityKind::Settings => "settings",
        }
    }
}

// ---------------------------------------------------------------------------
// Catalogue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub shop_id: String,
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub supplier_id: Option<String>,
    pub price: f64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub stock: f64,
    #[serde(default)]
    pub is_archived: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: String,
    pub shop_id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Supplier {
    pub id: String,
    pub shop_id: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockReason {
    Sale,
    Restock,
    Adjustment,
    Void,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockMovement {
    pub id: String,
    pub shop_id: String,
    pub product_id: String,
    pub quantity_change: f64,
    pub stock_after: f64,
    pub reason: StockReason,
    #[serde(default)]
    pub reference_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Sales and customers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Credit,
    GiftCard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    Completed,
    Voided,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleItem {
    pub product_id: String,
    pub name: String,
    pub quantity: f64,
    pub unit_price: f64,
}

impl SaleItem {
    pub fn line_total(&self) -> f64 {
        self.quantity * self.unit_price
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    pub id: String,
    pub shop_id: String,
    pub items: Vec<SaleItem>,
    pub subtotal: f64,
    #[serde(default)]
    pub discount: f64,
    pub total: f64,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub gift_card_id: Option<String>,
    #[serde(default)]
    pub cashier_id: Option<String>,
    pub status: SaleStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub shop_id: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub debt_balance: f64,
    #[serde(default)]
    pub is_archived: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebtKind {
    /// Goods taken on credit; increases the balance.
    Charge,
    /// Money received against the balance.
    Payment,
    /// Cancels the charge of a voided credit sale.
    Reversal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebtTransaction {
    pub id: String,
    pub shop_id: String,
    pub customer_id: String,
    pub kind: DebtKind,
    pub amount: f64,
    pub balance_after: f64,
    #[serde(default)]
    pub sale_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftCard {
    pub id: String,
    pub shop_id: String,
    pub code: String,
    pub initial_balance: f64,
    pub balance: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: String,
    pub shop_id: String,
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    pub amount: f64,
    pub created_at: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Users, audit, billing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Owner,
    Manager,
    Cashier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub shop_id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
    /// bcrypt hash used for offline credential checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    pub role: UserRole,
    pub status: UserStatus,
    #[serde(default)]
    pub last_login: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    /// Case-insensitive match on email or username.
    pub fn matches_identifier(&self, identifier: &str) -> bool {
        let wanted = identifier.trim();
        self.email.eq_ignore_ascii_case(wanted)
            || self
                .username
                .as_deref()
                .is_some_and(|u| u.eq_ignore_ascii_case(wanted))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLog {
    pub id: String,
    pub shop_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub action: String,
    pub entity_type: EntityKind,
    pub entity_id: String,
    #[serde(default)]
    pub details: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub shop_id: String,
    pub plan: String,
    pub status: SubscriptionStatus,
    pub current_period_end: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Subscription {
    /// Expired when cancelled, or when the paid period has ended. An
    /// unparseable period end counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.status == SubscriptionStatus::Cancelled {
            return true;
        }
        parse_iso(&self.current_period_end).map_or(true, |end| end < now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: String,
    pub shop_id: String,
    pub subscription_id: String,
    pub amount: f64,
    pub currency: String,
    #[serde(default)]
    pub reference: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Per-shop configuration. `id` equals `shopId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShopSettings {
    pub id: String,
    pub shop_id: String,
    pub shop_name: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub tax_rate: f64,
    #[serde(default)]
    pub low_stock_threshold: f64,
    pub created_at: String,
    pub updated_at: String,
}

shop_scoped! {
    Product => Product,
    Category => Category,
    Supplier => Supplier,
    StockMovement => StockMovement,
    Sale => Sale,
    Customer => Customer,
    DebtTransaction => DebtTransaction,
    GiftCard => GiftCard,
    Expense => Expense,
    User => User,
    ActivityLog => ActivityLog,
    Subscription => Subscription,
    PaymentRecord => PaymentRecord,
    ShopSettings => Settings,
}

fn default_true() -> bool {
    true
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Everything the backend holds for one shop, as returned by a bulk load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShopData {
    pub products: Vec<Product>,
    pub categories: Vec<Category>,
    pub suppliers: Vec<Supplier>,
    pub stock_movements: Vec<StockMovement>,
    pub sales: Vec<Sale>,
    pub customers: Vec<Customer>,
    pub debt_transactions: Vec<DebtTransaction>,
    pub gift_cards: Vec<GiftCard>,
    pub expenses: Vec<Expense>,
    pub users: Vec<User>,
    pub activity_logs: Vec<ActivityLog>,
    pub payment_records: Vec<PaymentRecord>,
    pub settings: Option<ShopSettings>,
    pub subscription: Option<Subscription>,
}

/// Fields a partial update may never touch.
const IMMUTABLE_FIELDS: &[&str] = &["id", "shopId", "createdAt"];

/// Merge a camelCase JSON patch into a record, stamping `updatedAt`.
///
/// Identity fields in the patch are ignored. Fails when the patch is not a
/// JSON object or produces a record that no longer deserializes.
pub fn apply_changes<T>(record: &T, changes: &Value) -> Result<T, serde_json::Error>
where
    T: Serialize + DeserializeOwned,
{
    let mut merged = serde_json::to_value(record)?;
    let patch = changes
        .as_object()
        .ok_or_else(|| {
            <serde_json::Error as serde::de::Error>::custom("changes must be a JSON object")
        })?;

    if let Value::Object(ref mut map) = merged {
        for (key, value) in patch {
            if IMMUTABLE_FIELDS.contains(&key.as_str()) {
                continue;
            }
            map.insert(key.clone(), value.clone());
        }
        map.insert("updatedAt".to_string(), Value::String(now_iso()));
    }

    serde_json::from_value(merged)
}

/// `true` when `raw` is a hyphenated UUID, the canonical backend id format.
pub fn is_canonical_id(raw: &str) -> bool {
    raw.len() == 36 && Uuid::parse_str(raw).is_ok()
}
