//! The closed set of remote mutations the sync queue can carry.
//!
//! Each variant pairs an entity with a verb and owns its typed payload.
//! On disk an operation is split into a `type` tag and a JSON `payload`
//! (see [`Operation::encode`] / [`Operation::decode`]) so that queue
//! records written by a newer build can still be read and discarded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{
    ActivityLog, Category, Customer, DebtTransaction, EntityKind, Expense, GiftCard, PaymentRecord,
    Product, Sale, StockMovement, Supplier, User,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    CreateProduct(Product),
    UpdateProduct { id: String, changes: Value },
    CreateCategory(Category),
    DeleteCategory { id: String },
    CreateSupplier(Supplier),
    UpdateSupplier { id: String, changes: Value },
    DeleteSupplier { id: String },
    CreateStockMovement(StockMovement),
    CreateSale(Sale),
    UpdateSale { id: String, changes: Value },
    CreateCustomer(Customer),
    UpdateCustomer { id: String, changes: Value },
    CreateDebtTransaction(DebtTransaction),
    CreateGiftCard(GiftCard),
    UpdateGiftCard { id: String, changes: Value },
    CreateExpense(Expense),
    DeleteExpense { id: String },
    CreateUser(User),
    UpdateUser { id: String, changes: Value },
    CreateActivityLog(ActivityLog),
    UpdateSettings { id: String, changes: Value },
    CreatePaymentRecord(PaymentRecord),
    UpdateSubscription { id: String, changes: Value },
}

impl Operation {
    pub fn entity(&self) -> EntityKind {
        match self {
            Operation::CreateProduct(_) | Operation::UpdateProduct { .. } => EntityKind::Product,
            Operation::CreateCategory(_) | Operation::DeleteCategory { .. } => EntityKind::Category,
            Operation::CreateSupplier(_)
            | Operation::UpdateSupplier { .. }
            | Operation::DeleteSupplier { .. } => EntityKind::Supplier,
            Operation::CreateStockMovement(_) => EntityKind::StockMovement,
            Operation::CreateSale(_) | Operation::UpdateSale { .. } => EntityKind::Sale,
            Operation::CreateCustomer(_) | Operation::UpdateCustomer { .. } => EntityKind::Customer,
            Operation::CreateDebtTransaction(_) => EntityKind::DebtTransaction,
            Operation::CreateGiftCard(_) | Operation::UpdateGiftCard { .. } => EntityKind::GiftCard,
            Operation::CreateExpense(_) | Operation::DeleteExpense { .. } => EntityKind::Expense,
            Operation::CreateUser(_) | Operation::UpdateUser { .. } => EntityKind::User,
            Operation::CreateActivityLog(_) => EntityKind::ActivityLog,
            Operation::UpdateSettings { .. } => EntityKind::Settings,
            Operation::CreatePaymentRecord(_) => EntityKind::PaymentRecord,
            Operation::UpdateSubscription { .. } => EntityKind::Subscription,
        }
    }

    pub fn verb(&self) -> Verb {
        match self {
            Operation::CreateProduct(_)
            | Operation::CreateCategory(_)
            | Operation::CreateSupplier(_)
            | Operation::CreateStockMovement(_)
            | Operation::CreateSale(_)
            | Operation::CreateCustomer(_)
            | Operation::CreateDebtTransaction(_)
            | Operation::CreateGiftCard(_)
            | Operation::CreateExpense(_)
            | Operation::CreateUser(_)
            | Operation::CreateActivityLog(_)
            | Operation::CreatePaymentRecord(_) => Verb::Create,
            Operation::UpdateProduct { .. }
            | Operation::UpdateSupplier { .. }
            | Operation::UpdateSale { .. }
            | Operation::UpdateCustomer { .. }
            | Operation::UpdateGiftCard { .. }
            | Operation::UpdateUser { .. }
            | Operation::UpdateSettings { .. }
            | Operation::UpdateSubscription { .. } => Verb::Update,
            Operation::DeleteCategory { .. }
            | Operation::DeleteSupplier { .. }
            | Operation::DeleteExpense { .. } => Verb::Delete,
        }
    }

    /// Id of the record this operation writes.
    pub fn target_id(&self) -> &str {
        match self {
            Operation::CreateProduct(r) => &r.id,
            Operation::CreateCategory(r) => &r.id,
            Operation::CreateSupplier(r) => &r.id,
            Operation::CreateStockMovement(r) => &r.id,
            Operation::CreateSale(r) => &r.id,
            Operation::CreateCustomer(r) => &r.id,
            Operation::CreateDebtTransaction(r) => &r.id,
            Operation::CreateGiftCard(r) => &r.id,
            Operation::CreateExpense(r) => &r.id,
            Operation::CreateUser(r) => &r.id,
            Operation::CreateActivityLog(r) => &r.id,
            Operation::CreatePaymentRecord(r) => &r.id,
            Operation::UpdateProduct { id, .. }
            | Operation::DeleteCategory { id }
            | Operation::UpdateSupplier { id, .. }
            | Operation::DeleteSupplier { id }
            | Operation::UpdateSale { id, .. }
            | Operation::UpdateCustomer { id, .. }
            | Operation::UpdateGiftCard { id, .. }
            | Operation::DeleteExpense { id }
            | Operation::UpdateUser { id, .. }
            | Operation::UpdateSettings { id, .. }
            | Operation::UpdateSubscription { id, .. } => id,
        }
    }

    pub fn is_update(&self) -> bool {
        self.verb() == Verb::Update
    }

    /// Split into the persisted `(type, payload)` pair.
    pub fn encode(&self) -> Result<(String, Value), serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        let kind = tagged
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| <serde_json::Error as serde::ser::Error>::custom("missing type tag"))?;
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok((kind, payload))
    }

    /// Rebuild from a persisted `(type, payload)` pair. Fails for unknown
    /// tags and for payloads that no longer match the variant's shape.
    pub fn decode(kind: &str, payload: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "type": kind,
            "payload": payload,
        }))
    }
}
