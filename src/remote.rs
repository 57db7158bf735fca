//! Contract of the remote data-access layer and the dispatch from queued
//! operations to remote calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

use crate::error::RemoteError;
use crate::models::{EntityKind, ShopData, ShopSettings, User};
use crate::operations::Operation;

/// Result of a successful remote credential check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user: User,
    #[serde(default)]
    pub settings: Option<ShopSettings>,
}

/// CRUD access to the backend, keyed by collection and record id.
#[async_trait]
pub trait RemoteDataAccess: Send + Sync {
    /// Insert a full record. A uniqueness violation must surface as
    /// [`RemoteError::AlreadyExists`].
    async fn insert(&self, kind: EntityKind, record: &Value) -> Result<(), RemoteError>;

    async fn update(&self, kind: EntityKind, id: &str, changes: &Value)
        -> Result<(), RemoteError>;

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), RemoteError>;

    /// Everything stored for one shop.
    async fn load_shop_data(&self, shop_id: &str) -> Result<ShopData, RemoteError>;

    async fn authenticate_user(
        &self,
        identifier: &str,
        secret: &str,
    ) -> Result<AuthResponse, RemoteError>;

    /// Lightweight reachability check.
    async fn ping(&self) -> bool;
}

/// Run a remote call with an upper bound on its duration.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(timeout.as_secs())),
    }
}

fn record<T: Serialize>(value: &T) -> Result<Value, RemoteError> {
    serde_json::to_value(value).map_err(|e| RemoteError::Encode(e.to_string()))
}

/// Perform the remote write an operation stands for.
pub async fn apply_operation(
    remote: &dyn RemoteDataAccess,
    operation: &Operation,
) -> Result<(), RemoteError> {
    let kind = operation.entity();
    match operation {
        Operation::CreateProduct(r) => remote.insert(kind, &record(r)?).await,
        Operation::CreateCategory(r) => remote.insert(kind, &record(r)?).await,
        Operation::CreateSupplier(r) => remote.insert(kind, &record(r)?).await,
        Operation::CreateStockMovement(r) => remote.insert(kind, &record(r)?).await,
        Operation::CreateSale(r) => remote.insert(kind, &record(r)?).await,
        Operation::CreateCustomer(r) => remote.insert(kind, &record(r)?).await,
        Operation::CreateDebtTransaction(r) => remote.insert(kind, &record(r)?).await,
        Operation::CreateGiftCard(r) => remote.insert(kind, &record(r)?).await,
        Operation::CreateExpense(r) => remote.insert(kind, &record(r)?).await,
        Operation::CreateUser(r) => remote.insert(kind, &record(r)?).await,
        Operation::CreateActivityLog(r) => remote.insert(kind, &record(r)?).await,
        Operation::CreatePaymentRecord(r) => remote.insert(kind, &record(r)?).await,
        Operation::UpdateProduct { id, changes }
        | Operation::UpdateSupplier { id, changes }
        | Operation::UpdateSale { id, changes }
        | Operation::UpdateCustomer { id, changes }
        | Operation::UpdateGiftCard { id, changes }
        | Operation::UpdateUser { id, changes }
        | Operation::UpdateSettings { id, changes }
        | Operation::UpdateSubscription { id, changes } => remote.update(kind, id, changes).await,
        Operation::DeleteCategory { id }
        | Operation::DeleteSupplier { id }
        | Operation::DeleteExpense { id } => remote.delete(kind, id).await,
    }
}
