//! Entry points for every entity-changing action.
//!
//! Each action runs in the same order: compute the full record from the
//! current snapshot, commit it locally together with an activity-log entry,
//! push the log entry to the backend in the background, then write the
//! change remotely or queue it for the sync engine. Multi-record actions
//! (sales, voids) commit every dependent write on its own, so a partly
//! synced sale only leaves the failed pieces in the queue.

use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{PosError, PosResult};
use crate::models::*;
use crate::operations::Operation;
use crate::queue::OperationQueue;
use crate::remote::{apply_operation, with_timeout, RemoteDataAccess};
use crate::settings::SyncSettings;
use crate::store::{find, find_mut, LocalSnapshot, LocalStore};
use crate::sync::SyncEngine;
use crate::tasks::BackgroundTasks;

/// Where a single remote write ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Synced,
    Queued,
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewProduct {
    pub name: String,
    pub sku: Option<String>,
    pub barcode: Option<String>,
    pub category_id: Option<String>,
    pub supplier_id: Option<String>,
    pub price: f64,
    pub cost: f64,
    pub stock: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewContact {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleLine {
    pub product_id: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSale {
    pub items: Vec<SaleLine>,
    #[serde(default)]
    pub discount: f64,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub gift_card_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewExpense {
    pub description: String,
    pub category: Option<String>,
    pub amount: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
    pub role: UserRole,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPayment {
    pub amount: f64,
    pub currency: String,
    #[serde(default)]
    pub reference: Option<String>,
    /// Days added to the paid period.
    pub period_days: i64,
}

// ---------------------------------------------------------------------------
// Façade
// ---------------------------------------------------------------------------

pub struct Mutations {
    store: Arc<LocalStore>,
    queue: Arc<OperationQueue>,
    engine: Arc<SyncEngine>,
    remote: Arc<dyn RemoteDataAccess>,
    tasks: Arc<BackgroundTasks>,
    settings: SyncSettings,
}

impl Mutations {
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<OperationQueue>,
        engine: Arc<SyncEngine>,
        remote: Arc<dyn RemoteDataAccess>,
        tasks: Arc<BackgroundTasks>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            queue,
            engine,
            remote,
            tasks,
            settings,
        }
    }

    // -- Catalogue ----------------------------------------------------------

    pub async fn add_product(&self, input: NewProduct) -> PosResult<Product> {
        let name = required(&input.name, "Product name")?;
        let price = non_negative(input.price, "Price")?;
        let cost = non_negative(input.cost, "Cost")?;
        let stock = non_negative(input.stock, "Stock")?;

        let (product, log) = self.store.update(|s| {
            let shop_id = active_shop(s)?;
            let now = now_iso();
            let product = Product {
                id: new_id(),
                shop_id,
                name,
                sku: input.sku,
                barcode: input.barcode,
                category_id: input.category_id,
                supplier_id: input.supplier_id,
                price,
                cost,
                stock,
                is_archived: false,
                created_at: now.clone(),
                updated_at: now,
            };
            s.data.products.push(product.clone());
            let log = push_log(
                s,
                "create",
                EntityKind::Product,
                &product.id,
                Some(product.name.as_str()),
            );
            Ok((product, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::CreateProduct(product.clone())).await?;
        Ok(product)
    }

    pub async fn update_product(&self, id: &str, changes: &Value) -> PosResult<Product> {
        let patch = sanitize_patch(changes, &[])?;
        let (product, remote_changes, log) = self.store.update(|s| {
            let (product, remote_changes) = patch_record(&mut s.data.products, id, &patch)?;
            let log = push_log(s, "update", EntityKind::Product, id, None);
            Ok((product, remote_changes, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::UpdateProduct {
            id: id.to_string(),
            changes: remote_changes,
        })
        .await?;
        Ok(product)
    }

    /// Soft delete: archived products stay in history but cannot be sold.
    pub async fn archive_product(&self, id: &str) -> PosResult<Product> {
        let patch = object(json!({ "isArchived": true }));
        let (product, remote_changes, log) = self.store.update(|s| {
            let (product, remote_changes) = patch_record(&mut s.data.products, id, &patch)?;
            let log = push_log(s, "archive", EntityKind::Product, id, Some(product.name.as_str()));
            Ok((product, remote_changes, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::UpdateProduct {
            id: id.to_string(),
            changes: remote_changes,
        })
        .await?;
        Ok(product)
    }

    /// Adjust on-hand stock by `delta` and record the movement. The new
    /// total is computed from the snapshot inside the local commit.
    pub async fn update_stock(
        &self,
        product_id: &str,
        delta: f64,
        reason: StockReason,
    ) -> PosResult<StockMovement> {
        if !delta.is_finite() || delta == 0.0 {
            return Err(PosError::Validation(
                "Stock change must be a non-zero number".into(),
            ));
        }

        let (movement, stock, updated_at, log) = self.store.update(|s| {
            let shop_id = active_shop(s)?;
            let now = now_iso();
            let product = find_mut(&mut s.data.products, product_id)
                .ok_or_else(|| not_found(EntityKind::Product, product_id))?;
            let stock = product.stock + delta;
            if stock < 0.0 {
                return Err(PosError::Validation(format!(
                    "Stock for {} cannot go below zero",
                    product.name
                )));
            }
            product.stock = stock;
            product.updated_at = now.clone();

            let movement = StockMovement {
                id: new_id(),
                shop_id,
                product_id: product_id.to_string(),
                quantity_change: delta,
                stock_after: stock,
                reason,
                reference_id: None,
                created_at: now.clone(),
                updated_at: now.clone(),
            };
            s.data.stock_movements.push(movement.clone());
            let details = format!("{delta:+}");
            let log = push_log(
                s,
                "stock_adjustment",
                EntityKind::Product,
                product_id,
                Some(details.as_str()),
            );
            Ok((movement, stock, now, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::CreateStockMovement(movement.clone()))
            .await?;
        self.commit(Operation::UpdateProduct {
            id: product_id.to_string(),
            changes: json!({ "stock": stock, "updatedAt": updated_at }),
        })
        .await?;
        Ok(movement)
    }

    pub async fn add_category(&self, name: &str) -> PosResult<Category> {
        let name = required(name, "Category name")?;
        let (category, log) = self.store.update(|s| {
            let shop_id = active_shop(s)?;
            let now = now_iso();
            let category = Category {
                id: new_id(),
                shop_id,
                name,
                created_at: now.clone(),
                updated_at: now,
            };
            s.data.categories.push(category.clone());
            let log = push_log(
                s,
                "create",
                EntityKind::Category,
                &category.id,
                Some(category.name.as_str()),
            );
            Ok((category, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::CreateCategory(category.clone()))
            .await?;
        Ok(category)
    }

    /// Hard delete. Products in the category keep a dangling id, which the
    /// catalogue screens treat as "uncategorised".
    pub async fn delete_category(&self, id: &str) -> PosResult<()> {
        let log = self.store.update(|s| {
            remove_record(&mut s.data.categories, id)?;
            Ok(push_log(s, "delete", EntityKind::Category, id, None))
        })?;

        self.log_remote(log);
        self.commit(Operation::DeleteCategory { id: id.to_string() })
            .await?;
        Ok(())
    }

    pub async fn add_supplier(&self, input: NewContact) -> PosResult<Supplier> {
        let name = required(&input.name, "Supplier name")?;
        let (supplier, log) = self.store.update(|s| {
            let shop_id = active_shop(s)?;
            let now = now_iso();
            let supplier = Supplier {
                id: new_id(),
                shop_id,
                name,
                phone: input.phone,
                email: input.email,
                created_at: now.clone(),
                updated_at: now,
            };
            s.data.suppliers.push(supplier.clone());
            let log = push_log(
                s,
                "create",
                EntityKind::Supplier,
                &supplier.id,
                Some(supplier.name.as_str()),
            );
            Ok((supplier, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::CreateSupplier(supplier.clone()))
            .await?;
        Ok(supplier)
    }

    pub async fn update_supplier(&self, id: &str, changes: &Value) -> PosResult<Supplier> {
        let patch = sanitize_patch(changes, &[])?;
        let (supplier, remote_changes, log) = self.store.update(|s| {
            let (supplier, remote_changes) = patch_record(&mut s.data.suppliers, id, &patch)?;
            let log = push_log(s, "update", EntityKind::Supplier, id, None);
            Ok((supplier, remote_changes, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::UpdateSupplier {
            id: id.to_string(),
            changes: remote_changes,
        })
        .await?;
        Ok(supplier)
    }

    pub async fn delete_supplier(&self, id: &str) -> PosResult<()> {
        let log = self.store.update(|s| {
            remove_record(&mut s.data.suppliers, id)?;
            Ok(push_log(s, "delete", EntityKind::Supplier, id, None))
        })?;

        self.log_remote(log);
        self.commit(Operation::DeleteSupplier { id: id.to_string() })
            .await?;
        Ok(())
    }

    // -- Customers and debt -------------------------------------------------

    pub async fn add_customer(&self, input: NewContact) -> PosResult<Customer> {
        let name = required(&input.name, "Customer name")?;
        let (customer, log) = self.store.update(|s| {
            let shop_id = active_shop(s)?;
            let now = now_iso();
            let customer = Customer {
                id: new_id(),
                shop_id,
                name,
                phone: input.phone,
                email: input.email,
                debt_balance: 0.0,
                is_archived: false,
                created_at: now.clone(),
                updated_at: now,
            };
            s.data.customers.push(customer.clone());
            let log = push_log(
                s,
                "create",
                EntityKind::Customer,
                &customer.id,
                Some(customer.name.as_str()),
            );
            Ok((customer, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::CreateCustomer(customer.clone()))
            .await?;
        Ok(customer)
    }

    /// Debt balance is owned by sales and payments and cannot be patched.
    pub async fn update_customer(&self, id: &str, changes: &Value) -> PosResult<Customer> {
        let patch = sanitize_patch(changes, &["debtBalance"])?;
        let (customer, remote_changes, log) = self.store.update(|s| {
            let (customer, remote_changes) = patch_record(&mut s.data.customers, id, &patch)?;
            let log = push_log(s, "update", EntityKind::Customer, id, None);
            Ok((customer, remote_changes, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::UpdateCustomer {
            id: id.to_string(),
            changes: remote_changes,
        })
        .await?;
        Ok(customer)
    }

    pub async fn archive_customer(&self, id: &str) -> PosResult<Customer> {
        let patch = object(json!({ "isArchived": true }));
        let (customer, remote_changes, log) = self.store.update(|s| {
            let (customer, remote_changes) = patch_record(&mut s.data.customers, id, &patch)?;
            let log = push_log(
                s,
                "archive",
                EntityKind::Customer,
                id,
                Some(customer.name.as_str()),
            );
            Ok((customer, remote_changes, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::UpdateCustomer {
            id: id.to_string(),
            changes: remote_changes,
        })
        .await?;
        Ok(customer)
    }

    /// Money received against a customer's outstanding debt.
    pub async fn record_debt_payment(
        &self,
        customer_id: &str,
        amount: f64,
    ) -> PosResult<DebtTransaction> {
        let amount = round_money(positive(amount, "Payment amount")?);

        let (transaction, balance, updated_at, log) = self.store.update(|s| {
            let shop_id = active_shop(s)?;
            let now = now_iso();
            let customer = find_mut(&mut s.data.customers, customer_id)
                .ok_or_else(|| not_found(EntityKind::Customer, customer_id))?;
            if amount > customer.debt_balance + f64::EPSILON {
                return Err(PosError::Validation(format!(
                    "Payment of {amount:.2} exceeds outstanding debt of {:.2}",
                    customer.debt_balance
                )));
            }
            let balance = round_money((customer.debt_balance - amount).max(0.0));
            customer.debt_balance = balance;
            customer.updated_at = now.clone();

            let transaction = DebtTransaction {
                id: new_id(),
                shop_id,
                customer_id: customer_id.to_string(),
                kind: DebtKind::Payment,
                amount,
                balance_after: balance,
                sale_id: None,
                created_at: now.clone(),
                updated_at: now.clone(),
            };
            s.data.debt_transactions.push(transaction.clone());
            let details = format!("{amount:.2}");
            let log = push_log(
                s,
                "debt_payment",
                EntityKind::Customer,
                customer_id,
                Some(details.as_str()),
            );
            Ok((transaction, balance, now, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::CreateDebtTransaction(transaction.clone()))
            .await?;
        self.commit(Operation::UpdateCustomer {
            id: customer_id.to_string(),
            changes: json!({ "debtBalance": balance, "updatedAt": updated_at }),
        })
        .await?;
        Ok(transaction)
    }

    // -- Sales --------------------------------------------------------------

    /// Record a completed sale and everything it touches: one stock
    /// movement and stock update per line, the customer's debt for credit
    /// sales and the gift card balance for gift-card tender.
    pub async fn record_sale(&self, input: NewSale) -> PosResult<Sale> {
        if input.items.is_empty() {
            return Err(PosError::Validation("A sale needs at least one item".into()));
        }
        for line in &input.items {
            positive(line.quantity, "Quantity")?;
        }
        let discount = non_negative(input.discount, "Discount")?;

        let (sale, operations, log) = self.store.update(|s| {
            let shop_id = active_shop(s)?;
            let now = now_iso();
            let sale_id = new_id();

            let mut items = Vec::with_capacity(input.items.len());
            let mut stock_operations = Vec::with_capacity(input.items.len() * 2);
            for line in &input.items {
                let product = find_mut(&mut s.data.products, &line.product_id)
                    .filter(|p| !p.is_archived)
                    .ok_or_else(|| not_found(EntityKind::Product, &line.product_id))?;
                product.stock -= line.quantity;
                product.updated_at = now.clone();
                if product.stock < 0.0 {
                    warn!(
                        product_id = %product.id,
                        stock = product.stock,
                        "Sale took stock below zero"
                    );
                }

                items.push(SaleItem {
                    product_id: product.id.clone(),
                    name: product.name.clone(),
                    quantity: line.quantity,
                    unit_price: product.price,
                });
                let movement = StockMovement {
                    id: new_id(),
                    shop_id: shop_id.clone(),
                    product_id: product.id.clone(),
                    quantity_change: -line.quantity,
                    stock_after: product.stock,
                    reason: StockReason::Sale,
                    reference_id: Some(sale_id.clone()),
                    created_at: now.clone(),
                    updated_at: now.clone(),
                };
                let stock_update = Operation::UpdateProduct {
                    id: product.id.clone(),
                    changes: json!({ "stock": product.stock, "updatedAt": now }),
                };
                s.data.stock_movements.push(movement.clone());
                stock_operations.push(Operation::CreateStockMovement(movement));
                stock_operations.push(stock_update);
            }

            let subtotal = round_money(items.iter().map(SaleItem::line_total).sum::<f64>());
            let discount = round_money(discount.min(subtotal));
            let total = round_money(subtotal - discount);

            let mut operations = Vec::new();
            let sale = Sale {
                id: sale_id,
                shop_id: shop_id.clone(),
                items,
                subtotal,
                discount,
                total,
                payment_method: input.payment_method,
                customer_id: input.customer_id.clone(),
                gift_card_id: input.gift_card_id.clone(),
                cashier_id: s.current_user.as_ref().map(|u| u.id.clone()),
                status: SaleStatus::Completed,
                created_at: now.clone(),
                updated_at: now.clone(),
            };
            operations.push(Operation::CreateSale(sale.clone()));
            operations.extend(stock_operations);

            match input.payment_method {
                PaymentMethod::Credit => {
                    let customer_id = input.customer_id.as_deref().ok_or_else(|| {
                        PosError::Validation("Credit sales need a customer".into())
                    })?;
                    operations.extend(adjust_debt(
                        s,
                        &shop_id,
                        customer_id,
                        DebtKind::Charge,
                        total,
                        &sale.id,
                        &now,
                    )?);
                }
                PaymentMethod::GiftCard => {
                    let card_id = input.gift_card_id.as_deref().ok_or_else(|| {
                        PosError::Validation("Gift card payments need a gift card".into())
                    })?;
                    operations.push(adjust_gift_card(s, card_id, -total, &now)?);
                }
                PaymentMethod::Cash | PaymentMethod::Card => {}
            }

            s.data.sales.push(sale.clone());
            let details = format!("{total:.2}");
            let log = push_log(s, "sale", EntityKind::Sale, &sale.id, Some(details.as_str()));
            Ok((sale, operations, log))
        })?;

        info!(sale_id = %sale.id, total = sale.total, lines = sale.items.len(), "Sale recorded");
        self.log_remote(log);
        self.commit_all(operations).await?;

        if self.settings.drain_after_sale && self.queue.count() > 0 {
            self.engine.request_sync();
        }
        Ok(sale)
    }

    /// Reverse a completed sale: restock every line, cancel the credit
    /// charge and refund gift-card tender.
    pub async fn void_sale(&self, sale_id: &str) -> PosResult<Sale> {
        let (sale, operations, log) = self.store.update(|s| {
            let shop_id = active_shop(s)?;
            let now = now_iso();
            let sale = find_mut(&mut s.data.sales, sale_id)
                .ok_or_else(|| not_found(EntityKind::Sale, sale_id))?;
            if sale.status == SaleStatus::Voided {
                return Err(PosError::Validation(format!("Sale {sale_id} is already voided")));
            }
            sale.status = SaleStatus::Voided;
            sale.updated_at = now.clone();
            let sale = sale.clone();

            let mut operations = vec![Operation::UpdateSale {
                id: sale.id.clone(),
                changes: json!({ "status": SaleStatus::Voided, "updatedAt": now }),
            }];

            for item in &sale.items {
                let Some(product) = find_mut(&mut s.data.products, &item.product_id) else {
                    warn!(
                        product_id = %item.product_id,
                        "Voided sale line refers to a removed product"
                    );
                    continue;
                };
                product.stock += item.quantity;
                product.updated_at = now.clone();
                let movement = StockMovement {
                    id: new_id(),
                    shop_id: shop_id.clone(),
                    product_id: product.id.clone(),
                    quantity_change: item.quantity,
                    stock_after: product.stock,
                    reason: StockReason::Void,
                    reference_id: Some(sale.id.clone()),
                    created_at: now.clone(),
                    updated_at: now.clone(),
                };
                let stock_update = Operation::UpdateProduct {
                    id: product.id.clone(),
                    changes: json!({ "stock": product.stock, "updatedAt": now }),
                };
                s.data.stock_movements.push(movement.clone());
                operations.push(Operation::CreateStockMovement(movement));
                operations.push(stock_update);
            }

            match (sale.payment_method, &sale.customer_id, &sale.gift_card_id) {
                (PaymentMethod::Credit, Some(customer_id), _) => {
                    operations.extend(adjust_debt(
                        s,
                        &shop_id,
                        customer_id,
                        DebtKind::Reversal,
                        sale.total,
                        &sale.id,
                        &now,
                    )?);
                }
                (PaymentMethod::GiftCard, _, Some(card_id)) => {
                    operations.push(adjust_gift_card(s, card_id, sale.total, &now)?);
                }
                _ => {}
            }

            let log = push_log(s, "void", EntityKind::Sale, &sale.id, None);
            Ok((sale, operations, log))
        })?;

        info!(sale_id = %sale.id, "Sale voided");
        self.log_remote(log);
        self.commit_all(operations).await?;
        Ok(sale)
    }

    // -- Expenses -----------------------------------------------------------

    pub async fn add_expense(&self, input: NewExpense) -> PosResult<Expense> {
        let description = required(&input.description, "Expense description")?;
        let amount = round_money(positive(input.amount, "Expense amount")?);
        let (expense, log) = self.store.update(|s| {
            let shop_id = active_shop(s)?;
            let now = now_iso();
            let expense = Expense {
                id: new_id(),
                shop_id,
                description,
                category: input.category,
                amount,
                created_at: now.clone(),
                updated_at: now,
            };
            s.data.expenses.push(expense.clone());
            let details = format!("{amount:.2}");
            let log = push_log(
                s,
                "create",
                EntityKind::Expense,
                &expense.id,
                Some(details.as_str()),
            );
            Ok((expense, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::CreateExpense(expense.clone()))
            .await?;
        Ok(expense)
    }

    pub async fn delete_expense(&self, id: &str) -> PosResult<()> {
        let log = self.store.update(|s| {
            remove_record(&mut s.data.expenses, id)?;
            Ok(push_log(s, "delete", EntityKind::Expense, id, None))
        })?;

        self.log_remote(log);
        self.commit(Operation::DeleteExpense { id: id.to_string() })
            .await?;
        Ok(())
    }

    // -- Gift cards ---------------------------------------------------------

    /// Issue a card with `amount` loaded. Without a code one is generated.
    pub async fn issue_gift_card(&self, code: Option<&str>, amount: f64) -> PosResult<GiftCard> {
        let amount = round_money(positive(amount, "Gift card amount")?);
        let code = match code.map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => code.to_uppercase(),
            None => generate_card_code(),
        };

        let (card, log) = self.store.update(|s| {
            let shop_id = active_shop(s)?;
            if s.data.gift_cards.iter().any(|c| c.code.eq_ignore_ascii_case(&code)) {
                return Err(PosError::Validation(format!(
                    "Gift card code {code} is already in use"
                )));
            }
            let now = now_iso();
            let card = GiftCard {
                id: new_id(),
                shop_id,
                code,
                initial_balance: amount,
                balance: amount,
                is_active: true,
                created_at: now.clone(),
                updated_at: now,
            };
            s.data.gift_cards.push(card.clone());
            let log = push_log(
                s,
                "create",
                EntityKind::GiftCard,
                &card.id,
                Some(card.code.as_str()),
            );
            Ok((card, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::CreateGiftCard(card.clone()))
            .await?;
        Ok(card)
    }

    /// Take `amount` off a card outside of a sale.
    pub async fn redeem_gift_card(&self, card_id: &str, amount: f64) -> PosResult<GiftCard> {
        let amount = round_money(positive(amount, "Redeem amount")?);
        let (card, operation, log) = self.store.update(|s| {
            let now = now_iso();
            let operation = adjust_gift_card(s, card_id, -amount, &now)?;
            let card = find(&s.data.gift_cards, card_id)
                .cloned()
                .ok_or_else(|| not_found(EntityKind::GiftCard, card_id))?;
            let details = format!("{amount:.2}");
            let log = push_log(
                s,
                "gift_card_redeem",
                EntityKind::GiftCard,
                card_id,
                Some(details.as_str()),
            );
            Ok((card, operation, log))
        })?;

        self.log_remote(log);
        self.commit(operation).await?;
        Ok(card)
    }

    // -- Users, settings, billing -------------------------------------------

    pub async fn add_user(&self, input: NewUser) -> PosResult<User> {
        let name = required(&input.name, "User name")?;
        let email = required(&input.email, "Email")?.to_lowercase();

        let (user, log) = self.store.update(|s| {
            let shop_id = active_shop(s)?;
            if s.data.users.iter().any(|u| u.matches_identifier(&email)) {
                return Err(PosError::Validation(format!(
                    "A user with email {email} already exists"
                )));
            }
            let now = now_iso();
            let user = User {
                id: new_id(),
                shop_id,
                name,
                email,
                username: input.username,
                password_hash: None,
                role: input.role,
                status: UserStatus::Active,
                last_login: None,
                created_at: now.clone(),
                updated_at: now,
            };
            s.data.users.push(user.clone());
            let log = push_log(s, "create", EntityKind::User, &user.id, Some(user.email.as_str()));
            Ok((user, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::CreateUser(user.clone())).await?;
        Ok(user)
    }

    /// Credential hashes are managed by login only.
    pub async fn update_user(&self, id: &str, changes: &Value) -> PosResult<User> {
        let patch = sanitize_patch(changes, &["passwordHash", "lastLogin"])?;
        let (user, remote_changes, log) = self.store.update(|s| {
            let (user, remote_changes) = patch_record(&mut s.data.users, id, &patch)?;
            if s.current_user.as_ref().is_some_and(|u| u.id == user.id) {
                s.current_user = Some(user.clone());
            }
            let log = push_log(s, "update", EntityKind::User, id, None);
            Ok((user, remote_changes, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::UpdateUser {
            id: id.to_string(),
            changes: remote_changes,
        })
        .await?;
        Ok(user)
    }

    pub async fn update_settings(&self, changes: &Value) -> PosResult<ShopSettings> {
        let patch = sanitize_patch(changes, &[])?;
        let (settings, remote_changes, log) = self.store.update(|s| {
            let shop_id = active_shop(s)?;
            let current = s
                .data
                .settings
                .as_ref()
                .ok_or_else(|| not_found(EntityKind::Settings, &shop_id))?;
            let (settings, remote_changes) = patch_one(current, &patch)?;
            s.data.settings = Some(settings.clone());
            let log = push_log(s, "update", EntityKind::Settings, &settings.id, None);
            Ok((settings, remote_changes, log))
        })?;

        self.log_remote(log);
        self.commit(Operation::UpdateSettings {
            id: settings.id.clone(),
            changes: remote_changes,
        })
        .await?;
        Ok(settings)
    }

    /// Record a subscription payment and extend the paid period from the
    /// later of now and the current period end.
    pub async fn record_subscription_payment(
        &self,
        payment: SubscriptionPayment,
    ) -> PosResult<PaymentRecord> {
        let amount = round_money(positive(payment.amount, "Payment amount")?);
        if payment.period_days <= 0 {
            return Err(PosError::Validation("Billing period must be at least one day".into()));
        }
        let currency = required(&payment.currency, "Currency")?.to_uppercase();

        let (record, subscription_update, log) = self.store.update(|s| {
            let shop_id = active_shop(s)?;
            let now = Utc::now();
            let stamp = now_iso();
            let subscription = s
                .data
                .subscription
                .as_mut()
                .ok_or_else(|| not_found(EntityKind::Subscription, &shop_id))?;

            let period_start = parse_iso(&subscription.current_period_end)
                .filter(|end| *end > now)
                .unwrap_or(now);
            let period_end = (period_start + Duration::days(payment.period_days))
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            subscription.status = SubscriptionStatus::Active;
            subscription.current_period_end = period_end.clone();
            subscription.updated_at = stamp.clone();

            let subscription_update = Operation::UpdateSubscription {
                id: subscription.id.clone(),
                changes: json!({
                    "status": SubscriptionStatus::Active,
                    "currentPeriodEnd": period_end,
                    "updatedAt": stamp,
                }),
            };
            let record = PaymentRecord {
                id: new_id(),
                shop_id,
                subscription_id: subscription.id.clone(),
                amount,
                currency,
                reference: payment.reference,
                created_at: stamp.clone(),
                updated_at: stamp,
            };
            s.data.payment_records.push(record.clone());
            let details = format!("{amount:.2} {}", record.currency);
            let log = push_log(
                s,
                "subscription_payment",
                EntityKind::Subscription,
                &record.subscription_id,
                Some(details.as_str()),
            );
            Ok((record, subscription_update, log))
        })?;

        self.log_remote(log);
        self.commit_all(vec![
            Operation::CreatePaymentRecord(record.clone()),
            subscription_update,
        ])
        .await?;
        Ok(record)
    }

    // -- Remote write or enqueue --------------------------------------------

    /// Write one operation remotely when the shop is sync-eligible and no
    /// earlier write for the same record is still queued; otherwise, or on
    /// failure, queue it.
    pub(crate) async fn commit(&self, operation: Operation) -> PosResult<CommitOutcome> {
        let target = operation.target_id().to_string();
        let shop_id = self.store.active_shop_id()?.ok_or(PosError::NoSession)?;

        if !self.engine.is_sync_eligible() {
            self.queue.enqueue(&shop_id, &operation)?;
            return Ok(CommitOutcome::Queued);
        }
        if self.queue.has_pending_for(&target) {
            debug!(target = %target, "Earlier write still queued; queueing behind it");
            self.queue.enqueue(&shop_id, &operation)?;
            return Ok(CommitOutcome::Queued);
        }

        let result = with_timeout(
            self.settings.request_timeout(),
            apply_operation(self.remote.as_ref(), &operation),
        )
        .await;

        match result {
            Ok(()) => Ok(CommitOutcome::Synced),
            Err(e) if e.is_already_exists() => Ok(CommitOutcome::Synced),
            Err(e) => {
                warn!(
                    entity = operation.entity().label(),
                    target = %target,
                    error = %e,
                    "Remote write failed; queued for sync"
                );
                self.queue.enqueue(&shop_id, &operation)?;
                Ok(CommitOutcome::Queued)
            }
        }
    }

    /// Commit every dependent write even when one of them cannot be stored,
    /// then report the first such error.
    async fn commit_all(&self, operations: Vec<Operation>) -> PosResult<()> {
        let mut queued = 0usize;
        let mut first_error = None;
        for operation in operations {
            let entity = operation.entity().label();
            match self.commit(operation).await {
                Ok(CommitOutcome::Queued) => queued += 1,
                Ok(CommitOutcome::Synced) => {}
                Err(e) => {
                    warn!(entity, error = %e, "Dependent write could not be stored");
                    first_error.get_or_insert(e);
                }
            }
        }
        if queued > 0 {
            debug!(queued, "Some dependent writes were queued");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Best-effort remote copy of an activity-log entry. Never queued.
    fn log_remote(&self, log: ActivityLog) {
        if !self.engine.is_sync_eligible() {
            return;
        }
        let remote = self.remote.clone();
        let timeout = self.settings.request_timeout();
        self.tasks.spawn("activity_log", async move {
            let record = serde_json::to_value(&log).map_err(|e| e.to_string())?;
            match with_timeout(timeout, remote.insert(EntityKind::ActivityLog, &record)).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_already_exists() => Ok(()),
                Err(e) => Err(e.to_string()),
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn active_shop(snapshot: &LocalSnapshot) -> PosResult<String> {
    snapshot.active_shop_id.clone().ok_or(PosError::NoSession)
}

fn not_found(kind: EntityKind, id: &str) -> PosError {
    PosError::NotFound {
        kind: kind.label(),
        id: id.to_string(),
    }
}

fn required(value: &str, field: &str) -> PosResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PosError::Validation(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

fn positive(value: f64, field: &str) -> PosResult<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(PosError::Validation(format!("{field} must be greater than zero")))
    }
}

fn non_negative(value: f64, field: &str) -> PosResult<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(PosError::Validation(format!("{field} cannot be negative")))
    }
}

fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn generate_card_code() -> String {
    let raw = new_id().replace('-', "").to_uppercase();
    format!("GC-{}", &raw[..12])
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Validate a client patch and drop fields it may not change.
fn sanitize_patch(changes: &Value, protected: &[&str]) -> PosResult<Map<String, Value>> {
    let Some(map) = changes.as_object() else {
        return Err(PosError::Validation("changes must be a JSON object".into()));
    };
    let patch: Map<String, Value> = map
        .iter()
        .filter(|(key, _)| {
            !matches!(key.as_str(), "id" | "shopId" | "createdAt" | "updatedAt")
                && !protected.contains(&key.as_str())
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if patch.is_empty() {
        return Err(PosError::Validation("No changes to apply".into()));
    }
    Ok(patch)
}

/// Apply a patch to one record, returning the new record and the change
/// set to send remotely (the patch plus the new `updatedAt`).
fn patch_one<T>(record: &T, patch: &Map<String, Value>) -> PosResult<(T, Value)>
where
    T: Serialize + DeserializeOwned,
{
    let updated: T = apply_changes(record, &Value::Object(patch.clone()))
        .map_err(|e| PosError::Validation(format!("invalid changes: {e}")))?;
    let updated_at = serde_json::to_value(&updated)?
        .get("updatedAt")
        .cloned()
        .unwrap_or_else(|| Value::String(now_iso()));

    let mut remote_changes = patch.clone();
    remote_changes.insert("updatedAt".to_string(), updated_at);
    Ok((updated, Value::Object(remote_changes)))
}

fn patch_record<T>(list: &mut [T], id: &str, patch: &Map<String, Value>) -> PosResult<(T, Value)>
where
    T: ShopScoped + Serialize + DeserializeOwned + Clone,
{
    let record = find_mut(list, id).ok_or_else(|| not_found(T::KIND, id))?;
    let (updated, remote_changes) = patch_one(&*record, patch)?;
    *record = updated.clone();
    Ok((updated, remote_changes))
}

fn remove_record<T: ShopScoped>(list: &mut Vec<T>, id: &str) -> PosResult<()> {
    let before = list.len();
    list.retain(|record| record.id() != id);
    if list.len() == before {
        return Err(not_found(T::KIND, id));
    }
    Ok(())
}

fn push_log(
    snapshot: &mut LocalSnapshot,
    action: &str,
    kind: EntityKind,
    entity_id: &str,
    details: Option<&str>,
) -> ActivityLog {
    let now = now_iso();
    let log = ActivityLog {
        id: new_id(),
        shop_id: snapshot.active_shop_id.clone().unwrap_or_default(),
        user_id: snapshot.current_user.as_ref().map(|u| u.id.clone()),
        action: action.to_string(),
        entity_type: kind,
        entity_id: entity_id.to_string(),
        details: details.map(str::to_string),
        created_at: now.clone(),
        updated_at: now,
    };
    snapshot.data.activity_logs.push(log.clone());
    log
}

/// Charge or reverse a customer's debt. Returns the transaction insert
/// followed by the balance update.
fn adjust_debt(
    snapshot: &mut LocalSnapshot,
    shop_id: &str,
    customer_id: &str,
    kind: DebtKind,
    amount: f64,
    sale_id: &str,
    now: &str,
) -> PosResult<Vec<Operation>> {
    let customer = find_mut(&mut snapshot.data.customers, customer_id)
        .filter(|c| !c.is_archived || kind != DebtKind::Charge)
        .ok_or_else(|| not_found(EntityKind::Customer, customer_id))?;

    let balance = match kind {
        DebtKind::Charge => customer.debt_balance + amount,
        DebtKind::Payment | DebtKind::Reversal => (customer.debt_balance - amount).max(0.0),
    };
    let balance = round_money(balance);
    customer.debt_balance = balance;
    customer.updated_at = now.to_string();

    let transaction = DebtTransaction {
        id: new_id(),
        shop_id: shop_id.to_string(),
        customer_id: customer_id.to_string(),
        kind,
        amount,
        balance_after: balance,
        sale_id: Some(sale_id.to_string()),
        created_at: now.to_string(),
        updated_at: now.to_string(),
    };
    snapshot.data.debt_transactions.push(transaction.clone());

    Ok(vec![
        Operation::CreateDebtTransaction(transaction),
        Operation::UpdateCustomer {
            id: customer_id.to_string(),
            changes: json!({ "debtBalance": balance, "updatedAt": now }),
        },
    ])
}

/// Move a gift card balance by `delta` (negative to spend).
fn adjust_gift_card(
    snapshot: &mut LocalSnapshot,
    card_id: &str,
    delta: f64,
    now: &str,
) -> PosResult<Operation> {
    let card = find_mut(&mut snapshot.data.gift_cards, card_id)
        .ok_or_else(|| not_found(EntityKind::GiftCard, card_id))?;
    if !card.is_active {
        return Err(PosError::Validation(format!("Gift card {} is not active", card.code)));
    }
    let balance = round_money(card.balance + delta);
    if balance < 0.0 {
        return Err(PosError::Validation(format!(
            "Insufficient gift card balance: {:.2} available",
            card.balance
        )));
    }
    card.balance = balance;
    card.updated_at = now.to_string();

    Ok(Operation::UpdateGiftCard {
        id: card_id.to_string(),
        changes: json!({ "balance": balance, "updatedAt": now }),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
