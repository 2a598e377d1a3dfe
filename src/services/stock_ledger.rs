use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::DbPool,
    entities::inventory_log::{self, Entity as InventoryLogEntity, StockChangeType},
    entities::low_stock_alert::{self, Entity as LowStockAlertEntity},
    entities::product_stock::{self, ProductCategory},
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::product_repository,
};

lazy_static! {
    static ref STOCK_DELTAS: IntCounter = IntCounter::new(
        "stock_deltas_total",
        "Total number of stock deltas applied"
    )
    .expect("metric can be created");
    static ref STOCK_DELTA_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "stock_delta_failures_total",
            "Total number of rejected stock deltas"
        ),
        &["error_type"]
    )
    .expect("metric can be created");
}

/// Default retry cap for contended stock rows.
const DEFAULT_APPLY_RETRIES: u32 = 5;

/// A single stock mutation request.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StockDelta {
    pub product_id: Uuid,
    pub category: ProductCategory,
    /// Signed change; negative for sales, positive for returns/receipts.
    pub delta: i32,
    pub change_type: StockChangeType,
    #[validate(length(min = 1, max = 500, message = "Reason must be between 1 and 500 characters"))]
    pub reason: String,
    pub order_id: Option<Uuid>,
    pub actor_id: Uuid,
}

/// Outcome of an applied delta, used for post-commit alerting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedDelta {
    pub product_id: Uuid,
    pub category: ProductCategory,
    pub change_type: StockChangeType,
    pub quantity_change: i32,
    pub previous_stock: i32,
    pub new_stock: i32,
    pub low_stock_threshold: i32,
    pub log_entry_id: Uuid,
    pub order_id: Option<Uuid>,
}

/// The sole stock mutation entry point.
///
/// Every write goes through `apply_delta` (or its transaction-scoped
/// variant), which pairs the counter update with an append-only
/// `inventory_log` row in the same transaction.
#[derive(Clone)]
pub struct StockLedgerService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    apply_retries: u32,
    alerts_enabled: bool,
}

impl StockLedgerService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
            apply_retries: DEFAULT_APPLY_RETRIES,
            alerts_enabled: true,
        }
    }

    pub fn with_settings(mut self, apply_retries: u32, alerts_enabled: bool) -> Self {
        self.apply_retries = apply_retries;
        self.alerts_enabled = alerts_enabled;
        self
    }

    /// Registers a product's stock row and seeds the audit log with an
    /// adjustment entry for the opening balance, so a replay from the
    /// beginning of the log reconstructs the current count.
    #[instrument(skip(self), fields(product_id = %product_id, category = %category))]
    pub async fn create_product_stock(
        &self,
        product_id: Uuid,
        category: ProductCategory,
        initial_stock: i32,
        low_stock_threshold: i32,
        actor_id: Uuid,
    ) -> Result<product_stock::Model, ServiceError> {
        if initial_stock < 0 {
            return Err(ServiceError::ValidationError(
                "Initial stock cannot be negative".to_string(),
            ));
        }

        let db = &*self.db_pool;
        let txn = db.begin().await?;

        let repo = product_repository(category);
        if repo.find_stock(&txn, product_id).await?.is_some() {
            return Err(ServiceError::InvalidOperation(format!(
                "Stock row already exists for product {} in {}",
                product_id, category
            )));
        }

        let row = product_stock::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            category: Set(category),
            current_stock: Set(initial_stock),
            low_stock_threshold: Set(low_stock_threshold),
            version: Set(1),
            ..Default::default()
        };
        let model = repo.insert_stock(&txn, row).await?;

        inventory_log::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            category: Set(category),
            change_type: Set(StockChangeType::Adjustment),
            quantity_change: Set(initial_stock),
            previous_stock: Set(0),
            new_stock: Set(initial_stock),
            reason: Set("Opening balance".to_string()),
            order_id: Set(None),
            actor_id: Set(actor_id),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;

        info!(product_id = %product_id, category = %category, initial_stock, "Product stock registered");

        Ok(model)
    }

    /// Reads the current stock count for a product.
    #[instrument(skip(self), fields(product_id = %product_id, category = %category))]
    pub async fn get_stock(
        &self,
        product_id: Uuid,
        category: ProductCategory,
    ) -> Result<i32, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await?;
        let row = product_repository(category)
            .find_stock(&txn, product_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Product {} not found in {}",
                    product_id, category
                ))
            })?;
        txn.commit().await?;
        Ok(row.current_stock)
    }

    /// Atomically applies a signed stock delta and appends the paired audit
    /// log entry, in a transaction of its own. Rejects any delta that would
    /// drive stock negative, leaving both counter and log untouched.
    #[instrument(skip(self, delta), fields(product_id = %delta.product_id, delta = delta.delta))]
    pub async fn apply_delta(&self, delta: &StockDelta) -> Result<AppliedDelta, ServiceError> {
        delta.validate().map_err(|e| {
            STOCK_DELTA_FAILURES
                .with_label_values(&["validation_error"])
                .inc();
            ServiceError::ValidationError(format!("Invalid stock delta: {}", e))
        })?;

        let db = &*self.db_pool;
        let txn = db.begin().await?;
        let applied = self.apply_delta_on(&txn, delta).await?;
        txn.commit().await?;

        self.after_commit(std::slice::from_ref(&applied)).await;

        Ok(applied)
    }

    /// Transaction-scoped variant of `apply_delta`, used to batch several
    /// deltas into one atomic transaction (reservation, release, restock).
    /// The caller owns the transaction and must run `after_commit` on the
    /// applied deltas once it commits.
    pub async fn apply_delta_on(
        &self,
        txn: &sea_orm::DatabaseTransaction,
        delta: &StockDelta,
    ) -> Result<AppliedDelta, ServiceError> {
        let repo = product_repository(delta.category);

        for _attempt in 0..self.apply_retries {
            let row = repo
                .find_stock(txn, delta.product_id)
                .await?
                .ok_or_else(|| {
                    STOCK_DELTA_FAILURES
                        .with_label_values(&["not_found"])
                        .inc();
                    ServiceError::NotFound(format!(
                        "Product {} not found in {}",
                        delta.product_id, delta.category
                    ))
                })?;

            let new_stock = row.current_stock + delta.delta;
            if new_stock < 0 {
                STOCK_DELTA_FAILURES
                    .with_label_values(&["insufficient_stock"])
                    .inc();
                return Err(ServiceError::InsufficientStock(format!(
                    "Product {}: requested {}, available {}",
                    delta.product_id,
                    delta.delta.unsigned_abs(),
                    row.current_stock
                )));
            }

            // The write lands only if nobody moved the counter since our
            // read; a lost read-modify-write cannot slip through.
            if repo
                .write_stock(txn, delta.product_id, row.current_stock, new_stock)
                .await?
            {
                let log_entry = inventory_log::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    product_id: Set(delta.product_id),
                    category: Set(delta.category),
                    change_type: Set(delta.change_type),
                    quantity_change: Set(delta.delta),
                    previous_stock: Set(row.current_stock),
                    new_stock: Set(new_stock),
                    reason: Set(delta.reason.clone()),
                    order_id: Set(delta.order_id),
                    actor_id: Set(delta.actor_id),
                    ..Default::default()
                }
                .insert(txn)
                .await?;

                STOCK_DELTAS.inc();

                return Ok(AppliedDelta {
                    product_id: delta.product_id,
                    category: delta.category,
                    change_type: delta.change_type,
                    quantity_change: delta.delta,
                    previous_stock: row.current_stock,
                    new_stock,
                    low_stock_threshold: row.low_stock_threshold,
                    log_entry_id: log_entry.id,
                    order_id: delta.order_id,
                });
            }

            warn!(
                product_id = %delta.product_id,
                "Concurrent stock write detected; retrying"
            );
        }

        STOCK_DELTA_FAILURES
            .with_label_values(&["concurrent_modification"])
            .inc();
        Err(ServiceError::ConcurrentModification(delta.product_id))
    }

    /// Post-commit side effects for a batch of applied deltas: stock events
    /// plus best-effort low-stock alerting. Never fails the parent
    /// operation.
    pub async fn after_commit(&self, applied: &[AppliedDelta]) {
        for entry in applied {
            if let Err(e) = self
                .event_sender
                .send(Event::StockAdjusted {
                    product_id: entry.product_id,
                    category: entry.category,
                    change_type: entry.change_type,
                    quantity_change: entry.quantity_change,
                    new_stock: entry.new_stock,
                    order_id: entry.order_id,
                })
                .await
            {
                warn!(product_id = %entry.product_id, error = %e, "Failed to send stock adjusted event");
            }

            self.check_low_stock(
                entry.product_id,
                entry.category,
                entry.new_stock,
                entry.low_stock_threshold,
            )
            .await;
        }
    }

    /// Creates or resolves the low-stock alert for a product. Side effect
    /// only: failures are logged and swallowed.
    #[instrument(skip(self), fields(product_id = %product_id, current_stock))]
    pub async fn check_low_stock(
        &self,
        product_id: Uuid,
        category: ProductCategory,
        current_stock: i32,
        threshold: i32,
    ) {
        if !self.alerts_enabled {
            return;
        }

        if let Err(e) = self
            .check_low_stock_inner(product_id, category, current_stock, threshold)
            .await
        {
            error!(product_id = %product_id, error = %e, "Low-stock alerting failed");
        }
    }

    async fn check_low_stock_inner(
        &self,
        product_id: Uuid,
        category: ProductCategory,
        current_stock: i32,
        threshold: i32,
    ) -> Result<(), ServiceError> {
        let db = &*self.db_pool;

        let unresolved = LowStockAlertEntity::find()
            .filter(low_stock_alert::Column::ProductId.eq(product_id))
            .filter(low_stock_alert::Column::Category.eq(category))
            .filter(low_stock_alert::Column::Resolved.eq(false))
            .one(db)
            .await?;

        if current_stock <= threshold {
            // One unresolved alert per product at a time.
            if unresolved.is_none() {
                low_stock_alert::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    product_id: Set(product_id),
                    category: Set(category),
                    stock_at_alert: Set(current_stock),
                    threshold: Set(threshold),
                    resolved: Set(false),
                    resolved_at: Set(None),
                    ..Default::default()
                }
                .insert(db)
                .await?;

                info!(product_id = %product_id, current_stock, threshold, "Low-stock alert raised");

                if let Err(e) = self
                    .event_sender
                    .send(Event::LowStockAlertRaised {
                        product_id,
                        category,
                        current_stock,
                        threshold,
                    })
                    .await
                {
                    warn!(product_id = %product_id, error = %e, "Failed to send low-stock event");
                }
            }
        } else if let Some(alert) = unresolved {
            let mut active: low_stock_alert::ActiveModel = alert.into();
            active.resolved = Set(true);
            active.resolved_at = Set(Some(Utc::now()));
            active.update(db).await?;

            info!(product_id = %product_id, current_stock, "Low-stock alert resolved");

            if let Err(e) = self
                .event_sender
                .send(Event::LowStockAlertResolved {
                    product_id,
                    category,
                    current_stock,
                })
                .await
            {
                warn!(product_id = %product_id, error = %e, "Failed to send low-stock resolved event");
            }
        }

        Ok(())
    }

    /// Replays the audit log from the beginning for a product. Because the
    /// opening balance is itself logged, the fold reconstructs the current
    /// stock exactly.
    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn replay_stock(
        &self,
        product_id: Uuid,
        category: ProductCategory,
    ) -> Result<i32, ServiceError> {
        let db = &*self.db_pool;

        let entries = InventoryLogEntity::find()
            .filter(inventory_log::Column::ProductId.eq(product_id))
            .filter(inventory_log::Column::Category.eq(category))
            .order_by_asc(inventory_log::Column::CreatedAt)
            .all(db)
            .await?;

        Ok(entries.iter().map(|e| e.quantity_change).sum())
    }

    /// Lists audit log entries for a product, newest first.
    #[instrument(skip(self))]
    pub async fn list_log_entries(
        &self,
        product_id: Uuid,
        category: ProductCategory,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<inventory_log::Model>, u64), ServiceError> {
        if page == 0 {
            return Err(ServiceError::ValidationError(
                "Page number must be greater than 0".to_string(),
            ));
        }

        let db = &*self.db_pool;

        let paginator = InventoryLogEntity::find()
            .filter(inventory_log::Column::ProductId.eq(product_id))
            .filter(inventory_log::Column::Category.eq(category))
            .order_by_desc(inventory_log::Column::CreatedAt)
            .paginate(db, limit);

        let total = paginator.num_items().await?;
        let entries = paginator.fetch_page(page - 1).await?;

        Ok((entries, total))
    }

    /// Lists low-stock alerts, optionally only the unresolved ones.
    #[instrument(skip(self))]
    pub async fn list_alerts(
        &self,
        unresolved_only: bool,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<low_stock_alert::Model>, u64), ServiceError> {
        if page == 0 {
            return Err(ServiceError::ValidationError(
                "Page number must be greater than 0".to_string(),
            ));
        }

        let db = &*self.db_pool;

        let mut query = LowStockAlertEntity::find();
        if unresolved_only {
            query = query.filter(low_stock_alert::Column::Resolved.eq(false));
        }

        let paginator = query
            .order_by_desc(low_stock_alert::Column::CreatedAt)
            .paginate(db, limit);

        let total = paginator.num_items().await?;
        let alerts = paginator.fetch_page(page - 1).await?;

        Ok((alerts, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_with_empty_reason_fails_validation() {
        let delta = StockDelta {
            product_id: Uuid::new_v4(),
            category: ProductCategory::Apparel,
            delta: -1,
            change_type: StockChangeType::Sale,
            reason: String::new(),
            order_id: None,
            actor_id: Uuid::new_v4(),
        };
        assert!(delta.validate().is_err());
    }
}
