use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts};
use sea_orm::{DatabaseTransaction, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::DbPool,
    entities::inventory_log::StockChangeType,
    entities::product_stock::ProductCategory,
    errors::ServiceError,
    repositories::product_repository,
    services::stock_ledger::{AppliedDelta, StockDelta, StockLedgerService},
};

lazy_static! {
    static ref STOCK_RESERVATIONS: IntCounter = IntCounter::new(
        "stock_reservations_total",
        "Total number of order stock reservations"
    )
    .expect("metric can be created");
    static ref STOCK_RESERVATION_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "stock_reservation_failures_total",
            "Total number of failed stock reservations"
        ),
        &["error_type"]
    )
    .expect("metric can be created");
    static ref STOCK_RELEASES: IntCounter = IntCounter::new(
        "stock_releases_total",
        "Total number of order stock releases"
    )
    .expect("metric can be created");
}

/// One line of a reservation or release request.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReservationLine {
    pub product_id: Uuid,
    pub category: ProductCategory,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

/// Coordinates multi-item stock reservation and release against the ledger.
#[derive(Clone)]
pub struct ReservationService {
    db_pool: Arc<DbPool>,
    stock_ledger: Arc<StockLedgerService>,
}

impl ReservationService {
    pub fn new(db_pool: Arc<DbPool>, stock_ledger: Arc<StockLedgerService>) -> Self {
        Self {
            db_pool,
            stock_ledger,
        }
    }

    /// Read-only availability pass over all lines. Reports every short
    /// product, not just the first one found.
    async fn validate_availability(
        &self,
        txn: &DatabaseTransaction,
        lines: &[ReservationLine],
    ) -> Result<(), ServiceError> {
        let mut shortages = Vec::new();

        for line in lines {
            let repo = product_repository(line.category);
            match repo.find_stock(txn, line.product_id).await? {
                None => {
                    return Err(ServiceError::NotFound(format!(
                        "Product {} not found in {}",
                        line.product_id, line.category
                    )));
                }
                Some(row) if row.current_stock < line.quantity => {
                    shortages.push(format!(
                        "product {} (requested {}, available {})",
                        line.product_id, line.quantity, row.current_stock
                    ));
                }
                Some(_) => {}
            }
        }

        if !shortages.is_empty() {
            return Err(ServiceError::InsufficientStock(format!(
                "Insufficient stock for {}",
                shortages.join(", ")
            )));
        }

        Ok(())
    }

    /// Reserves stock for all lines of an order, all-or-nothing.
    ///
    /// A read-only availability pass rejects the whole reservation when any
    /// line is short. The decrements themselves then run inside a single
    /// transaction with conditional per-row writes, so the pre-check is a
    /// courtesy, not the guard: two racing reservations cannot both pass a
    /// stale read and drive stock negative.
    #[instrument(skip(self, lines), fields(order_id = %order_id, line_count = lines.len()))]
    pub async fn reserve(
        &self,
        order_id: Uuid,
        lines: &[ReservationLine],
        actor_id: Uuid,
    ) -> Result<Vec<AppliedDelta>, ServiceError> {
        if lines.is_empty() {
            STOCK_RESERVATION_FAILURES
                .with_label_values(&["validation_error"])
                .inc();
            return Err(ServiceError::ValidationError(
                "Nothing to reserve".to_string(),
            ));
        }
        for line in lines {
            line.validate()
                .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        }

        let db = &*self.db_pool;

        let txn = db.begin().await?;
        let applied = self.reserve_on(&txn, order_id, lines, actor_id).await?;
        txn.commit().await?;

        self.stock_ledger.after_commit(&applied).await;

        Ok(applied)
    }

    /// Transaction-scoped reservation: availability pass plus conditional
    /// decrements, nothing committed. The caller owns the transaction and
    /// must run `StockLedgerService::after_commit` on the returned deltas
    /// once it commits.
    pub(crate) async fn reserve_on(
        &self,
        txn: &DatabaseTransaction,
        order_id: Uuid,
        lines: &[ReservationLine],
        actor_id: Uuid,
    ) -> Result<Vec<AppliedDelta>, ServiceError> {
        self.validate_availability(txn, lines).await.map_err(|e| {
            STOCK_RESERVATION_FAILURES
                .with_label_values(&["insufficient_stock"])
                .inc();
            e
        })?;

        let mut applied = Vec::with_capacity(lines.len());
        for line in lines {
            let delta = StockDelta {
                product_id: line.product_id,
                category: line.category,
                delta: -line.quantity,
                change_type: StockChangeType::Sale,
                reason: format!("Reserved for order {}", order_id),
                order_id: Some(order_id),
                actor_id,
            };
            // Any failure here rolls back every decrement made so far.
            applied.push(self.stock_ledger.apply_delta_on(txn, &delta).await?);
        }

        STOCK_RESERVATIONS.inc();
        info!(order_id = %order_id, reserved_lines = applied.len(), "Stock reserved");

        Ok(applied)
    }

    /// Releases previously reserved stock back to the ledger, one positive
    /// `Return` delta per line in a single transaction.
    ///
    /// Increasing stock cannot fail the negative-stock guard, so this
    /// succeeds per line. There is no automatic dedup: callers must not
    /// release the same lines twice for one cancellation.
    #[instrument(skip(self, lines), fields(order_id = %order_id, line_count = lines.len()))]
    pub async fn release(
        &self,
        order_id: Uuid,
        lines: &[ReservationLine],
        actor_id: Uuid,
        reason: &str,
    ) -> Result<Vec<AppliedDelta>, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await?;
        let applied = self
            .release_on(&txn, order_id, lines, actor_id, reason)
            .await?;
        txn.commit().await?;

        self.stock_ledger.after_commit(&applied).await;

        Ok(applied)
    }

    /// Transaction-scoped release, used by cancellation and return flows
    /// that pair the stock movement with order mutations atomically. The
    /// caller must run `StockLedgerService::after_commit` on the returned
    /// deltas once its transaction commits.
    pub(crate) async fn release_on(
        &self,
        txn: &DatabaseTransaction,
        order_id: Uuid,
        lines: &[ReservationLine],
        actor_id: Uuid,
        reason: &str,
    ) -> Result<Vec<AppliedDelta>, ServiceError> {
        let mut applied = Vec::with_capacity(lines.len());
        for line in lines {
            let delta = StockDelta {
                product_id: line.product_id,
                category: line.category,
                delta: line.quantity,
                change_type: StockChangeType::Return,
                reason: reason.to_string(),
                order_id: Some(order_id),
                actor_id,
            };
            applied.push(self.stock_ledger.apply_delta_on(txn, &delta).await?);
        }

        STOCK_RELEASES.inc();
        info!(order_id = %order_id, released_lines = applied.len(), "Stock released");

        Ok(applied)
    }

    /// Exposes the ledger's post-commit side effects to flows that batch a
    /// release into their own transaction.
    pub(crate) async fn after_commit(&self, applied: &[AppliedDelta]) {
        self.stock_ledger.after_commit(applied).await;
    }
}
