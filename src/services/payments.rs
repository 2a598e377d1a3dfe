use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::DbPool,
    entities::inventory_log::{self, Entity as InventoryLogEntity},
    entities::order::{self, Entity as OrderEntity, OrderStatus, PaymentStatus},
    entities::order_item::{self, Entity as OrderItemEntity},
    entities::product_stock::ProductCategory,
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders::transition_on,
    services::reservations::{ReservationLine, ReservationService},
    services::SYSTEM_ACTOR,
};

/// Seam to the external payment provider. Refund execution is externally
/// owned; the ledger only records outcomes.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn refund(
        &self,
        order_id: Uuid,
        transaction_id: Option<&str>,
        amount: Decimal,
    ) -> Result<(), String>;
}

/// Gateway stub that always succeeds, for deployments where refunds are
/// reconciled out of band, and for tests.
pub struct NoopPaymentGateway;

#[async_trait]
impl PaymentGateway for NoopPaymentGateway {
    async fn refund(
        &self,
        order_id: Uuid,
        _transaction_id: Option<&str>,
        amount: Decimal,
    ) -> Result<(), String> {
        info!(order_id = %order_id, %amount, "Refund forwarded to gateway");
        Ok(())
    }
}

/// Calls the gateway with bounded attempts; returns the attempt count that
/// succeeded, or the last error once the cap is exhausted so the caller can
/// park the refund for manual reconciliation.
pub(crate) async fn attempt_gateway_refund(
    gateway: &dyn PaymentGateway,
    order_id: Uuid,
    transaction_id: Option<&str>,
    amount: Decimal,
    max_attempts: u32,
) -> Result<u32, (u32, String)> {
    let mut last_error = String::new();
    for attempt in 1..=max_attempts {
        match gateway.refund(order_id, transaction_id, amount).await {
            Ok(()) => return Ok(attempt),
            Err(e) => {
                warn!(order_id = %order_id, attempt, error = %e, "Gateway refund attempt failed");
                last_error = e;
            }
        }
    }
    Err((max_attempts, last_error))
}

/// Creates a Processing refund row, drives the gateway with bounded
/// attempts, and finalizes the row as Completed or Failed. A failed refund
/// keeps its last error for manual reconciliation; the caller decides what
/// the failure means for its own workflow.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute_refund(
    db: &DbPool,
    event_sender: &EventSender,
    gateway: &dyn PaymentGateway,
    order_id: Uuid,
    user_id: Uuid,
    return_id: Option<Uuid>,
    transaction_id: Option<&str>,
    amount: Decimal,
    max_attempts: u32,
) -> Result<crate::entities::refund::Model, ServiceError> {
    use crate::entities::refund::{self, RefundStatus};
    use crate::entities::return_request::RefundMethod;

    let refund_row = refund::ActiveModel {
        id: Set(Uuid::new_v4()),
        return_id: Set(return_id),
        order_id: Set(order_id),
        amount: Set(amount),
        refund_method: Set(RefundMethod::OriginalPayment),
        status: Set(RefundStatus::Processing),
        attempts: Set(0),
        last_error: Set(None),
        ..Default::default()
    }
    .insert(db)
    .await?;

    if let Err(e) = event_sender
        .send(Event::RefundRequested {
            refund_id: refund_row.id,
            order_id,
            amount,
            refund_method: RefundMethod::OriginalPayment,
        })
        .await
    {
        warn!(order_id = %order_id, error = %e, "Failed to send refund requested event");
    }

    let outcome = attempt_gateway_refund(gateway, order_id, transaction_id, amount, max_attempts).await;

    let mut active: refund::ActiveModel = refund_row.into();
    let finalized = match outcome {
        Ok(attempts) => {
            active.status = Set(RefundStatus::Completed);
            active.attempts = Set(attempts as i32);
            let model = active.update(db).await?;
            if let Err(e) = event_sender
                .send(Event::RefundIssued {
                    refund_id: model.id,
                    order_id,
                    user_id,
                    amount,
                    refund_method: RefundMethod::OriginalPayment,
                })
                .await
            {
                warn!(order_id = %order_id, error = %e, "Failed to send refund issued event");
            }
            model
        }
        Err((attempts, last_error)) => {
            active.status = Set(RefundStatus::Failed);
            active.attempts = Set(attempts as i32);
            active.last_error = Set(Some(last_error.clone()));
            let model = active.update(db).await?;
            warn!(
                order_id = %order_id,
                refund_id = %model.id,
                attempts,
                "Refund failed after exhausting gateway attempts; surfaced for reconciliation"
            );
            if let Err(e) = event_sender
                .send(Event::RefundFailed {
                    refund_id: model.id,
                    order_id,
                    amount,
                    error: last_error,
                })
                .await
            {
                warn!(order_id = %order_id, error = %e, "Failed to send refund failed event");
            }
            model
        }
    };

    Ok(finalized)
}

/// Inbound event: the gateway confirmed payment for an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub order_id: Uuid,
    pub transaction_id: String,
    pub amount: Decimal,
}

/// Inbound event: the gateway reported a failed payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFailure {
    pub order_id: Uuid,
    pub reason: String,
}

/// Consumes payment-gateway events and drives reservation plus the order
/// state machine accordingly.
#[derive(Clone)]
pub struct PaymentService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    reservations: Arc<ReservationService>,
}

impl PaymentService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        reservations: Arc<ReservationService>,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            reservations,
        }
    }

    /// Payment confirmed: reserve stock for every active line, record the
    /// transaction, and confirm the order, all inside one transaction.
    ///
    /// When the reservation comes up short, nothing is reserved; the order
    /// moves to Failed with the shortage on its history and the
    /// `InsufficientStock` error propagates to the caller.
    #[instrument(skip(self, confirmation), fields(order_id = %confirmation.order_id))]
    pub async fn handle_payment_confirmed(
        &self,
        confirmation: PaymentConfirmation,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;

        let txn = db.begin().await?;

        let order = OrderEntity::find_by_id(confirmation.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", confirmation.order_id))
            })?;

        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidTransition(format!(
                "Order {} is {} and cannot accept a payment confirmation",
                order.id, order.status
            )));
        }

        let order_id = order.id;
        let user_id = order.user_id;
        let lines = active_lines(&txn, order_id).await?;

        let applied = match self
            .reservations
            .reserve_on(&txn, order_id, &lines, SYSTEM_ACTOR)
            .await
        {
            Ok(applied) => applied,
            Err(err @ ServiceError::InsufficientStock(_)) => {
                // Abandon the reservation transaction entirely, then fail
                // the order in a transaction of its own.
                txn.rollback().await?;
                let reason = format!("Reservation failed: {}", err);
                let fail_txn = db.begin().await?;
                let order = OrderEntity::find_by_id(order_id)
                    .one(&fail_txn)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Order {} not found", order_id))
                    })?;
                transition_on(&fail_txn, order, OrderStatus::Failed, SYSTEM_ACTOR, Some(reason))
                    .await?;
                fail_txn.commit().await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let mut active: order::ActiveModel = order.into();
        active.payment_status = Set(PaymentStatus::Paid);
        active.payment_transaction_id = Set(Some(confirmation.transaction_id.clone()));
        active.paid_amount = Set(Some(confirmation.amount));
        let order = active.update(&txn).await?;

        let confirmed = transition_on(
            &txn,
            order,
            OrderStatus::Confirmed,
            SYSTEM_ACTOR,
            Some(format!(
                "Payment confirmed (transaction {})",
                confirmation.transaction_id
            )),
        )
        .await?;

        txn.commit().await?;

        self.reservations.after_commit(&applied).await;

        info!(order_id = %order_id, "Payment confirmed and stock reserved");

        if let Err(e) = self
            .event_sender
            .send(Event::PaymentConfirmed {
                order_id,
                user_id,
                amount: confirmation.amount,
            })
            .await
        {
            warn!(order_id = %order_id, error = %e, "Failed to send payment confirmed event");
        }

        Ok(confirmed)
    }

    /// Payment failed: release whatever the ledger still shows as reserved
    /// for the order, then fail it.
    ///
    /// The outstanding reservation is derived from the inventory log (sales
    /// minus returns recorded against the order), so a failure arriving
    /// before any confirmation releases nothing and a replayed failure
    /// cannot double-release.
    #[instrument(skip(self, failure), fields(order_id = %failure.order_id))]
    pub async fn handle_payment_failed(
        &self,
        failure: PaymentFailure,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;

        let txn = db.begin().await?;

        let order = OrderEntity::find_by_id(failure.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", failure.order_id))
            })?;

        let order_id = order.id;
        let user_id = order.user_id;

        let outstanding = outstanding_reserved(&txn, order_id).await?;
        let released = if outstanding.is_empty() {
            Vec::new()
        } else {
            self.reservations
                .release_on(
                    &txn,
                    order_id,
                    &outstanding,
                    SYSTEM_ACTOR,
                    &format!("Payment failed: {}", failure.reason),
                )
                .await?
        };

        let mut active: order::ActiveModel = order.into();
        active.payment_status = Set(PaymentStatus::Failed);
        let order = active.update(&txn).await?;

        let failed = transition_on(
            &txn,
            order,
            OrderStatus::Failed,
            SYSTEM_ACTOR,
            Some(format!("Payment failed: {}", failure.reason)),
        )
        .await?;

        txn.commit().await?;

        self.reservations.after_commit(&released).await;

        info!(order_id = %order_id, released_lines = released.len(), "Order failed after payment failure");

        if let Err(e) = self
            .event_sender
            .send(Event::PaymentFailed {
                order_id,
                user_id,
                reason: failure.reason.clone(),
            })
            .await
        {
            warn!(order_id = %order_id, error = %e, "Failed to send payment failed event");
        }

        Ok(failed)
    }
}

/// Reservation lines for an order's active items.
async fn active_lines(
    txn: &sea_orm::DatabaseTransaction,
    order_id: Uuid,
) -> Result<Vec<ReservationLine>, ServiceError> {
    let items = OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(txn)
        .await?;

    Ok(items
        .iter()
        .filter(|i| i.status.is_active())
        .map(|i| ReservationLine {
            product_id: i.product_id,
            category: i.category,
            quantity: i.quantity,
        })
        .collect())
}

/// Net quantity still reserved per product for an order, folded from the
/// inventory log: sales decrement, returns increment, so a negative net
/// means stock is still held.
async fn outstanding_reserved(
    txn: &sea_orm::DatabaseTransaction,
    order_id: Uuid,
) -> Result<Vec<ReservationLine>, ServiceError> {
    let entries = InventoryLogEntity::find()
        .filter(inventory_log::Column::OrderId.eq(order_id))
        .all(txn)
        .await?;

    let mut net: HashMap<(Uuid, ProductCategory), i64> = HashMap::new();
    for entry in &entries {
        *net.entry((entry.product_id, entry.category)).or_insert(0) +=
            i64::from(entry.quantity_change);
    }

    Ok(net
        .into_iter()
        .filter(|(_, sum)| *sum < 0)
        .map(|((product_id, category), sum)| ReservationLine {
            product_id,
            category,
            quantity: (-sum) as i32,
        })
        .collect())
}
