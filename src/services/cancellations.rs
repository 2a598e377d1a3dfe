use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::DbPool,
    entities::order::{self, Entity as OrderEntity, OrderStatus, PaymentStatus},
    entities::order_item::{self, Entity as OrderItemEntity, OrderItemStatus},
    entities::refund,
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders::{record_history, transition_on},
    services::payments::{execute_refund, PaymentGateway},
    services::reservations::{ReservationLine, ReservationService},
    services::SYSTEM_ACTOR,
};

lazy_static! {
    static ref ORDER_CANCELLATIONS: IntCounter = IntCounter::new(
        "order_cancellations_total",
        "Total number of whole-order cancellations"
    )
    .expect("metric can be created");
    static ref ITEM_CANCELLATIONS: IntCounter = IntCounter::new(
        "order_item_cancellations_total",
        "Total number of single-item cancellations"
    )
    .expect("metric can be created");
}

/// Rounds a money amount to 2 decimal places, half away from zero.
pub fn round2(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Splits the shipping charge across line items by relative value.
///
/// Per-item rounding means the allocations across a fully-cancelled order
/// may drift from the original shipping cost by a few cents; that drift is
/// accepted, not reconciled.
pub fn proportional_shipping(
    item_value: Decimal,
    active_items_value: Decimal,
    shipping_cost: Decimal,
) -> Decimal {
    if active_items_value <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    round2(item_value / active_items_value * shipping_cost)
}

/// Outcome of a cancellation, with the refund math spelled out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationOutcome {
    pub order: order::Model,
    pub refund_amount: Option<Decimal>,
    pub shipping_refund: Decimal,
    pub refund_id: Option<Uuid>,
}

/// Computes refund amounts for whole-order and single-item cancellations
/// and drives the order aggregate plus the stock ledger through them.
#[derive(Clone)]
pub struct CancellationService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    reservations: Arc<ReservationService>,
    gateway: Arc<dyn PaymentGateway>,
    refund_max_attempts: u32,
}

impl CancellationService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        reservations: Arc<ReservationService>,
        gateway: Arc<dyn PaymentGateway>,
        refund_max_attempts: u32,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            reservations,
            gateway,
            refund_max_attempts,
        }
    }

    fn check_actor(order: &order::Model, actor_id: Uuid) -> Result<(), ServiceError> {
        if actor_id != SYSTEM_ACTOR && actor_id != order.user_id {
            return Err(ServiceError::Unauthorized(format!(
                "Actor {} does not own order {}",
                actor_id, order.id
            )));
        }
        Ok(())
    }

    /// Cancels a whole order: releases every active item's stock, refunds
    /// the captured payment (transaction amount when recorded, the order
    /// amount otherwise), and moves the order to Cancelled.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
        reason: String,
    ) -> Result<CancellationOutcome, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        Self::check_actor(&order, actor_id)?;

        if let Some(block) = order.status.cancellation_block_reason() {
            return Err(ServiceError::InvalidOperation(block.to_string()));
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;
        let active_items: Vec<_> = items.iter().filter(|i| i.status.is_active()).collect();

        let payment_captured =
            order.payment_status == PaymentStatus::Paid || order.payment_transaction_id.is_some();
        let refund_amount = payment_captured.then(|| order.paid_amount.unwrap_or(order.amount));

        // Take every remaining item out of the order and hand its stock back.
        OrderItemEntity::update_many()
            .col_expr(
                order_item::Column::Status,
                Expr::value(OrderItemStatus::Cancelled),
            )
            .filter(order_item::Column::OrderId.eq(order_id))
            .filter(order_item::Column::Status.is_in([
                OrderItemStatus::Pending,
                OrderItemStatus::Fulfilled,
            ]))
            .exec(&txn)
            .await?;

        let lines: Vec<ReservationLine> = active_items
            .iter()
            .map(|i| ReservationLine {
                product_id: i.product_id,
                category: i.category,
                quantity: i.quantity,
            })
            .collect();

        let released = if payment_captured && !lines.is_empty() {
            self.reservations
                .release_on(
                    &txn,
                    order_id,
                    &lines,
                    actor_id,
                    &format!("Order {} cancelled", order_id),
                )
                .await?
        } else {
            Vec::new()
        };

        let user_id = order.user_id;
        let transaction_id = order.payment_transaction_id.clone();

        let mut active: order::ActiveModel = order.into();
        active.cancelled_at = Set(Some(chrono::Utc::now()));
        active.cancellation_reason = Set(Some(reason.clone()));
        active.cancelled_by = Set(Some(actor_id));
        if refund_amount.is_some() {
            active.payment_status = Set(PaymentStatus::Refunded);
        }
        let order = active.update(&txn).await?;

        let breakdown = match refund_amount {
            Some(amount) => format!("Order cancelled: {}; refunding ${:.2}", reason, amount),
            None => format!("Order cancelled: {}; no payment captured", reason),
        };
        let cancelled =
            transition_on(&txn, order, OrderStatus::Cancelled, actor_id, Some(breakdown)).await?;

        txn.commit().await?;

        self.reservations.after_commit(&released).await;

        ORDER_CANCELLATIONS.inc();
        info!(order_id = %order_id, refund = ?refund_amount, "Order cancelled");

        if let Err(e) = self
            .event_sender
            .send(Event::OrderCancelled {
                order_id,
                user_id,
                refund_amount,
            })
            .await
        {
            warn!(order_id = %order_id, error = %e, "Failed to send order cancelled event");
        }

        let refund_id = match refund_amount {
            Some(amount) => Some(
                execute_refund(
                    db,
                    &self.event_sender,
                    self.gateway.as_ref(),
                    order_id,
                    user_id,
                    None,
                    transaction_id.as_deref(),
                    amount,
                    self.refund_max_attempts,
                )
                .await?
                .id,
            ),
            None => None,
        };

        Ok(CancellationOutcome {
            order: cancelled,
            refund_amount,
            shipping_refund: Decimal::ZERO,
            refund_id,
        })
    }

    /// Cancels a single line item: refunds its value plus a proportional
    /// slice of the shipping charge, reduces the order's remaining amounts,
    /// and releases the item's stock. Cancelling the last remaining item
    /// closes the order.
    #[instrument(skip(self), fields(order_id = %order_id, item_id = %item_id))]
    pub async fn cancel_item(
        &self,
        order_id: Uuid,
        item_id: Uuid,
        actor_id: Uuid,
        reason: String,
    ) -> Result<CancellationOutcome, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        Self::check_actor(&order, actor_id)?;

        if let Some(block) = order.status.cancellation_block_reason() {
            return Err(ServiceError::InvalidOperation(block.to_string()));
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;

        let item = items
            .iter()
            .find(|i| i.id == item_id)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Item {} not found on order {}", item_id, order_id))
            })?
            .clone();

        if !item.status.is_active() {
            return Err(ServiceError::AlreadyProcessed(format!(
                "Item {} is already {}",
                item_id, item.status
            )));
        }

        let item_value = item.value();
        let active_items_value: Decimal = items
            .iter()
            .filter(|i| i.status.is_active())
            .map(|i| i.value())
            .sum();
        let shipping_refund =
            proportional_shipping(item_value, active_items_value, order.shipping_cost);
        let refund = item_value + shipping_refund;

        let payment_captured = matches!(
            order.payment_status,
            PaymentStatus::Paid | PaymentStatus::PartiallyRefunded
        );
        let refund_amount = payment_captured.then_some(refund);

        let mut item_active: order_item::ActiveModel = item.clone().into();
        item_active.status = Set(OrderItemStatus::Cancelled);
        item_active.update(&txn).await?;

        let released = if payment_captured {
            self.reservations
                .release_on(
                    &txn,
                    order_id,
                    &[ReservationLine {
                        product_id: item.product_id,
                        category: item.category,
                        quantity: item.quantity,
                    }],
                    actor_id,
                    &format!("Cancelled item {} on order {}", item_id, order_id),
                )
                .await?
        } else {
            Vec::new()
        };

        let remaining_active = items
            .iter()
            .filter(|i| i.id != item_id && i.status.is_active())
            .count();
        let last_item = remaining_active == 0;

        let user_id = order.user_id;
        let transaction_id = order.payment_transaction_id.clone();

        // Remaining amounts only ever move down, and never below zero.
        let new_amount = (order.amount - refund).max(Decimal::ZERO);
        let new_shipping = (order.shipping_cost - shipping_refund).max(Decimal::ZERO);

        let mut active: order::ActiveModel = order.into();
        active.amount = Set(new_amount);
        active.shipping_cost = Set(new_shipping);
        if payment_captured {
            active.payment_status = Set(if last_item {
                PaymentStatus::Refunded
            } else {
                PaymentStatus::PartiallyRefunded
            });
        }
        if last_item {
            active.cancelled_at = Set(Some(chrono::Utc::now()));
            active.cancellation_reason = Set(Some(reason.clone()));
            active.cancelled_by = Set(Some(actor_id));
        }
        let order = active.update(&txn).await?;

        let breakdown = format!(
            "Cancelled item {}: refund ${:.2} (item ${:.2} + shipping ${:.2})",
            item_id, refund, item_value, shipping_refund
        );

        let order = if last_item {
            transition_on(&txn, order, OrderStatus::Cancelled, actor_id, Some(breakdown)).await?
        } else {
            record_history(
                &txn,
                order_id,
                order.status,
                order.status,
                actor_id,
                Some(breakdown),
            )
            .await?;
            order
        };

        txn.commit().await?;

        self.reservations.after_commit(&released).await;

        ITEM_CANCELLATIONS.inc();
        info!(
            order_id = %order_id,
            item_id = %item_id,
            %refund,
            %shipping_refund,
            last_item,
            "Order item cancelled"
        );

        if let Err(e) = self
            .event_sender
            .send(Event::OrderItemCancelled {
                order_id,
                order_item_id: item_id,
                user_id,
                refund_amount: refund,
            })
            .await
        {
            warn!(order_id = %order_id, error = %e, "Failed to send item cancelled event");
        }

        let refund_id = match refund_amount {
            Some(amount) => Some(
                execute_refund(
                    db,
                    &self.event_sender,
                    self.gateway.as_ref(),
                    order_id,
                    user_id,
                    None,
                    transaction_id.as_deref(),
                    amount,
                    self.refund_max_attempts,
                )
                .await?
                .id,
            ),
            None => None,
        };

        Ok(CancellationOutcome {
            order,
            refund_amount,
            shipping_refund,
            refund_id,
        })
    }

    /// Looks up a refund row, for reconciliation surfaces.
    #[instrument(skip(self))]
    pub async fn get_refund(&self, refund_id: Uuid) -> Result<refund::Model, ServiceError> {
        let db = &*self.db_pool;
        refund::Entity::find_by_id(refund_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Refund {} not found", refund_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn shipping_allocation_matches_worked_example() {
        // 30/100 of a $20 shipping charge.
        let allocation = proportional_shipping(dec!(30), dec!(100), dec!(20));
        assert_eq!(allocation, dec!(6.00));
    }

    #[test]
    fn zero_active_value_allocates_nothing() {
        assert_eq!(
            proportional_shipping(dec!(10), Decimal::ZERO, dec!(20)),
            Decimal::ZERO
        );
    }

    #[test]
    fn round2_is_half_away_from_zero() {
        assert_eq!(round2(dec!(1.005)), dec!(1.01));
        assert_eq!(round2(dec!(2.674999)), dec!(2.67));
    }

    #[test]
    fn allocations_for_uneven_split_carry_penny_drift() {
        // Three equal items sharing $10.00: each slice rounds to $3.33 and
        // the cents never add back up to the original charge.
        let shipping = dec!(10.00);
        let per_item = proportional_shipping(dec!(1), dec!(3), shipping);
        assert_eq!(per_item, dec!(3.33));
        assert_eq!(per_item * dec!(3), dec!(9.99));
    }

    proptest! {
        #[test]
        fn allocation_never_exceeds_shipping_cost(
            item_cents in 1i64..100_000,
            extra_cents in 0i64..100_000,
            shipping_cents in 0i64..50_000,
        ) {
            let item_value = Decimal::new(item_cents, 2);
            let active_value = item_value + Decimal::new(extra_cents, 2);
            let shipping = Decimal::new(shipping_cents, 2);

            let allocation = proportional_shipping(item_value, active_value, shipping);

            prop_assert!(allocation >= Decimal::ZERO);
            // item_value/active_value <= 1, so the slice stays within a
            // rounding half-cent of the full charge.
            prop_assert!(allocation <= shipping + dec!(0.005));
            prop_assert!(allocation.scale() <= 2);
        }
    }
}
