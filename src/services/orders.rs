use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::DbPool,
    entities::order::{self, Entity as OrderEntity, OrderStatus, PaymentStatus},
    entities::order_history::{self, Entity as OrderHistoryEntity},
    entities::order_item::{self, Entity as OrderItemEntity, OrderItemStatus},
    entities::product_stock::ProductCategory,
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Request/Response types for the order service
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    pub shipping_cost: Decimal,
    #[validate(length(min = 1, message = "An order needs at least one item"))]
    pub items: Vec<CreateOrderItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateOrderItem {
    pub product_id: Uuid,
    pub category: ProductCategory,
    pub vendor_id: Uuid,
    pub quantity: i32,
    pub price: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Service owning the order aggregate: creation, the status state machine,
/// and its append-only history trail.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
}

impl OrderService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Creates a new order with its line items. Unit prices are snapshotted
    /// on the items; the order amount is the sum of line values, shipping
    /// kept separately.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderDetails, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        if request.shipping_cost < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Shipping cost cannot be negative".to_string(),
            ));
        }
        for item in &request.items {
            if item.quantity < 1 {
                return Err(ServiceError::ValidationError(
                    "Item quantity must be at least 1".to_string(),
                ));
            }
            if item.price < Decimal::ZERO {
                return Err(ServiceError::ValidationError(
                    "Item price cannot be negative".to_string(),
                ));
            }
        }

        let db = &*self.db_pool;
        let order_id = Uuid::new_v4();
        let amount: Decimal = request
            .items
            .iter()
            .map(|i| i.price * Decimal::from(i.quantity))
            .sum();

        let txn = db.begin().await?;

        let order_model = order::ActiveModel {
            id: Set(order_id),
            user_id: Set(request.user_id),
            amount: Set(amount),
            shipping_cost: Set(request.shipping_cost),
            payment_status: Set(PaymentStatus::Pending),
            status: Set(OrderStatus::Pending),
            payment_transaction_id: Set(None),
            paid_amount: Set(None),
            tracking_number: Set(None),
            cancelled_at: Set(None),
            cancellation_reason: Set(None),
            cancelled_by: Set(None),
            version: Set(1),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let model = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                category: Set(item.category),
                vendor_id: Set(item.vendor_id),
                quantity: Set(item.quantity),
                price: Set(item.price),
                status: Set(OrderItemStatus::Pending),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
            items.push(model);
        }

        record_history(
            &txn,
            order_id,
            OrderStatus::Pending,
            OrderStatus::Pending,
            request.user_id,
            Some("Order created".to_string()),
        )
        .await?;

        txn.commit().await?;

        info!(order_id = %order_id, user_id = %request.user_id, %amount, "Order created");

        if let Err(e) = self
            .event_sender
            .send(Event::OrderCreated {
                order_id,
                user_id: request.user_id,
            })
            .await
        {
            warn!(order_id = %order_id, error = %e, "Failed to send order created event");
        }

        Ok(OrderDetails {
            order: order_model,
            items,
        })
    }

    /// Retrieves an order with its items.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db_pool;

        let order = OrderEntity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(db)
            .await?;

        Ok(OrderDetails { order, items })
    }

    /// Finds an order by its tracking number.
    #[instrument(skip(self))]
    pub async fn find_by_tracking(
        &self,
        tracking_number: &str,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;

        OrderEntity::find()
            .filter(order::Column::TrackingNumber.eq(tracking_number))
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No order with tracking number {}",
                    tracking_number
                ))
            })
    }

    /// Updates an order's status through the lifecycle state machine,
    /// appending the history entry that forms the canonical audit trail.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        actor_id: Uuid,
        reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let old_status = order.status;
        let user_id = order.user_id;
        let updated = transition_on(&txn, order, new_status, actor_id, reason).await?;

        txn.commit().await?;

        info!(order_id = %order_id, old_status = %old_status, new_status = %new_status, "Order status updated");

        if let Err(e) = self
            .event_sender
            .send(Event::OrderStatusChanged {
                order_id,
                user_id,
                old_status,
                new_status,
            })
            .await
        {
            warn!(order_id = %order_id, error = %e, "Failed to send order status changed event");
        }

        Ok(updated)
    }

    /// Stamps the carrier tracking number on an order when it ships.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn set_tracking_number(
        &self,
        order_id: Uuid,
        tracking_number: String,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;

        let order = OrderEntity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let mut active: order::ActiveModel = order.into();
        active.tracking_number = Set(Some(tracking_number));
        active.updated_at = Set(Some(Utc::now()));

        let updated = active.update(db).await?;
        Ok(updated)
    }

    /// Lists the append-only history for an order, oldest first.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn list_history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_history::Model>, ServiceError> {
        let db = &*self.db_pool;

        let entries = OrderHistoryEntity::find()
            .filter(order_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_history::Column::CreatedAt)
            .all(db)
            .await?;

        Ok(entries)
    }
}

/// Applies a validated status transition inside the caller's transaction.
///
/// The write is conditional on the order's version so that two concurrent
/// transitions cannot both read the same previous status; the loser gets
/// `ConcurrentModification`. The matching history row is appended in the
/// same transaction.
pub(crate) async fn transition_on(
    txn: &DatabaseTransaction,
    order: order::Model,
    new_status: OrderStatus,
    actor_id: Uuid,
    reason: Option<String>,
) -> Result<order::Model, ServiceError> {
    if !order.status.can_transition_to(new_status) {
        return Err(ServiceError::InvalidTransition(format!(
            "Order {} cannot move from {} to {}",
            order.id, order.status, new_status
        )));
    }

    let previous_status = order.status;

    let result = OrderEntity::update_many()
        .col_expr(order::Column::Status, Expr::value(new_status))
        .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
        .col_expr(
            order::Column::Version,
            Expr::col(order::Column::Version).add(1),
        )
        .filter(order::Column::Id.eq(order.id))
        .filter(order::Column::Version.eq(order.version))
        .exec(txn)
        .await?;

    if result.rows_affected == 0 {
        warn!(order_id = %order.id, "Concurrent status update detected");
        return Err(ServiceError::ConcurrentModification(order.id));
    }

    record_history(txn, order.id, new_status, previous_status, actor_id, reason).await?;

    let updated = OrderEntity::find_by_id(order.id)
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order.id)))?;

    Ok(updated)
}

/// Appends one order history row.
pub(crate) async fn record_history(
    txn: &DatabaseTransaction,
    order_id: Uuid,
    status: OrderStatus,
    previous_status: OrderStatus,
    actor_id: Uuid,
    reason: Option<String>,
) -> Result<(), ServiceError> {
    order_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        status: Set(status),
        previous_status: Set(previous_status),
        actor_id: Set(actor_id),
        reason: Set(reason),
        ..Default::default()
    }
    .insert(txn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;
    use OrderStatus::*;

    #[test_case(Pending, Confirmed, true)]
    #[test_case(Pending, Cancelled, true)]
    #[test_case(Pending, Failed, true)]
    #[test_case(Pending, Shipped, false)]
    #[test_case(Confirmed, Processing, true)]
    #[test_case(Confirmed, Cancelled, true)]
    #[test_case(Confirmed, Delivered, false)]
    #[test_case(Processing, Shipped, true)]
    #[test_case(Processing, Cancelled, true)]
    #[test_case(Processing, Completed, false)]
    #[test_case(Shipped, InTransit, true)]
    #[test_case(Shipped, Delivered, true)]
    #[test_case(Shipped, Cancelled, false)]
    #[test_case(InTransit, Delivered, true)]
    #[test_case(InTransit, Shipped, false)]
    #[test_case(Delivered, Completed, true)]
    #[test_case(Delivered, Returned, false)]
    #[test_case(Completed, Returned, true)]
    #[test_case(Failed, Pending, true)]
    #[test_case(Failed, Cancelled, true)]
    #[test_case(Failed, Confirmed, false)]
    #[test_case(Returned, Refunded, true)]
    #[test_case(Cancelled, Pending, false)]
    #[test_case(Cancelled, Refunded, false)]
    #[test_case(Refunded, Pending, false)]
    #[test_case(Refunded, Returned, false)]
    fn transition_table(from: OrderStatus, to: OrderStatus, allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn no_status_transitions_to_itself() {
        use sea_orm::Iterable;
        for status in OrderStatus::iter() {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test_case(Pending, true)]
    #[test_case(Confirmed, true)]
    #[test_case(Processing, true)]
    #[test_case(Shipped, false)]
    #[test_case(InTransit, false)]
    #[test_case(Delivered, false)]
    #[test_case(Completed, false)]
    #[test_case(Cancelled, false)]
    #[test_case(Failed, false)]
    #[test_case(Returned, false)]
    #[test_case(Refunded, false)]
    fn cancellation_eligibility(status: OrderStatus, eligible: bool) {
        assert_eq!(status.cancellation_block_reason().is_none(), eligible);
    }

    #[test]
    fn shipped_orders_point_at_the_returns_flow() {
        let reason = Shipped.cancellation_block_reason().unwrap();
        assert!(reason.contains("return"));
    }
}
