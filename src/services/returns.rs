use chrono::{Duration, Utc};
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::DbPool,
    entities::inventory_log::StockChangeType,
    entities::order::{self, Entity as OrderEntity, OrderStatus, PaymentStatus},
    entities::order_item::{self, Entity as OrderItemEntity, OrderItemStatus},
    entities::refund::{self, RefundStatus},
    entities::return_item::{self, Entity as ReturnItemEntity},
    entities::return_request::{self, Entity as ReturnRequestEntity, RefundMethod, ReturnStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders::transition_on,
    services::payments::{execute_refund, PaymentGateway},
    services::stock_ledger::{StockDelta, StockLedgerService},
    services::store_credits::StoreCreditService,
};

lazy_static! {
    static ref RETURN_REQUESTS: IntCounter = IntCounter::new(
        "return_requests_total",
        "Total number of return requests created"
    )
    .expect("metric can be created");
    static ref RETURN_REFUNDS: IntCounter = IntCounter::new(
        "return_refunds_total",
        "Total number of refunds issued for returns"
    )
    .expect("metric can be created");
}

/// Request types for the return workflow
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateReturnRequest {
    pub order_id: Uuid,
    pub user_id: Uuid,
    #[validate(length(min = 1, max = 1000, message = "Reason must be between 1 and 1000 characters"))]
    pub reason: String,
    pub refund_method: RefundMethod,
    #[validate(length(min = 1, message = "A return needs at least one item"))]
    pub items: Vec<ReturnItemRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReturnItemRequest {
    pub order_item_id: Uuid,
    pub quantity: i32,
}

/// Approve or reject a requested return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReturnDecision {
    Approve { approver: Uuid },
    Reject { approver: Uuid, reason: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReturnDetails {
    pub request: return_request::Model,
    pub items: Vec<return_item::Model>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefundOutcome {
    pub refund: refund::Model,
    pub return_request: return_request::Model,
}

/// Post-delivery return workflow: request, approval, physical receipt with
/// restock, and refund issuance.
#[derive(Clone)]
pub struct ReturnService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    stock_ledger: Arc<StockLedgerService>,
    store_credits: Arc<StoreCreditService>,
    gateway: Arc<dyn PaymentGateway>,
    return_window_days: i64,
    refund_max_attempts: u32,
}

impl ReturnService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        stock_ledger: Arc<StockLedgerService>,
        store_credits: Arc<StoreCreditService>,
        gateway: Arc<dyn PaymentGateway>,
        return_window_days: i64,
        refund_max_attempts: u32,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            stock_ledger,
            store_credits,
            gateway,
            return_window_days,
            refund_max_attempts,
        }
    }

    /// Creates a return request for delivered or completed orders within
    /// the return window. The refund amount is the sum of unit price times
    /// returned quantity; shipping is not allocated at request time.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn create_return_request(
        &self,
        request: CreateReturnRequest,
    ) -> Result<ReturnDetails, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        let db = &*self.db_pool;
        let txn = db.begin().await?;

        let order = OrderEntity::find_by_id(request.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", request.order_id))
            })?;

        if order.user_id != request.user_id {
            return Err(ServiceError::Unauthorized(format!(
                "Actor {} does not own order {}",
                request.user_id, order.id
            )));
        }

        if !matches!(order.status, OrderStatus::Delivered | OrderStatus::Completed) {
            return Err(ServiceError::InvalidOperation(format!(
                "Order in status {} is not eligible for return; returns open after delivery",
                order.status
            )));
        }

        let deadline = order.created_at + Duration::days(self.return_window_days);
        let now = Utc::now();
        if now > deadline {
            return Err(ServiceError::WindowExpired(format!(
                "The {}-day return window for order {} closed on {}",
                self.return_window_days,
                order.id,
                deadline.format("%Y-%m-%d")
            )));
        }

        let order_items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&txn)
            .await?;

        let mut refund_amount = Decimal::ZERO;
        let mut resolved = Vec::with_capacity(request.items.len());
        for item_request in &request.items {
            let item = order_items
                .iter()
                .find(|i| i.id == item_request.order_item_id)
                .ok_or_else(|| {
                    ServiceError::NotFound(format!(
                        "Item {} not found on order {}",
                        item_request.order_item_id, order.id
                    ))
                })?;

            if !item.status.is_active() {
                return Err(ServiceError::AlreadyProcessed(format!(
                    "Item {} is already {}",
                    item.id, item.status
                )));
            }
            if item_request.quantity < 1 {
                return Err(ServiceError::ValidationError(
                    "Return quantity must be at least 1".to_string(),
                ));
            }
            if item_request.quantity > item.quantity {
                return Err(ServiceError::ValidationError(format!(
                    "Cannot return {} of item {}; only {} purchased",
                    item_request.quantity, item.id, item.quantity
                )));
            }

            refund_amount += item.price * Decimal::from(item_request.quantity);
            resolved.push((item.clone(), item_request.quantity));
        }

        let return_id = Uuid::new_v4();
        let request_model = return_request::ActiveModel {
            id: Set(return_id),
            order_id: Set(order.id),
            user_id: Set(request.user_id),
            reason: Set(request.reason.clone()),
            status: Set(ReturnStatus::Requested),
            refund_amount: Set(refund_amount),
            refund_method: Set(request.refund_method),
            return_deadline: Set(deadline),
            approved_by: Set(None),
            rejection_reason: Set(None),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::with_capacity(resolved.len());
        for (item, quantity) in &resolved {
            let model = return_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                return_id: Set(return_id),
                order_item_id: Set(item.id),
                product_id: Set(item.product_id),
                quantity: Set(*quantity),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
            items.push(model);
        }

        txn.commit().await?;

        RETURN_REQUESTS.inc();
        info!(return_id = %return_id, order_id = %order.id, %refund_amount, "Return requested");

        if let Err(e) = self
            .event_sender
            .send(Event::ReturnRequested {
                return_id,
                order_id: order.id,
                user_id: request.user_id,
            })
            .await
        {
            warn!(return_id = %return_id, error = %e, "Failed to send return requested event");
        }

        Ok(ReturnDetails {
            request: request_model,
            items,
        })
    }

    /// Approves or rejects a requested return. Both decisions are terminal
    /// for the decision point: a return can be decided exactly once.
    #[instrument(skip(self, decision), fields(return_id = %return_id))]
    pub async fn process_return_request(
        &self,
        return_id: Uuid,
        decision: ReturnDecision,
    ) -> Result<return_request::Model, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await?;

        let request = ReturnRequestEntity::find_by_id(return_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Return {} not found", return_id)))?;

        if request.status != ReturnStatus::Requested {
            return Err(ServiceError::AlreadyProcessed(format!(
                "Return {} has already been {}",
                return_id, request.status
            )));
        }

        let user_id = request.user_id;
        let mut active: return_request::ActiveModel = request.into();
        let event = match &decision {
            ReturnDecision::Approve { approver } => {
                active.status = Set(ReturnStatus::Approved);
                active.approved_by = Set(Some(*approver));
                Event::ReturnApproved { return_id, user_id }
            }
            ReturnDecision::Reject { approver, reason } => {
                active.status = Set(ReturnStatus::Rejected);
                active.approved_by = Set(Some(*approver));
                active.rejection_reason = Set(Some(reason.clone()));
                Event::ReturnRejected {
                    return_id,
                    user_id,
                    reason: reason.clone(),
                }
            }
        };
        let updated = active.update(&txn).await?;

        txn.commit().await?;

        info!(return_id = %return_id, status = %updated.status, "Return decision recorded");

        if let Err(e) = self.event_sender.send(event).await {
            warn!(return_id = %return_id, error = %e, "Failed to send return decision event");
        }

        Ok(updated)
    }

    /// Records physical receipt of an approved return: restocks every
    /// returned item (category resolved from the original order item) and
    /// moves the return to Received.
    #[instrument(skip(self), fields(return_id = %return_id))]
    pub async fn process_returned_items(
        &self,
        return_id: Uuid,
        actor_id: Uuid,
    ) -> Result<return_request::Model, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await?;

        let request = ReturnRequestEntity::find_by_id(return_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Return {} not found", return_id)))?;

        match request.status {
            ReturnStatus::Approved => {}
            ReturnStatus::Received | ReturnStatus::Refunded => {
                return Err(ServiceError::AlreadyProcessed(format!(
                    "Return {} items have already been received",
                    return_id
                )));
            }
            other => {
                return Err(ServiceError::InvalidOperation(format!(
                    "Return {} is {} and must be approved before items are received",
                    return_id, other
                )));
            }
        }

        let items = ReturnItemEntity::find()
            .filter(return_item::Column::ReturnId.eq(return_id))
            .all(&txn)
            .await?;

        let mut applied = Vec::with_capacity(items.len());
        for item in &items {
            // A return item has no category of its own; look it up on the
            // original order item.
            let order_item = OrderItemEntity::find_by_id(item.order_item_id)
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!(
                        "Original order item {} missing for return {}",
                        item.order_item_id, return_id
                    ))
                })?;

            let delta = StockDelta {
                product_id: item.product_id,
                category: order_item.category,
                delta: item.quantity,
                change_type: StockChangeType::Return,
                reason: format!("Return {} received", return_id),
                order_id: Some(request.order_id),
                actor_id,
            };
            applied.push(self.stock_ledger.apply_delta_on(&txn, &delta).await?);

            if item.quantity == order_item.quantity {
                let mut item_active: order_item::ActiveModel = order_item.into();
                item_active.status = Set(OrderItemStatus::Returned);
                item_active.update(&txn).await?;
            }
        }

        let mut active: return_request::ActiveModel = request.into();
        active.status = Set(ReturnStatus::Received);
        let updated = active.update(&txn).await?;

        // A fully returned completed order moves to Returned itself.
        let order = OrderEntity::find_by_id(updated.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", updated.order_id))
            })?;
        let any_active = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&txn)
            .await?
            .iter()
            .any(|i| i.status.is_active());
        if !any_active && order.status == OrderStatus::Completed {
            transition_on(
                &txn,
                order,
                OrderStatus::Returned,
                actor_id,
                Some(format!("All items returned via return {}", return_id)),
            )
            .await?;
        }

        txn.commit().await?;

        self.stock_ledger.after_commit(&applied).await;

        info!(return_id = %return_id, restocked_items = applied.len(), "Returned items received and restocked");

        if let Err(e) = self
            .event_sender
            .send(Event::ReturnReceived { return_id })
            .await
        {
            warn!(return_id = %return_id, error = %e, "Failed to send return received event");
        }

        Ok(updated)
    }

    /// Issues the refund for a received return, either back through the
    /// payment gateway or as store credit.
    #[instrument(skip(self), fields(return_id = %return_id))]
    pub async fn issue_refund(
        &self,
        return_id: Uuid,
        actor_id: Uuid,
    ) -> Result<RefundOutcome, ServiceError> {
        let db = &*self.db_pool;

        let request = ReturnRequestEntity::find_by_id(return_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Return {} not found", return_id)))?;

        match request.status {
            ReturnStatus::Received => {}
            ReturnStatus::Refunded => {
                return Err(ServiceError::AlreadyProcessed(format!(
                    "Return {} has already been refunded",
                    return_id
                )));
            }
            other => {
                return Err(ServiceError::InvalidOperation(format!(
                    "Return {} is {} and must be received before refunding",
                    return_id, other
                )));
            }
        }

        let order = OrderEntity::find_by_id(request.order_id)
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", request.order_id))
            })?;

        match request.refund_method {
            RefundMethod::OriginalPayment => {
                self.refund_to_original_payment(request, order, actor_id)
                    .await
            }
            RefundMethod::StoreCredit => self.refund_as_store_credit(request, order).await,
        }
    }

    async fn refund_to_original_payment(
        &self,
        request: return_request::Model,
        order: order::Model,
        actor_id: Uuid,
    ) -> Result<RefundOutcome, ServiceError> {
        let db = &*self.db_pool;

        let refund = execute_refund(
            db,
            &self.event_sender,
            self.gateway.as_ref(),
            order.id,
            order.user_id,
            Some(request.id),
            order.payment_transaction_id.as_deref(),
            request.refund_amount,
            self.refund_max_attempts,
        )
        .await?;

        if refund.status != RefundStatus::Completed {
            // The return stays Received so the refund can be retried once
            // the gateway recovers.
            return Ok(RefundOutcome {
                refund,
                return_request: request,
            });
        }

        let txn = db.begin().await?;

        let mut request_active: return_request::ActiveModel = request.into();
        request_active.status = Set(ReturnStatus::Refunded);
        let updated_request = request_active.update(&txn).await?;

        let mut order_active: order::ActiveModel = order.into();
        order_active.payment_status = Set(PaymentStatus::PartiallyRefunded);
        let order = order_active.update(&txn).await?;

        // A fully returned order follows its refund to the terminal state.
        if order.status == OrderStatus::Returned {
            transition_on(
                &txn,
                order,
                OrderStatus::Refunded,
                actor_id,
                Some(format!("Refund issued for return {}", updated_request.id)),
            )
            .await?;
        }

        txn.commit().await?;

        RETURN_REFUNDS.inc();
        info!(return_id = %updated_request.id, refund_id = %refund.id, "Return refunded to original payment");

        Ok(RefundOutcome {
            refund,
            return_request: updated_request,
        })
    }

    async fn refund_as_store_credit(
        &self,
        request: return_request::Model,
        order: order::Model,
    ) -> Result<RefundOutcome, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await?;

        let credit = self
            .store_credits
            .issue_on(&txn, request.user_id, request.refund_amount, None)
            .await?;

        let refund = refund::ActiveModel {
            id: Set(Uuid::new_v4()),
            return_id: Set(Some(request.id)),
            order_id: Set(order.id),
            amount: Set(request.refund_amount),
            refund_method: Set(RefundMethod::StoreCredit),
            status: Set(RefundStatus::Completed),
            attempts: Set(0),
            last_error: Set(None),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let user_id = request.user_id;
        let amount = request.refund_amount;
        let return_id = request.id;

        let mut request_active: return_request::ActiveModel = request.into();
        request_active.status = Set(ReturnStatus::Refunded);
        let updated_request = request_active.update(&txn).await?;

        txn.commit().await?;

        RETURN_REFUNDS.inc();
        info!(return_id = %return_id, credit_id = %credit.id, "Return refunded as store credit");

        for event in [
            Event::StoreCreditIssued {
                credit_id: credit.id,
                user_id,
                amount,
                expires_at: credit.expires_at,
            },
            Event::RefundIssued {
                refund_id: refund.id,
                order_id: order.id,
                user_id,
                amount,
                refund_method: RefundMethod::StoreCredit,
            },
        ] {
            if let Err(e) = self.event_sender.send(event).await {
                warn!(return_id = %return_id, error = %e, "Failed to send refund event");
            }
        }

        Ok(RefundOutcome {
            refund,
            return_request: updated_request,
        })
    }

    /// Retrieves a return with its items.
    #[instrument(skip(self), fields(return_id = %return_id))]
    pub async fn get_return(&self, return_id: Uuid) -> Result<ReturnDetails, ServiceError> {
        let db = &*self.db_pool;

        let request = ReturnRequestEntity::find_by_id(return_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Return {} not found", return_id)))?;

        let items = ReturnItemEntity::find()
            .filter(return_item::Column::ReturnId.eq(return_id))
            .all(db)
            .await?;

        Ok(ReturnDetails { request, items })
    }

    /// Lists an order's returns, newest first. An order may accumulate
    /// several sequential partial returns.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn list_returns_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<return_request::Model>, ServiceError> {
        let db = &*self.db_pool;

        let returns = ReturnRequestEntity::find()
            .filter(return_request::Column::OrderId.eq(order_id))
            .order_by_desc(return_request::Column::CreatedAt)
            .all(db)
            .await?;

        Ok(returns)
    }
}
