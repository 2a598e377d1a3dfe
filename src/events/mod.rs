use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::inventory_log::StockChangeType;
use crate::entities::order::OrderStatus;
use crate::entities::product_stock::ProductCategory;
use crate::entities::return_request::RefundMethod;
use crate::notifications::Notifier;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

// Define the various events that can occur in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order events
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
    },
    OrderStatusChanged {
        order_id: Uuid,
        user_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled {
        order_id: Uuid,
        user_id: Uuid,
        refund_amount: Option<Decimal>,
    },
    OrderItemCancelled {
        order_id: Uuid,
        order_item_id: Uuid,
        user_id: Uuid,
        refund_amount: Decimal,
    },
    PaymentConfirmed {
        order_id: Uuid,
        user_id: Uuid,
        amount: Decimal,
    },
    PaymentFailed {
        order_id: Uuid,
        user_id: Uuid,
        reason: String,
    },

    // Inventory events
    StockAdjusted {
        product_id: Uuid,
        category: ProductCategory,
        change_type: StockChangeType,
        quantity_change: i32,
        new_stock: i32,
        order_id: Option<Uuid>,
    },
    LowStockAlertRaised {
        product_id: Uuid,
        category: ProductCategory,
        current_stock: i32,
        threshold: i32,
    },
    LowStockAlertResolved {
        product_id: Uuid,
        category: ProductCategory,
        current_stock: i32,
    },

    // Return events
    ReturnRequested {
        return_id: Uuid,
        order_id: Uuid,
        user_id: Uuid,
    },
    ReturnApproved {
        return_id: Uuid,
        user_id: Uuid,
    },
    ReturnRejected {
        return_id: Uuid,
        user_id: Uuid,
        reason: String,
    },
    ReturnReceived {
        return_id: Uuid,
    },

    // Refund events
    RefundRequested {
        refund_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
        refund_method: RefundMethod,
    },
    RefundIssued {
        refund_id: Uuid,
        order_id: Uuid,
        user_id: Uuid,
        amount: Decimal,
        refund_method: RefundMethod,
    },
    RefundFailed {
        refund_id: Uuid,
        order_id: Uuid,
        amount: Decimal,
        error: String,
    },
    StoreCreditIssued {
        credit_id: Uuid,
        user_id: Uuid,
        amount: Decimal,
        expires_at: Option<DateTime<Utc>>,
    },
}

impl Event {
    /// The user this event should be routed to, when it is user-facing.
    /// Vendor- and operator-facing events (low stock, refund-gateway
    /// plumbing) return `None` and are consumed by their own dispatchers.
    pub fn notify_user(&self) -> Option<Uuid> {
        match self {
            Event::OrderCreated { user_id, .. }
            | Event::OrderStatusChanged { user_id, .. }
            | Event::OrderCancelled { user_id, .. }
            | Event::OrderItemCancelled { user_id, .. }
            | Event::PaymentConfirmed { user_id, .. }
            | Event::PaymentFailed { user_id, .. }
            | Event::ReturnRequested { user_id, .. }
            | Event::ReturnApproved { user_id, .. }
            | Event::ReturnRejected { user_id, .. }
            | Event::RefundIssued { user_id, .. }
            | Event::StoreCreditIssued { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }
}

/// Consumes the event channel, logging every event and forwarding the
/// user-facing ones through the injected notification capability.
///
/// Notification delivery is best-effort: failures are logged, never
/// propagated back into the operations that produced the events.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, notifier: Arc<dyn Notifier>) {
    while let Some(event) = rx.recv().await {
        info!(?event, "Processing event");

        if let Some(user_id) = event.notify_user() {
            if let Err(e) = notifier.notify(user_id, &event).await {
                warn!(user_id = %user_id, error = %e, "Failed to deliver notification");
            }
        }
    }
    info!("Event channel closed; event processor shutting down");
}
