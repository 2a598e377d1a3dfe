use sea_orm::TransactionTrait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::DbPool,
    entities::order::{self, OrderStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::orders::transition_on,
    services::SYSTEM_ACTOR,
};

/// Inbound event: the carrier reported a shipment status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShipmentStatusChanged {
    pub tracking_number: String,
    pub carrier_status: String,
}

/// Maps a carrier status string onto the order lifecycle. Unknown statuses
/// map to nothing and are ignored upstream.
pub fn map_carrier_status(carrier_status: &str) -> Option<OrderStatus> {
    match carrier_status.to_ascii_lowercase().as_str() {
        "shipped" | "picked_up" | "accepted" => Some(OrderStatus::Shipped),
        "in_transit" | "out_for_delivery" | "arrived_at_facility" => Some(OrderStatus::InTransit),
        "delivered" => Some(OrderStatus::Delivered),
        _ => None,
    }
}

/// Translates carrier tracking callbacks into order status transitions.
#[derive(Clone)]
pub struct ShipmentService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
}

impl ShipmentService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Applies a carrier status callback to the order carrying the tracking
    /// number. Unknown carrier statuses are logged and skipped; a callback
    /// matching the order's current status is a no-op.
    #[instrument(skip(self, update), fields(tracking = %update.tracking_number, carrier_status = %update.carrier_status))]
    pub async fn handle_shipment_status(
        &self,
        update: ShipmentStatusChanged,
    ) -> Result<Option<order::Model>, ServiceError> {
        let Some(new_status) = map_carrier_status(&update.carrier_status) else {
            warn!(carrier_status = %update.carrier_status, "Unknown carrier status; ignoring");
            return Ok(None);
        };

        let db = &*self.db_pool;
        let txn = db.begin().await?;

        let order = {
            use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
            order::Entity::find()
                .filter(order::Column::TrackingNumber.eq(update.tracking_number.as_str()))
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!(
                        "No order with tracking number {}",
                        update.tracking_number
                    ))
                })?
        };

        if order.status == new_status {
            return Ok(Some(order));
        }

        let old_status = order.status;
        let user_id = order.user_id;
        let order_id = order.id;

        let updated = transition_on(
            &txn,
            order,
            new_status,
            SYSTEM_ACTOR,
            Some(format!("Carrier reported {}", update.carrier_status)),
        )
        .await?;

        txn.commit().await?;

        info!(order_id = %order_id, old_status = %old_status, new_status = %new_status, "Shipment status applied");

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
            warn!(order_id = %order_id, error = %e, "Failed to send status changed event");
        }

        Ok(Some(updated))
    }
}
