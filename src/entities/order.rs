use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Enum representing the possible statuses of an order.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum OrderStatus {
    #[sea_orm(string_value = "Pending")]
    Pending,
    #[sea_orm(string_value = "Confirmed")]
    Confirmed,
    #[sea_orm(string_value = "Processing")]
    Processing,
    #[sea_orm(string_value = "Shipped")]
    Shipped,
    #[sea_orm(string_value = "InTransit")]
    InTransit,
    #[sea_orm(string_value = "Delivered")]
    Delivered,
    #[sea_orm(string_value = "Completed")]
    Completed,
    #[sea_orm(string_value = "Failed")]
    Failed,
    #[sea_orm(string_value = "Cancelled")]
    Cancelled,
    #[sea_orm(string_value = "Returned")]
    Returned,
    #[sea_orm(string_value = "Refunded")]
    Refunded,
}

impl OrderStatus {
    /// Validates a status transition against the order lifecycle table.
    pub fn can_transition_to(self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Confirmed, Processing)
                | (Confirmed, Cancelled)
                | (Processing, Shipped)
                | (Processing, Cancelled)
                | (Shipped, InTransit)
                | (Shipped, Delivered)
                | (InTransit, Delivered)
                | (Delivered, Completed)
                | (Completed, Returned)
                | (Failed, Pending)
                | (Failed, Cancelled)
                | (Returned, Refunded)
        )
    }

    /// Customer-facing cancellation is narrower than the transition table:
    /// once fulfilment has started the order must go through the returns
    /// flow instead. Returns the user-facing explanation when cancellation
    /// is not allowed from this status.
    pub fn cancellation_block_reason(self) -> Option<&'static str> {
        use OrderStatus::*;
        match self {
            Pending | Confirmed | Processing => None,
            Shipped | InTransit => {
                Some("This order has already shipped. Please request a return once it is delivered.")
            }
            Delivered => Some("This order has been delivered. Please request a return instead."),
            Completed => Some("This order is completed. Please request a return instead."),
            Cancelled => Some("This order has already been cancelled."),
            Failed => Some("This order's payment failed; there is nothing to cancel."),
            Returned => Some("This order has been returned and cannot be cancelled."),
            Refunded => Some("This order has already been refunded."),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Refunded)
    }
}

/// Payment state of an order, driven by gateway events and refund flows.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "Pending")]
    Pending,
    #[sea_orm(string_value = "Paid")]
    Paid,
    #[sea_orm(string_value = "Failed")]
    Failed,
    #[sea_orm(string_value = "PartiallyRefunded")]
    PartiallyRefunded,
    #[sea_orm(string_value = "Refunded")]
    Refunded,
}

/// The `orders` table.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub user_id: Uuid,

    /// Remaining order value. Mutated downward by partial cancellations and
    /// returns; never negative.
    pub amount: Decimal,

    /// Remaining shipping charge, reduced by proportional allocations.
    pub shipping_cost: Decimal,

    pub payment_status: PaymentStatus,
    pub status: OrderStatus,

    /// Gateway transaction recorded at payment confirmation.
    pub payment_transaction_id: Option<String>,
    pub paid_amount: Option<Decimal>,

    pub tracking_number: Option<String>,

    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,

    /// Optimistic lock: bumped on every order write.
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
    #[sea_orm(has_many = "super::order_history::Entity")]
    OrderHistory,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::order_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderHistory.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();
        if insert {
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(now);
            }
        }
        if let ActiveValue::NotSet = active_model.updated_at {
            active_model.updated_at = Set(Some(now));
        }
        Ok(active_model)
    }
}
