use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::DbPool,
    entities::store_credit::{self, Entity as StoreCreditEntity},
    errors::ServiceError,
    events::{Event, EventSender},
};

/// One credit drawn against, and by how much.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditDraw {
    pub credit_id: Uuid,
    pub drawn: Decimal,
}

/// Manages store-credit balances: issuance and oldest-first draw-down.
#[derive(Clone)]
pub struct StoreCreditService {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
}

impl StoreCreditService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Issues a credit to a user.
    #[instrument(skip(self), fields(user_id = %user_id, %amount))]
    pub async fn issue(
        &self,
        user_id: Uuid,
        amount: Decimal,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<store_credit::Model, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await?;
        let credit = self.issue_on(&txn, user_id, amount, expires_at).await?;
        txn.commit().await?;

        if let Err(e) = self
            .event_sender
            .send(Event::StoreCreditIssued {
                credit_id: credit.id,
                user_id,
                amount,
                expires_at,
            })
            .await
        {
            warn!(user_id = %user_id, error = %e, "Failed to send store credit event");
        }

        Ok(credit)
    }

    /// Transaction-scoped issuance, used by the return workflow. Event
    /// emission is left to the caller, after its transaction commits.
    pub(crate) async fn issue_on(
        &self,
        txn: &DatabaseTransaction,
        user_id: Uuid,
        amount: Decimal,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<store_credit::Model, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Store credit amount must be positive".to_string(),
            ));
        }

        let credit = store_credit::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            amount: Set(amount),
            balance: Set(amount),
            expires_at: Set(expires_at),
            ..Default::default()
        }
        .insert(txn)
        .await?;

        info!(user_id = %user_id, credit_id = %credit.id, %amount, "Store credit issued");

        Ok(credit)
    }

    /// Total usable balance for a user: unexpired credits with balance left.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn available_balance(&self, user_id: Uuid) -> Result<Decimal, ServiceError> {
        let db = &*self.db_pool;
        let now = Utc::now();

        let credits = StoreCreditEntity::find()
            .filter(store_credit::Column::UserId.eq(user_id))
            .all(db)
            .await?;

        Ok(credits
            .iter()
            .filter(|c| !c.is_expired(now))
            .map(|c| c.balance)
            .sum())
    }

    /// Draws an amount from a user's credits, oldest first. Either the
    /// whole amount is covered or nothing is drawn; balances never go
    /// negative.
    #[instrument(skip(self), fields(user_id = %user_id, %amount))]
    pub async fn draw_down(
        &self,
        user_id: Uuid,
        amount: Decimal,
    ) -> Result<Vec<CreditDraw>, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Draw amount must be positive".to_string(),
            ));
        }

        let db = &*self.db_pool;
        let now = Utc::now();
        let txn = db.begin().await?;

        let credits = StoreCreditEntity::find()
            .filter(store_credit::Column::UserId.eq(user_id))
            .order_by_asc(store_credit::Column::CreatedAt)
            .all(&txn)
            .await?;

        let usable: Vec<_> = credits
            .into_iter()
            .filter(|c| !c.is_expired(now) && c.balance > Decimal::ZERO)
            .collect();

        let total: Decimal = usable.iter().map(|c| c.balance).sum();
        if total < amount {
            return Err(ServiceError::InvalidOperation(format!(
                "Insufficient store credit: requested {}, available {}",
                amount, total
            )));
        }

        let mut remaining = amount;
        let mut draws = Vec::new();
        for credit in usable {
            if remaining == Decimal::ZERO {
                break;
            }
            let drawn = credit.balance.min(remaining);
            remaining -= drawn;

            let new_balance = credit.balance - drawn;
            let credit_id = credit.id;
            let mut active: store_credit::ActiveModel = credit.into();
            active.balance = Set(new_balance);
            active.update(&txn).await?;

            draws.push(CreditDraw { credit_id, drawn });
        }

        txn.commit().await?;

        info!(user_id = %user_id, %amount, draws = draws.len(), "Store credit drawn down");

        Ok(draws)
    }
}
