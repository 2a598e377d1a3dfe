use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::product_stock::ProductCategory;

/// Kinds of stock movements recorded in the ledger.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum StockChangeType {
    #[sea_orm(string_value = "Sale")]
    Sale,
    #[sea_orm(string_value = "Return")]
    Return,
    #[sea_orm(string_value = "Adjustment")]
    Adjustment,
}

/// The `inventory_log` table.
///
/// Append-only: rows are never updated or deleted once written. The log is
/// the source of truth for stock audits; `previous_stock + quantity_change`
/// must equal `new_stock` for every row.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inventory_log")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub product_id: Uuid,
    pub category: ProductCategory,
    pub change_type: StockChangeType,

    /// Signed quantity delta applied to the stock counter.
    pub quantity_change: i32,
    pub previous_stock: i32,
    pub new_stock: i32,

    pub reason: String,
    pub order_id: Option<Uuid>,
    pub actor_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, _insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        if let ActiveValue::NotSet = active_model.created_at {
            active_model.created_at = Set(Utc::now());
        }
        Ok(active_model)
    }
}
