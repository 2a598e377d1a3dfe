//! Per-category product stock storage access.
//!
//! Each marketplace category keeps its own catalog partition, so stock
//! access goes through a `ProductRepository` selected by category; callers
//! depend only on the trait.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter,
};
use uuid::Uuid;

use crate::entities::product_stock::{self, Entity as ProductStockEntity, ProductCategory};
use crate::errors::ServiceError;

/// Storage interface for one category's stock rows.
#[async_trait]
pub trait ProductRepository: Send + Sync {
    /// The category this repository serves.
    fn category(&self) -> ProductCategory;

    /// Fetches the stock row for a product in this category.
    async fn find_stock(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
    ) -> Result<Option<product_stock::Model>, ServiceError>;

    /// Inserts a new stock row for this category.
    async fn insert_stock(
        &self,
        txn: &DatabaseTransaction,
        row: product_stock::ActiveModel,
    ) -> Result<product_stock::Model, ServiceError>;

    /// Conditional stock write: lands only if the row still holds
    /// `expected_stock`, so two writers cannot both apply a delta computed
    /// from the same read. Returns whether the write took effect.
    async fn write_stock(
        &self,
        txn: &DatabaseTransaction,
        product_id: Uuid,
        expected_stock: i32,
        new_stock: i32,
    ) -> Result<bool, ServiceError>;
}

macro_rules! category_repository {
    ($name:ident, $category:expr) => {
        pub struct $name;

        #[async_trait]
        impl ProductRepository for $name {
            fn category(&self) -> ProductCategory {
                $category
            }

            async fn find_stock(
                &self,
                txn: &DatabaseTransaction,
                product_id: Uuid,
            ) -> Result<Option<product_stock::Model>, ServiceError> {
                let row = ProductStockEntity::find()
                    .filter(product_stock::Column::ProductId.eq(product_id))
                    .filter(product_stock::Column::Category.eq(self.category()))
                    .one(txn)
                    .await?;
                Ok(row)
            }

            async fn insert_stock(
                &self,
                txn: &DatabaseTransaction,
                row: product_stock::ActiveModel,
            ) -> Result<product_stock::Model, ServiceError> {
                let model = row.insert(txn).await?;
                Ok(model)
            }

            async fn write_stock(
                &self,
                txn: &DatabaseTransaction,
                product_id: Uuid,
                expected_stock: i32,
                new_stock: i32,
            ) -> Result<bool, ServiceError> {
                let result = ProductStockEntity::update_many()
                    .col_expr(product_stock::Column::CurrentStock, Expr::value(new_stock))
                    .col_expr(
                        product_stock::Column::Version,
                        Expr::col(product_stock::Column::Version).add(1),
                    )
                    .col_expr(
                        product_stock::Column::UpdatedAt,
                        Expr::value(Some(Utc::now())),
                    )
                    .filter(product_stock::Column::ProductId.eq(product_id))
                    .filter(product_stock::Column::Category.eq(self.category()))
                    .filter(product_stock::Column::CurrentStock.eq(expected_stock))
                    .exec(txn)
                    .await?;
                Ok(result.rows_affected == 1)
            }
        }
    };
}

category_repository!(ApparelProductRepository, ProductCategory::Apparel);
category_repository!(FootwearProductRepository, ProductCategory::Footwear);
category_repository!(AccessoriesProductRepository, ProductCategory::Accessories);

static APPAREL: ApparelProductRepository = ApparelProductRepository;
static FOOTWEAR: FootwearProductRepository = FootwearProductRepository;
static ACCESSORIES: AccessoriesProductRepository = AccessoriesProductRepository;

/// Selects the repository serving a category.
pub fn product_repository(category: ProductCategory) -> &'static dyn ProductRepository {
    match category {
        ProductCategory::Apparel => &APPAREL,
        ProductCategory::Footwear => &FOOTWEAR,
        ProductCategory::Accessories => &ACCESSORIES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_selection_matches_category() {
        for category in [
            ProductCategory::Apparel,
            ProductCategory::Footwear,
            ProductCategory::Accessories,
        ] {
            assert_eq!(product_repository(category).category(), category);
        }
    }
}
