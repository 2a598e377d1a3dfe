//! Shared test harness: in-memory SQLite with the schema created from the
//! entities, and the full service graph wired over it.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend,
    EntityTrait, Schema, Set,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use fulfillment_ledger::{
    config::AppConfig,
    entities::{
        inventory_log, low_stock_alert, order, order_history, order_item,
        product_stock::{self, ProductCategory},
        refund, return_item, return_request, store_credit,
    },
    events::{Event, EventSender},
    services::payments::{NoopPaymentGateway, PaymentGateway},
    AppServices,
};

pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub services: AppServices,
    // Held open so event sends do not report a closed channel.
    _event_rx: mpsc::Receiver<Event>,
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        environment: "test".to_string(),
        log_level: "debug".to_string(),
        log_json: false,
        return_window_days: 30,
        stock_apply_retries: 5,
        refund_max_attempts: 3,
        low_stock_alerts_enabled: true,
        db_max_connections: 1,
        db_min_connections: 1,
        db_connect_timeout_secs: 5,
        db_idle_timeout_secs: 60,
    }
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_gateway(Arc::new(NoopPaymentGateway)).await
    }

    pub async fn with_gateway(gateway: Arc<dyn PaymentGateway>) -> Self {
        let mut opts = ConnectOptions::new("sqlite::memory:".to_string());
        // A single connection keeps every query on the same in-memory
        // database.
        opts.max_connections(1).min_connections(1);
        let db = Database::connect(opts).await.expect("connect sqlite");

        create_schema(&db).await;

        let db = Arc::new(db);
        let (event_tx, event_rx) = mpsc::channel(1024);
        let event_sender = EventSender::new(event_tx);

        let cfg = test_config();
        let services = AppServices::build(db.clone(), event_sender, gateway, &cfg);

        Self {
            db,
            services,
            _event_rx: event_rx,
        }
    }

    /// Seeds a stock row through the ledger so the opening balance lands in
    /// the audit log.
    pub async fn seed_stock(
        &self,
        category: ProductCategory,
        initial_stock: i32,
        threshold: i32,
    ) -> Uuid {
        let product_id = Uuid::new_v4();
        self.services
            .stock_ledger
            .create_product_stock(product_id, category, initial_stock, threshold, Uuid::new_v4())
            .await
            .expect("seed stock");
        product_id
    }

    /// Creates an order for one user with the given (product, category,
    /// quantity, unit price) lines.
    pub async fn create_order(
        &self,
        user_id: Uuid,
        shipping_cost: Decimal,
        lines: &[(Uuid, ProductCategory, i32, Decimal)],
    ) -> fulfillment_ledger::services::orders::OrderDetails {
        use fulfillment_ledger::services::orders::{CreateOrderItem, CreateOrderRequest};

        self.services
            .orders
            .create_order(CreateOrderRequest {
                user_id,
                shipping_cost,
                items: lines
                    .iter()
                    .map(|(product_id, category, quantity, price)| CreateOrderItem {
                        product_id: *product_id,
                        category: *category,
                        vendor_id: Uuid::new_v4(),
                        quantity: *quantity,
                        price: *price,
                    })
                    .collect(),
            })
            .await
            .expect("create order")
    }

    /// Confirms payment for an order at the given amount, reserving stock.
    pub async fn confirm_payment(&self, order_id: Uuid, amount: Decimal) -> order::Model {
        use fulfillment_ledger::services::payments::PaymentConfirmation;

        self.services
            .payments
            .handle_payment_confirmed(PaymentConfirmation {
                order_id,
                transaction_id: format!("txn-{}", order_id.simple()),
                amount,
            })
            .await
            .expect("confirm payment")
    }

    /// Walks a confirmed order through fulfilment to Delivered.
    pub async fn deliver_order(&self, order_id: Uuid, actor_id: Uuid) -> order::Model {
        use fulfillment_ledger::entities::order::OrderStatus;

        let mut updated = None;
        for status in [
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::InTransit,
            OrderStatus::Delivered,
        ] {
            updated = Some(
                self.services
                    .orders
                    .update_status(order_id, status, actor_id, None)
                    .await
                    .expect("advance order"),
            );
        }
        updated.expect("order advanced")
    }

    /// Rewrites an order's creation timestamp, for return-window tests.
    pub async fn backdate_order(&self, order_id: Uuid, created_at: DateTime<Utc>) {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .expect("query order")
            .expect("order exists");
        let mut active: order::ActiveModel = order.into();
        active.created_at = Set(created_at);
        active.update(&*self.db).await.expect("backdate order");
    }

    pub async fn current_stock(&self, product_id: Uuid, category: ProductCategory) -> i32 {
        self.services
            .stock_ledger
            .get_stock(product_id, category)
            .await
            .expect("get stock")
    }
}

async fn create_schema(db: &DatabaseConnection) {
    let schema = Schema::new(DbBackend::Sqlite);
    let backend = db.get_database_backend();

    let statements = [
        schema.create_table_from_entity(product_stock::Entity),
        schema.create_table_from_entity(inventory_log::Entity),
        schema.create_table_from_entity(low_stock_alert::Entity),
        schema.create_table_from_entity(order::Entity),
        schema.create_table_from_entity(order_item::Entity),
        schema.create_table_from_entity(order_history::Entity),
        schema.create_table_from_entity(return_request::Entity),
        schema.create_table_from_entity(return_item::Entity),
        schema.create_table_from_entity(refund::Entity),
        schema.create_table_from_entity(store_credit::Entity),
    ];

    for statement in statements {
        db.execute(backend.build(&statement))
            .await
            .expect("create table");
    }
}
