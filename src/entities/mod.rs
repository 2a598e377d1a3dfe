//! SeaORM entities for the fulfillment ledger.

pub mod inventory_log;
pub mod low_stock_alert;
pub mod order;
pub mod order_history;
pub mod order_item;
pub mod product_stock;
pub mod refund;
pub mod return_item;
pub mod return_request;
pub mod store_credit;
