//! Fulfillment Ledger Library
//!
//! Order-fulfillment ledger for a multi-vendor marketplace: the order
//! lifecycle state machine, the stock reservation/release ledger, the
//! proportional refund calculator, and the post-delivery return workflow.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod notifications;
pub mod repositories;
pub mod services;

use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub services: AppServices,
}

/// The wired service graph shared by every inbound surface.
#[derive(Clone)]
pub struct AppServices {
    pub stock_ledger: Arc<services::stock_ledger::StockLedgerService>,
    pub orders: Arc<services::orders::OrderService>,
    pub reservations: Arc<services::reservations::ReservationService>,
    pub cancellations: Arc<services::cancellations::CancellationService>,
    pub returns: Arc<services::returns::ReturnService>,
    pub store_credits: Arc<services::store_credits::StoreCreditService>,
    pub payments: Arc<services::payments::PaymentService>,
    pub shipments: Arc<services::shipments::ShipmentService>,
}

impl AppServices {
    /// Builds the service graph over one database pool and event channel.
    pub fn build(
        db: Arc<DatabaseConnection>,
        event_sender: events::EventSender,
        gateway: Arc<dyn services::payments::PaymentGateway>,
        cfg: &config::AppConfig,
    ) -> Self {
        let stock_ledger = Arc::new(
            services::stock_ledger::StockLedgerService::new(db.clone(), event_sender.clone())
                .with_settings(cfg.stock_apply_retries, cfg.low_stock_alerts_enabled),
        );
        let reservations = Arc::new(services::reservations::ReservationService::new(
            db.clone(),
            stock_ledger.clone(),
        ));
        let store_credits = Arc::new(services::store_credits::StoreCreditService::new(
            db.clone(),
            event_sender.clone(),
        ));

        Self {
            orders: Arc::new(services::orders::OrderService::new(
                db.clone(),
                event_sender.clone(),
            )),
            cancellations: Arc::new(services::cancellations::CancellationService::new(
                db.clone(),
                event_sender.clone(),
                reservations.clone(),
                gateway.clone(),
                cfg.refund_max_attempts,
            )),
            returns: Arc::new(services::returns::ReturnService::new(
                db.clone(),
                event_sender.clone(),
                stock_ledger.clone(),
                store_credits.clone(),
                gateway,
                cfg.return_window_days,
                cfg.refund_max_attempts,
            )),
            payments: Arc::new(services::payments::PaymentService::new(
                db.clone(),
                event_sender.clone(),
                reservations.clone(),
            )),
            shipments: Arc::new(services::shipments::ShipmentService::new(
                db,
                event_sender,
            )),
            stock_ledger,
            reservations,
            store_credits,
        }
    }
}

// Common query parameters for list endpoints
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_page() -> u64 {
    1
}
fn default_limit() -> u64 {
    20
}

// Common response wrappers
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize)]
pub struct ResponseMeta {
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta {
                timestamp: Utc::now().to_rfc3339(),
            }),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
            errors: None,
            meta: Some(ResponseMeta {
                timestamp: Utc::now().to_rfc3339(),
            }),
        }
    }
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, total: u64, page: u64, limit: u64) -> Self {
        let total_pages = if limit == 0 { 0 } else { total.div_ceil(limit) };
        Self {
            items,
            total,
            page,
            limit,
            total_pages,
        }
    }
}
