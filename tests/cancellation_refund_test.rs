mod common;

use assert_matches::assert_matches;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

use fulfillment_ledger::{
    entities::order::{OrderStatus, PaymentStatus},
    entities::order_item::OrderItemStatus,
    entities::product_stock::ProductCategory,
    entities::refund::{self, Entity as RefundEntity, RefundStatus},
    errors::ServiceError,
};

use common::TestApp;

/// Builds the order from the refund-math worked example: amount 100,
/// shipping 20, items priced 30 and 70 (qty 1 each), payment captured.
async fn worked_example(app: &TestApp, user: Uuid) -> (Uuid, Uuid, Uuid) {
    let cheap = app.seed_stock(ProductCategory::Apparel, 10, 1).await;
    let pricey = app.seed_stock(ProductCategory::Footwear, 10, 1).await;

    let details = app
        .create_order(
            user,
            dec!(20),
            &[
                (cheap, ProductCategory::Apparel, 1, dec!(30)),
                (pricey, ProductCategory::Footwear, 1, dec!(70)),
            ],
        )
        .await;
    app.confirm_payment(details.order.id, dec!(120)).await;

    let cheap_item = details
        .items
        .iter()
        .find(|i| i.product_id == cheap)
        .unwrap()
        .id;

    (details.order.id, cheap_item, cheap)
}

#[tokio::test]
async fn single_item_cancellation_allocates_shipping_proportionally() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let (order_id, cheap_item, cheap_product) = worked_example(&app, user).await;

    let outcome = app
        .services
        .cancellations
        .cancel_item(order_id, cheap_item, user, "Wrong size".to_string())
        .await
        .expect("cancel item");

    // refund = 30 + round2(30/100 * 20) = 36.00
    assert_eq!(outcome.refund_amount, Some(dec!(36.00)));
    assert_eq!(outcome.shipping_refund, dec!(6.00));
    assert_eq!(outcome.order.amount, dec!(64.00));
    assert_eq!(outcome.order.shipping_cost, dec!(14.00));
    assert_eq!(outcome.order.status, OrderStatus::Confirmed);
    assert_eq!(outcome.order.payment_status, PaymentStatus::PartiallyRefunded);

    // The cancelled item's stock went back.
    assert_eq!(
        app.current_stock(cheap_product, ProductCategory::Apparel).await,
        10
    );

    // History carries the dollar breakdown.
    let history = app.services.orders.list_history(order_id).await.unwrap();
    let breakdown = history
        .iter()
        .filter_map(|h| h.reason.as_deref())
        .find(|r| r.contains("refund"))
        .expect("breakdown entry");
    assert!(breakdown.contains("36.00"));
    assert!(breakdown.contains("6.00"));
}

#[tokio::test]
async fn cancelling_the_last_item_closes_the_order() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let (order_id, cheap_item, _) = worked_example(&app, user).await;

    app.services
        .cancellations
        .cancel_item(order_id, cheap_item, user, "Wrong size".to_string())
        .await
        .expect("cancel first item");

    let details = app.services.orders.get_order(order_id).await.unwrap();
    let remaining_item = details
        .items
        .iter()
        .find(|i| i.status == OrderItemStatus::Pending)
        .expect("one item left");

    let outcome = app
        .services
        .cancellations
        .cancel_item(order_id, remaining_item.id, user, "Cancel the rest".to_string())
        .await
        .expect("cancel last item");

    // remaining shipping (14.00) all belongs to the last item.
    assert_eq!(outcome.shipping_refund, dec!(14.00));
    assert_eq!(outcome.refund_amount, Some(dec!(84.00)));
    assert_eq!(outcome.order.status, OrderStatus::Cancelled);
    assert_eq!(outcome.order.payment_status, PaymentStatus::Refunded);
    assert_eq!(outcome.order.shipping_cost, dec!(0.00));
}

#[tokio::test]
async fn cancelling_an_item_twice_is_already_processed() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let (order_id, cheap_item, _) = worked_example(&app, user).await;

    app.services
        .cancellations
        .cancel_item(order_id, cheap_item, user, "Wrong size".to_string())
        .await
        .expect("cancel item");

    let result = app
        .services
        .cancellations
        .cancel_item(order_id, cheap_item, user, "Again".to_string())
        .await;

    assert_matches!(result, Err(ServiceError::AlreadyProcessed(_)));
}

#[tokio::test]
async fn unpaid_orders_reduce_amounts_without_issuing_refunds() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let product = app.seed_stock(ProductCategory::Accessories, 5, 1).await;

    let details = app
        .create_order(
            user,
            dec!(10),
            &[
                (product, ProductCategory::Accessories, 1, dec!(25)),
                (product, ProductCategory::Accessories, 1, dec!(75)),
            ],
        )
        .await;
    let item = details.items[0].id;

    let outcome = app
        .services
        .cancellations
        .cancel_item(details.order.id, item, user, "Not needed".to_string())
        .await
        .expect("cancel item");

    assert_eq!(outcome.refund_amount, None);
    assert_eq!(outcome.refund_id, None);
    assert_eq!(outcome.order.amount, dec!(72.50));
    assert_eq!(outcome.order.shipping_cost, dec!(7.50));
    assert_eq!(outcome.order.payment_status, PaymentStatus::Pending);

    // Nothing was reserved, so nothing was released.
    assert_eq!(
        app.current_stock(product, ProductCategory::Accessories).await,
        5
    );
}

#[tokio::test]
async fn whole_order_cancellation_refunds_the_captured_transaction_amount() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let (order_id, _, _) = worked_example(&app, user).await;

    let outcome = app
        .services
        .cancellations
        .cancel_order(order_id, user, "Ordered by accident".to_string())
        .await
        .expect("cancel order");

    assert_eq!(outcome.refund_amount, Some(dec!(120)));
    assert_eq!(outcome.order.status, OrderStatus::Cancelled);
    assert_eq!(outcome.order.payment_status, PaymentStatus::Refunded);
    assert!(outcome.order.cancelled_at.is_some());

    let refund = RefundEntity::find()
        .filter(refund::Column::OrderId.eq(order_id))
        .one(&*app.db)
        .await
        .expect("query refund")
        .expect("refund row");
    assert_eq!(refund.status, RefundStatus::Completed);
    assert_eq!(refund.amount, dec!(120));
}

#[tokio::test]
async fn shipped_orders_are_pointed_at_the_returns_flow() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let product = app.seed_stock(ProductCategory::Apparel, 5, 1).await;

    let details = app
        .create_order(
            user,
            dec!(0),
            &[(product, ProductCategory::Apparel, 1, dec!(50))],
        )
        .await;
    let order_id = details.order.id;

    app.confirm_payment(order_id, dec!(50)).await;
    app.services
        .orders
        .update_status(order_id, OrderStatus::Processing, user, None)
        .await
        .unwrap();
    app.services
        .orders
        .update_status(order_id, OrderStatus::Shipped, user, None)
        .await
        .unwrap();

    let result = app
        .services
        .cancellations
        .cancel_order(order_id, user, "Too late".to_string())
        .await;

    let err = result.expect_err("cancellation must be blocked");
    assert_matches!(err, ServiceError::InvalidOperation(_));
    assert!(err.to_string().contains("return"));
}

#[tokio::test]
async fn cancellation_requires_the_order_owner() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let (order_id, cheap_item, _) = worked_example(&app, user).await;

    let stranger = Uuid::new_v4();
    let result = app
        .services
        .cancellations
        .cancel_item(order_id, cheap_item, stranger, "Not mine".to_string())
        .await;

    assert_matches!(result, Err(ServiceError::Unauthorized(_)));
}
