mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use uuid::Uuid;

use fulfillment_ledger::{
    entities::order::{OrderStatus, PaymentStatus},
    entities::product_stock::ProductCategory,
    entities::refund::RefundStatus,
    entities::return_request::{RefundMethod, ReturnStatus},
    entities::store_credit::Entity as StoreCreditEntity,
    errors::ServiceError,
    services::payments::PaymentGateway,
    services::returns::{CreateReturnRequest, ReturnDecision, ReturnItemRequest},
};

use common::TestApp;

mockall::mock! {
    pub Gateway {}

    #[async_trait::async_trait]
    impl PaymentGateway for Gateway {
        #[mockall::concretize]
        async fn refund(
            &self,
            order_id: Uuid,
            transaction_id: Option<&str>,
            amount: Decimal,
        ) -> Result<(), String>;
    }
}

/// Delivers a paid two-unit order and returns (order_id, item_id, product).
async fn delivered_order(app: &TestApp, user: Uuid) -> (Uuid, Uuid, Uuid) {
    let product = app.seed_stock(ProductCategory::Apparel, 10, 1).await;
    let details = app
        .create_order(
            user,
            dec!(5),
            &[(product, ProductCategory::Apparel, 2, dec!(45))],
        )
        .await;
    app.confirm_payment(details.order.id, dec!(95)).await;
    app.deliver_order(details.order.id, user).await;
    (details.order.id, details.items[0].id, product)
}

fn return_request(
    order_id: Uuid,
    user_id: Uuid,
    item_id: Uuid,
    quantity: i32,
    method: RefundMethod,
) -> CreateReturnRequest {
    CreateReturnRequest {
        order_id,
        user_id,
        reason: "Did not fit".to_string(),
        refund_method: method,
        items: vec![ReturnItemRequest {
            order_item_id: item_id,
            quantity,
        }],
    }
}

#[tokio::test]
async fn return_requests_snapshot_the_item_value_without_shipping() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let (order_id, item_id, _) = delivered_order(&app, user).await;

    let details = app
        .services
        .returns
        .create_return_request(return_request(
            order_id,
            user,
            item_id,
            2,
            RefundMethod::OriginalPayment,
        ))
        .await
        .expect("create return");

    assert_eq!(details.request.status, ReturnStatus::Requested);
    // 2 × 45, no shipping allocation at request time.
    assert_eq!(details.request.refund_amount, dec!(90));
    assert_eq!(details.items.len(), 1);
    assert_eq!(details.items[0].quantity, 2);
}

#[tokio::test]
async fn returns_are_blocked_before_delivery() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let product = app.seed_stock(ProductCategory::Footwear, 5, 1).await;
    let details = app
        .create_order(
            user,
            dec!(0),
            &[(product, ProductCategory::Footwear, 1, dec!(80))],
        )
        .await;
    app.confirm_payment(details.order.id, dec!(80)).await;

    let result = app
        .services
        .returns
        .create_return_request(return_request(
            details.order.id,
            user,
            details.items[0].id,
            1,
            RefundMethod::OriginalPayment,
        ))
        .await;

    assert_matches!(result, Err(ServiceError::InvalidOperation(_)));
}

#[tokio::test]
async fn the_return_window_closes_after_thirty_days() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();

    // Day 31: expired.
    let (order_id, item_id, _) = delivered_order(&app, user).await;
    app.backdate_order(order_id, Utc::now() - Duration::days(31))
        .await;
    let result = app
        .services
        .returns
        .create_return_request(return_request(
            order_id,
            user,
            item_id,
            1,
            RefundMethod::OriginalPayment,
        ))
        .await;
    assert_matches!(result, Err(ServiceError::WindowExpired(_)));

    // Day 30: still open.
    let (order_id, item_id, _) = delivered_order(&app, user).await;
    app.backdate_order(order_id, Utc::now() - Duration::days(30) + Duration::hours(1))
        .await;
    let details = app
        .services
        .returns
        .create_return_request(return_request(
            order_id,
            user,
            item_id,
            1,
            RefundMethod::OriginalPayment,
        ))
        .await
        .expect("day-30 return accepted");
    assert_eq!(details.request.status, ReturnStatus::Requested);
}

#[tokio::test]
async fn a_return_can_be_decided_exactly_once() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let approver = Uuid::new_v4();
    let (order_id, item_id, _) = delivered_order(&app, user).await;

    let details = app
        .services
        .returns
        .create_return_request(return_request(
            order_id,
            user,
            item_id,
            1,
            RefundMethod::OriginalPayment,
        ))
        .await
        .unwrap();
    let return_id = details.request.id;

    let approved = app
        .services
        .returns
        .process_return_request(return_id, ReturnDecision::Approve { approver })
        .await
        .expect("approve");
    assert_eq!(approved.status, ReturnStatus::Approved);
    assert_eq!(approved.approved_by, Some(approver));

    let result = app
        .services
        .returns
        .process_return_request(
            return_id,
            ReturnDecision::Reject {
                approver,
                reason: "changed my mind".to_string(),
            },
        )
        .await;
    assert_matches!(result, Err(ServiceError::AlreadyProcessed(_)));
}

#[tokio::test]
async fn rejected_returns_keep_the_rejection_reason() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let approver = Uuid::new_v4();
    let (order_id, item_id, _) = delivered_order(&app, user).await;

    let details = app
        .services
        .returns
        .create_return_request(return_request(
            order_id,
            user,
            item_id,
            1,
            RefundMethod::OriginalPayment,
        ))
        .await
        .unwrap();

    let rejected = app
        .services
        .returns
        .process_return_request(
            details.request.id,
            ReturnDecision::Reject {
                approver,
                reason: "Outside policy".to_string(),
            },
        )
        .await
        .expect("reject");

    assert_eq!(rejected.status, ReturnStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("Outside policy"));
}

#[tokio::test]
async fn receiving_items_restocks_with_the_original_item_category() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let approver = Uuid::new_v4();
    let (order_id, item_id, product) = delivered_order(&app, user).await;

    let details = app
        .services
        .returns
        .create_return_request(return_request(
            order_id,
            user,
            item_id,
            2,
            RefundMethod::OriginalPayment,
        ))
        .await
        .unwrap();
    let return_id = details.request.id;

    // Receiving before approval is rejected.
    let premature = app
        .services
        .returns
        .process_returned_items(return_id, approver)
        .await;
    assert_matches!(premature, Err(ServiceError::InvalidOperation(_)));

    app.services
        .returns
        .process_return_request(return_id, ReturnDecision::Approve { approver })
        .await
        .unwrap();

    let received = app
        .services
        .returns
        .process_returned_items(return_id, approver)
        .await
        .expect("receive items");
    assert_eq!(received.status, ReturnStatus::Received);

    // 10 seeded, 2 reserved at payment, 2 restocked on receipt. The
    // category came from the original order item.
    assert_eq!(app.current_stock(product, ProductCategory::Apparel).await, 10);

    let again = app
        .services
        .returns
        .process_returned_items(return_id, approver)
        .await;
    assert_matches!(again, Err(ServiceError::AlreadyProcessed(_)));
}

#[tokio::test]
async fn original_payment_refund_completes_the_return() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let approver = Uuid::new_v4();
    let (order_id, item_id, _) = delivered_order(&app, user).await;

    // Close out the order, then send everything back.
    app.services
        .orders
        .update_status(order_id, OrderStatus::Completed, user, None)
        .await
        .unwrap();

    let details = app
        .services
        .returns
        .create_return_request(return_request(
            order_id,
            user,
            item_id,
            2,
            RefundMethod::OriginalPayment,
        ))
        .await
        .unwrap();
    let return_id = details.request.id;

    app.services
        .returns
        .process_return_request(return_id, ReturnDecision::Approve { approver })
        .await
        .unwrap();
    app.services
        .returns
        .process_returned_items(return_id, approver)
        .await
        .unwrap();

    // Fully returned completed order has moved to Returned.
    let order = app.services.orders.get_order(order_id).await.unwrap().order;
    assert_eq!(order.status, OrderStatus::Returned);

    let outcome = app
        .services
        .returns
        .issue_refund(return_id, approver)
        .await
        .expect("issue refund");

    assert_eq!(outcome.refund.status, RefundStatus::Completed);
    assert_eq!(outcome.refund.amount, dec!(90));
    assert_eq!(outcome.return_request.status, ReturnStatus::Refunded);

    let order = app.services.orders.get_order(order_id).await.unwrap().order;
    assert_eq!(order.status, OrderStatus::Refunded);

    // Refunding the same return again is rejected.
    let again = app.services.returns.issue_refund(return_id, approver).await;
    assert_matches!(again, Err(ServiceError::AlreadyProcessed(_)));
}

#[tokio::test]
async fn store_credit_refunds_credit_the_user_instead_of_the_gateway() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let approver = Uuid::new_v4();
    let (order_id, item_id, _) = delivered_order(&app, user).await;

    let details = app
        .services
        .returns
        .create_return_request(return_request(
            order_id,
            user,
            item_id,
            1,
            RefundMethod::StoreCredit,
        ))
        .await
        .unwrap();
    let return_id = details.request.id;

    app.services
        .returns
        .process_return_request(return_id, ReturnDecision::Approve { approver })
        .await
        .unwrap();
    app.services
        .returns
        .process_returned_items(return_id, approver)
        .await
        .unwrap();

    let outcome = app
        .services
        .returns
        .issue_refund(return_id, approver)
        .await
        .expect("issue refund");

    assert_eq!(outcome.refund.status, RefundStatus::Completed);
    assert_eq!(outcome.return_request.status, ReturnStatus::Refunded);

    let balance = app
        .services
        .store_credits
        .available_balance(user)
        .await
        .expect("balance");
    assert_eq!(balance, dec!(45));

    // Payment status is untouched by a store-credit refund.
    let order = app.services.orders.get_order(order_id).await.unwrap().order;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
}

#[tokio::test]
async fn refunds_park_as_failed_once_gateway_attempts_are_exhausted() {
    let mut gateway = MockGateway::new();
    // Three configured attempts, all failing.
    gateway
        .expect_refund()
        .times(3)
        .returning(|_, _, _| Err("gateway unavailable".to_string()));

    let app = TestApp::with_gateway(Arc::new(gateway)).await;
    let user = Uuid::new_v4();
    let approver = Uuid::new_v4();
    let (order_id, item_id, _) = delivered_order(&app, user).await;

    let details = app
        .services
        .returns
        .create_return_request(return_request(
            order_id,
            user,
            item_id,
            1,
            RefundMethod::OriginalPayment,
        ))
        .await
        .unwrap();
    let return_id = details.request.id;

    app.services
        .returns
        .process_return_request(return_id, ReturnDecision::Approve { approver })
        .await
        .unwrap();
    app.services
        .returns
        .process_returned_items(return_id, approver)
        .await
        .unwrap();

    let outcome = app
        .services
        .returns
        .issue_refund(return_id, approver)
        .await
        .expect("refund surfaces as failed, not as an error");

    assert_eq!(outcome.refund.status, RefundStatus::Failed);
    assert_eq!(outcome.refund.attempts, 3);
    assert_eq!(
        outcome.refund.last_error.as_deref(),
        Some("gateway unavailable")
    );
    // The return stays Received so the refund can be retried later.
    assert_eq!(outcome.return_request.status, ReturnStatus::Received);
}

#[tokio::test]
async fn store_credits_draw_down_oldest_first() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();

    let first = app
        .services
        .store_credits
        .issue(user, dec!(10), None)
        .await
        .expect("issue first");
    let second = app
        .services
        .store_credits
        .issue(user, dec!(20), None)
        .await
        .expect("issue second");

    let draws = app
        .services
        .store_credits
        .draw_down(user, dec!(15))
        .await
        .expect("draw down");

    // Oldest credit drains completely before the newer one is touched.
    assert_eq!(draws.len(), 2);
    assert_eq!(draws[0].credit_id, first.id);
    assert_eq!(draws[0].drawn, dec!(10));
    assert_eq!(draws[1].credit_id, second.id);
    assert_eq!(draws[1].drawn, dec!(5));

    let balance = app
        .services
        .store_credits
        .available_balance(user)
        .await
        .expect("balance");
    assert_eq!(balance, dec!(15));

    let over = app.services.store_credits.draw_down(user, dec!(100)).await;
    assert_matches!(over, Err(ServiceError::InvalidOperation(_)));

    let credits = StoreCreditEntity::find().all(&*app.db).await.unwrap();
    assert!(credits.iter().all(|c| c.balance >= Decimal::ZERO));
}
