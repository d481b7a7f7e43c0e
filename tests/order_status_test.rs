mod common;

use common::{TestApp, TEST_ACTOR};
use stockline::entities::order::OrderStatus;
use stockline::entities::production_task::ProductionTaskStatus;
use stockline::services::production::CreateProductionTaskRequest;
use stockline::ServiceError;

// Availability drives the status ladder one step per re-derivation:
// new -> confirmed -> ready while everything is reservable.
#[tokio::test]
async fn fully_available_order_climbs_to_ready() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Frame", 50).await;

    let order = app.order(&[(product.id, 30)]).await;
    assert_eq!(order.order.status, OrderStatus::Confirmed);

    let recalc = app
        .services
        .status_engine
        .recalculate_order(order.order.id)
        .await
        .unwrap();
    assert_eq!(recalc.derived, OrderStatus::Ready);
}

#[tokio::test]
async fn stock_loss_pushes_confirmed_order_to_in_production() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Frame", 50).await;

    let order = app.order(&[(product.id, 30)]).await;
    assert_eq!(order.order.status, OrderStatus::Confirmed);

    // The shelf count comes back 40 short. The order keeps its reservation
    // but can no longer be satisfied from stock.
    app.services
        .adjust_stock(TEST_ACTOR, product.id, -40, Some("stocktake".into()))
        .await
        .unwrap();

    let order = app.services.orders.get_order(order.order.id).await.unwrap();
    assert_eq!(order.order.status, OrderStatus::InProduction);
    assert_eq!(order.items[0].reserved_quantity, 30);
}

#[tokio::test]
async fn production_completion_restores_the_order() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Frame", 50).await;
    let order = app.order(&[(product.id, 30)]).await;

    app.services
        .adjust_stock(TEST_ACTOR, product.id, -40, None)
        .await
        .unwrap();

    let task = app
        .services
        .production
        .create_task(CreateProductionTaskRequest {
            product_id: product.id,
            requested_quantity: 40,
            order_id: Some(order.order.id),
        })
        .await
        .unwrap();

    app.services
        .production
        .update_task_status(TEST_ACTOR, task.id, ProductionTaskStatus::InProgress)
        .await
        .unwrap();
    app.services
        .production
        .update_task_status(TEST_ACTOR, task.id, ProductionTaskStatus::Completed)
        .await
        .unwrap();

    assert_eq!(app.stock(product.id).await.current_stock, 50);
    let order = app.services.orders.get_order(order.order.id).await.unwrap();
    assert_eq!(order.order.status, OrderStatus::Ready);
}

#[tokio::test]
async fn derived_statuses_cannot_be_set_by_hand() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Frame", 50).await;
    let order = app.order(&[(product.id, 10)]).await;

    let result = app
        .services
        .orders
        .update_order_status(TEST_ACTOR, order.order.id, OrderStatus::Ready, None)
        .await;
    assert!(matches!(result, Err(ServiceError::ValidationError(_))));
}

#[tokio::test]
async fn completed_orders_are_frozen() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Frame", 50).await;
    let order = app.order(&[(product.id, 10)]).await;

    app.services
        .status_engine
        .recalculate_order(order.order.id)
        .await
        .unwrap();
    app.services
        .orders
        .update_order_status(TEST_ACTOR, order.order.id, OrderStatus::Completed, None)
        .await
        .unwrap();

    let result = app
        .services
        .orders
        .update_order_status(TEST_ACTOR, order.order.id, OrderStatus::Cancelled, None)
        .await;
    assert!(matches!(result, Err(ServiceError::IrreversibleState(_))));
}

#[tokio::test]
async fn direct_completion_consumes_the_reservation() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Frame", 50).await;
    let order = app.order(&[(product.id, 10)]).await;

    app.services
        .status_engine
        .recalculate_order(order.order.id)
        .await
        .unwrap();
    app.services
        .orders
        .update_order_status(TEST_ACTOR, order.order.id, OrderStatus::Completed, None)
        .await
        .unwrap();

    let record = app.stock(product.id).await;
    assert_eq!(record.current_stock, 40);
    assert_eq!(record.reserved_stock, 0);
}

// The reservation went out with the goods at completion. Deleting the order
// afterwards must not hand those units back a second time.
#[tokio::test]
async fn deleting_a_completed_order_does_not_release_twice() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Frame", 50).await;
    let order = app.order(&[(product.id, 10)]).await;

    app.services
        .status_engine
        .recalculate_order(order.order.id)
        .await
        .unwrap();
    app.services
        .orders
        .update_order_status(TEST_ACTOR, order.order.id, OrderStatus::Completed, None)
        .await
        .unwrap();

    app.services
        .orders
        .delete_order(TEST_ACTOR, order.order.id)
        .await
        .unwrap();

    let record = app.stock(product.id).await;
    assert_eq!(record.current_stock, 40);
    assert_eq!(record.reserved_stock, 0);
}
