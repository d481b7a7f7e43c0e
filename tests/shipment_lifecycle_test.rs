mod common;

use common::{TestApp, TEST_ACTOR};
use std::collections::HashMap;
use stockline::entities::order::OrderStatus;
use stockline::entities::shipment::ShipmentStatus;
use stockline::services::shipments::CreateShipmentRequest;
use stockline::ServiceError;
use uuid::Uuid;

async fn ready_order(app: &TestApp, product_id: Uuid, quantity: i32) -> Uuid {
    let order = app.order(&[(product_id, quantity)]).await;
    let recalc = app
        .services
        .status_engine
        .recalculate_order(order.order.id)
        .await
        .unwrap();
    assert_eq!(recalc.derived, OrderStatus::Ready);
    order.order.id
}

fn shipment_request(order_ids: Vec<Uuid>) -> CreateShipmentRequest {
    CreateShipmentRequest {
        order_ids,
        planned_date: None,
        transport_info: Some("truck 7".to_string()),
    }
}

#[tokio::test]
async fn shipment_groups_ready_orders_and_snapshots_reservations() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Crate", 100).await;
    let order_a = ready_order(&app, product.id, 30).await;
    let order_b = ready_order(&app, product.id, 20).await;

    let details = app
        .services
        .shipments
        .create_shipment(shipment_request(vec![order_a, order_b]))
        .await
        .unwrap();

    assert_eq!(details.shipment.shipment_number, 1);
    assert_eq!(details.shipment.status, ShipmentStatus::Pending);
    assert_eq!(details.items.len(), 2);
    assert_eq!(
        details.items.iter().map(|i| i.planned_quantity).sum::<i32>(),
        50
    );

    let order_a = app.services.orders.get_order(order_a).await.unwrap();
    assert_eq!(order_a.order.shipment_id, Some(details.shipment.id));
    // Attached orders stay ready until the shipment resolves.
    assert_eq!(order_a.order.status, OrderStatus::Ready);
}

#[tokio::test]
async fn only_unattached_ready_orders_can_be_shipped() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Crate", 100).await;

    // Confirmed but not ready.
    let pending = app.order(&[(product.id, 10)]).await;
    let result = app
        .services
        .shipments
        .create_shipment(shipment_request(vec![pending.order.id]))
        .await;
    assert!(matches!(result, Err(ServiceError::ValidationError(_))));

    let ready = ready_order(&app, product.id, 10).await;
    assert!(matches!(
        app.services
            .shipments
            .create_shipment(shipment_request(vec![ready, ready]))
            .await,
        Err(ServiceError::ValidationError(_))
    ));
    assert!(matches!(
        app.services
            .shipments
            .create_shipment(shipment_request(vec![]))
            .await,
        Err(ServiceError::ValidationError(_))
    ));

    app.services
        .shipments
        .create_shipment(shipment_request(vec![ready]))
        .await
        .unwrap();
    // Already attached now.
    let result = app
        .services
        .shipments
        .create_shipment(shipment_request(vec![ready]))
        .await;
    assert!(matches!(result, Err(ServiceError::ValidationError(_))));
}

#[tokio::test]
async fn completion_ships_goods_and_completes_orders() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Crate", 100).await;
    let order_a = ready_order(&app, product.id, 30).await;
    let order_b = ready_order(&app, product.id, 20).await;

    let details = app
        .services
        .shipments
        .create_shipment(shipment_request(vec![order_a, order_b]))
        .await
        .unwrap();

    // Order A's item goes out two units short of plan.
    let item_a = details
        .items
        .iter()
        .find(|i| i.order_id == order_a)
        .unwrap();
    let mut actuals = HashMap::new();
    actuals.insert(item_a.id, 28);

    let completed = app
        .services
        .shipments
        .complete_shipment(TEST_ACTOR, details.shipment.id, actuals)
        .await
        .unwrap();
    assert_eq!(completed.shipment.status, ShipmentStatus::Completed);
    assert!(completed.shipment.completed_at.is_some());
    assert!(completed
        .items
        .iter()
        .all(|i| i.actual_quantity.is_some()));

    // 28 + 20 units left both pools.
    let record = app.stock(product.id).await;
    assert_eq!(record.current_stock, 52);
    assert_eq!(record.reserved_stock, 2);

    for order_id in [order_a, order_b] {
        let order = app.services.orders.get_order(order_id).await.unwrap();
        assert_eq!(order.order.status, OrderStatus::Completed);
        // The items' reservations are spent, not merely superseded.
        assert_eq!(order.items[0].reserved_quantity, 0);
    }

    // The 2-unit short-ship left the reserved cache ahead of open orders;
    // the validator is the one to notice and repair it.
    let report = app.services.consistency.validate_all_stock().await.unwrap();
    assert_eq!(report.violations.len(), 1);
    let fix = app
        .services
        .consistency
        .fix_stock_inconsistencies(TEST_ACTOR)
        .await
        .unwrap();
    assert_eq!(fix.corrected.len(), 1);
    assert_eq!(app.stock(product.id).await.reserved_stock, 0);
}

// An attached order's reservation is a frozen snapshot. When stock runs out
// underneath a pending shipment, neither the sync pass nor a direct
// re-allocation may shrink it; completion still ships the planned units.
#[tokio::test]
async fn attached_orders_keep_their_snapshot_through_a_sync() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Crate", 20).await;
    let order_id = ready_order(&app, product.id, 20).await;

    let details = app
        .services
        .shipments
        .create_shipment(shipment_request(vec![order_id]))
        .await
        .unwrap();

    // The shelf empties while the shipment is pending.
    app.services
        .adjust_stock(TEST_ACTOR, product.id, -20, Some("stocktake".into()))
        .await
        .unwrap();

    let sync = app
        .services
        .consistency
        .sync_reservations_with_orders(TEST_ACTOR)
        .await
        .unwrap();
    assert_eq!(sync.orders_changed, 0);

    let order = app.services.orders.get_order(order_id).await.unwrap();
    assert_eq!(order.items[0].reserved_quantity, 20);

    assert!(matches!(
        app.services
            .reservations
            .reserve_for_order(order_id, TEST_ACTOR)
            .await,
        Err(ServiceError::ValidationError(_))
    ));

    app.services
        .shipments
        .complete_shipment(TEST_ACTOR, details.shipment.id, HashMap::new())
        .await
        .unwrap();
    let record = app.stock(product.id).await;
    assert_eq!(record.current_stock, -20);
    assert_eq!(record.reserved_stock, 0);
}

#[tokio::test]
async fn completion_rejects_unknown_actual_quantity_keys() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Crate", 100).await;
    let order_id = ready_order(&app, product.id, 10).await;

    let details = app
        .services
        .shipments
        .create_shipment(shipment_request(vec![order_id]))
        .await
        .unwrap();

    let mut actuals = HashMap::new();
    actuals.insert(Uuid::new_v4(), 5);
    let result = app
        .services
        .shipments
        .complete_shipment(TEST_ACTOR, details.shipment.id, actuals)
        .await;
    assert!(matches!(result, Err(ServiceError::ValidationError(_))));

    // Nothing shipped, nothing completed.
    let details = app
        .services
        .shipments
        .get_shipment(details.shipment.id)
        .await
        .unwrap();
    assert_eq!(details.shipment.status, ShipmentStatus::Pending);
    assert_eq!(app.stock(product.id).await.reserved_stock, 10);
}

#[tokio::test]
async fn cancellation_detaches_orders_and_keeps_reservations() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Crate", 100).await;
    let order_id = ready_order(&app, product.id, 30).await;

    let details = app
        .services
        .shipments
        .create_shipment(shipment_request(vec![order_id]))
        .await
        .unwrap();
    app.services
        .shipments
        .cancel_shipment(details.shipment.id)
        .await
        .unwrap();

    let order = app.services.orders.get_order(order_id).await.unwrap();
    assert_eq!(order.order.shipment_id, None);
    assert_eq!(order.order.status, OrderStatus::Ready);
    assert_eq!(order.items[0].reserved_quantity, 30);
    assert_eq!(app.stock(product.id).await.reserved_stock, 30);

    // Detached again, the order can join a new shipment.
    app.services
        .shipments
        .create_shipment(shipment_request(vec![order_id]))
        .await
        .unwrap();
}

#[tokio::test]
async fn terminal_shipments_are_frozen() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Crate", 100).await;
    let order_id = ready_order(&app, product.id, 10).await;

    let details = app
        .services
        .shipments
        .create_shipment(shipment_request(vec![order_id]))
        .await
        .unwrap();
    app.services
        .shipments
        .complete_shipment(TEST_ACTOR, details.shipment.id, HashMap::new())
        .await
        .unwrap();

    assert!(matches!(
        app.services
            .shipments
            .cancel_shipment(details.shipment.id)
            .await,
        Err(ServiceError::IrreversibleState(_))
    ));
    assert!(matches!(
        app.services
            .shipments
            .complete_shipment(TEST_ACTOR, details.shipment.id, HashMap::new())
            .await,
        Err(ServiceError::IrreversibleState(_))
    ));
}

#[tokio::test]
async fn paused_shipments_resume_but_cannot_complete() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Crate", 100).await;
    let order_id = ready_order(&app, product.id, 10).await;

    let details = app
        .services
        .shipments
        .create_shipment(shipment_request(vec![order_id]))
        .await
        .unwrap();

    let paused = app
        .services
        .shipments
        .pause_shipment(details.shipment.id)
        .await
        .unwrap();
    assert_eq!(paused.shipment.status, ShipmentStatus::Paused);

    assert!(matches!(
        app.services
            .shipments
            .complete_shipment(TEST_ACTOR, details.shipment.id, HashMap::new())
            .await,
        Err(ServiceError::ValidationError(_))
    ));

    let resumed = app
        .services
        .shipments
        .resume_shipment(details.shipment.id)
        .await
        .unwrap();
    assert_eq!(resumed.shipment.status, ShipmentStatus::Pending);
}
