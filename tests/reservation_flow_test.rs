mod common;

use common::{TestApp, TEST_ACTOR};
use stockline::entities::order::OrderStatus;

// Two orders competing for one pool: the first keeps what it reserved, the
// second gets the remainder and picks up the freed units later.
#[tokio::test]
async fn partial_reservation_never_steals_from_earlier_orders() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Panel", 100).await;

    let order_a = app.order(&[(product.id, 60)]).await;
    assert_eq!(order_a.items[0].reserved_quantity, 60);
    assert_eq!(order_a.order.status, OrderStatus::Confirmed);

    let record = app.stock(product.id).await;
    assert_eq!(record.current_stock, 100);
    assert_eq!(record.reserved_stock, 60);
    assert_eq!(record.available(), 40);

    // B wants 50 but only 40 are unclaimed.
    let order_b = app.order(&[(product.id, 50)]).await;
    assert_eq!(order_b.items[0].reserved_quantity, 40);
    assert_eq!(order_b.order.status, OrderStatus::New);
    assert_eq!(app.stock(product.id).await.reserved_stock, 100);

    // Re-running allocation for B must not touch A's 60.
    app.services
        .reservations
        .reserve_for_order(order_b.order.id, TEST_ACTOR)
        .await
        .unwrap();
    let order_a = app.services.orders.get_order(order_a.order.id).await.unwrap();
    let order_b = app.services.orders.get_order(order_b.order.id).await.unwrap();
    assert_eq!(order_a.items[0].reserved_quantity, 60);
    assert_eq!(order_b.items[0].reserved_quantity, 40);

    // Cancelling A frees its units; a sync pass hands them to B.
    app.services
        .orders
        .update_order_status(TEST_ACTOR, order_a.order.id, OrderStatus::Cancelled, None)
        .await
        .unwrap();
    assert_eq!(app.stock(product.id).await.reserved_stock, 40);

    app.services
        .consistency
        .sync_reservations_with_orders(TEST_ACTOR)
        .await
        .unwrap();

    let order_b = app.services.orders.get_order(order_b.order.id).await.unwrap();
    assert_eq!(order_b.items[0].reserved_quantity, 50);
    assert_eq!(order_b.order.status, OrderStatus::Confirmed);

    let record = app.stock(product.id).await;
    assert_eq!(record.reserved_stock, 50);
    assert_eq!(record.available(), 50);
}

#[tokio::test]
async fn cancelling_an_order_releases_exactly_its_reservation() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Sheet", 30).await;

    let order_a = app.order(&[(product.id, 10)]).await;
    let _order_b = app.order(&[(product.id, 15)]).await;
    assert_eq!(app.stock(product.id).await.reserved_stock, 25);

    app.services
        .orders
        .update_order_status(TEST_ACTOR, order_a.order.id, OrderStatus::Cancelled, None)
        .await
        .unwrap();

    let record = app.stock(product.id).await;
    assert_eq!(record.reserved_stock, 15);
    assert_eq!(record.current_stock, 30);
}

#[tokio::test]
async fn deleting_an_order_releases_its_reservation() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Beam", 20).await;

    let order = app.order(&[(product.id, 8)]).await;
    assert_eq!(app.stock(product.id).await.reserved_stock, 8);

    app.services
        .orders
        .delete_order(TEST_ACTOR, order.order.id)
        .await
        .unwrap();

    assert_eq!(app.stock(product.id).await.reserved_stock, 0);
    assert!(app
        .services
        .orders
        .get_order(order.order.id)
        .await
        .is_err());
}

// The counter row is seeded by the migrations, so the very first order
// already takes the locked-update path and numbering starts at 1.
#[tokio::test]
async fn order_numbers_are_sequential_from_the_first_order() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Panel", 20).await;

    let first = app.order(&[(product.id, 5)]).await;
    let second = app.order(&[(product.id, 5)]).await;
    assert_eq!(first.order.order_number, 1);
    assert_eq!(second.order.order_number, 2);
}

#[tokio::test]
async fn adjusting_item_quantity_reallocates_its_reservation() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Rod", 50).await;

    let order = app.order(&[(product.id, 10)]).await;
    let item_id = order.items[0].id;

    let outcome = app
        .services
        .reservations
        .adjust_reservation(item_id, 4, TEST_ACTOR)
        .await
        .unwrap();
    assert_eq!(outcome.reserved, 4);
    assert_eq!(app.stock(product.id).await.reserved_stock, 4);

    let outcome = app
        .services
        .reservations
        .adjust_reservation(item_id, 25, TEST_ACTOR)
        .await
        .unwrap();
    assert_eq!(outcome.reserved, 25);
    assert_eq!(app.stock(product.id).await.reserved_stock, 25);
}
