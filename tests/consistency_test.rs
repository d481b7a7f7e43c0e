mod common;

use common::{TestApp, TEST_ACTOR};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use stockline::entities::stock_movement::{self, MovementType};
use stockline::entities::stock_record;
use stockline::services::consistency::StockHealth;
use stockline::services::cutting::CreateCuttingRequest;
use uuid::Uuid;

async fn corrupt_reserved(app: &TestApp, product_id: Uuid, value: i32) {
    let record = stock_record::Entity::find_by_id(product_id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    let mut active: stock_record::ActiveModel = record.into();
    active.reserved_stock = Set(value);
    active.update(&*app.db).await.unwrap();
}

// A reserved cache that disagrees with open orders is flagged, repaired
// from the orders, and the repair leaves an audit trail.
#[tokio::test]
async fn drifted_reserved_cache_is_flagged_and_repaired() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Gear", 100).await;
    app.order(&[(product.id, 25)]).await;

    corrupt_reserved(&app, product.id, 30).await;

    let report = app.services.consistency.validate_all_stock().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.valid, 0);
    let violation = &report.violations[0];
    assert_eq!(violation.health, StockHealth::InvalidData);
    assert_eq!(violation.reserved_stock, 30);
    assert_eq!(violation.reserved_from_orders, 25);

    let fix = app
        .services
        .consistency
        .fix_stock_inconsistencies(TEST_ACTOR)
        .await
        .unwrap();
    assert_eq!(fix.corrected.len(), 1);
    assert_eq!(fix.corrected[0].old_reserved, 30);
    assert_eq!(fix.corrected[0].new_reserved, 25);
    assert!(fix.errors.is_empty());

    assert_eq!(app.stock(product.id).await.reserved_stock, 25);

    let corrections = stock_movement::Entity::find()
        .filter(stock_movement::Column::ProductId.eq(product.id))
        .filter(stock_movement::Column::MovementType.eq(MovementType::SystemFix))
        .all(&*app.db)
        .await
        .unwrap();
    assert_eq!(corrections.len(), 1);
    assert_eq!(corrections[0].quantity, 5);
    assert_eq!(corrections[0].actor_id, TEST_ACTOR);

    let report = app.services.consistency.validate_all_stock().await.unwrap();
    assert!(report.violations.is_empty());
}

#[tokio::test]
async fn fix_is_a_no_op_on_healthy_records() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Gear", 100).await;
    app.order(&[(product.id, 25)]).await;

    let fix = app
        .services
        .consistency
        .fix_stock_inconsistencies(TEST_ACTOR)
        .await
        .unwrap();
    assert!(fix.corrected.is_empty());
    assert_eq!(app.stock(product.id).await.reserved_stock, 25);
}

// A live cut holds source units the order ledger knows nothing about. The
// validator must count them as legitimate, not repair them away.
#[tokio::test]
async fn live_cutting_reservations_are_not_drift() {
    let app = TestApp::new().await;
    let source = app.product_with_stock("Sheet X", 30).await;
    let target = app.product_with_stock("Sheet Y", 50).await;

    app.services
        .cutting
        .create_operation(
            TEST_ACTOR,
            CreateCuttingRequest {
                source_product_id: source.id,
                target_product_id: target.id,
                source_quantity: 5,
                target_quantity: 5,
                planned_date: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(app.stock(source.id).await.reserved_stock, 5);

    let report = app.services.consistency.validate_all_stock().await.unwrap();
    assert!(report.violations.is_empty());

    let stats = app.services.consistency.get_stock_statistics().await.unwrap();
    assert_eq!(stats.invalid_data, 0);
    assert_eq!(stats.normal, 2);

    let fix = app
        .services
        .consistency
        .fix_stock_inconsistencies(TEST_ACTOR)
        .await
        .unwrap();
    assert!(fix.corrected.is_empty());
    assert_eq!(app.stock(source.id).await.reserved_stock, 5);
}

#[tokio::test]
async fn sync_is_idempotent() {
    let app = TestApp::new().await;
    let product = app.product_with_stock("Gear", 40).await;
    app.order(&[(product.id, 30)]).await;
    let starved = app.order(&[(product.id, 30)]).await;
    assert_eq!(starved.items[0].reserved_quantity, 10);

    // More stock arrives, but nothing re-allocates by itself.
    app.services
        .adjust_stock(TEST_ACTOR, product.id, 50, None)
        .await
        .unwrap();

    let first = app
        .services
        .consistency
        .sync_reservations_with_orders(TEST_ACTOR)
        .await
        .unwrap();
    assert_eq!(first.orders_changed, 1);

    let starved = app
        .services
        .orders
        .get_order(starved.order.id)
        .await
        .unwrap();
    assert_eq!(starved.items[0].reserved_quantity, 30);

    let second = app
        .services
        .consistency
        .sync_reservations_with_orders(TEST_ACTOR)
        .await
        .unwrap();
    assert_eq!(second.orders_checked, 2);
    assert_eq!(second.orders_changed, 0);
}

#[tokio::test]
async fn statistics_bucket_every_health_state() {
    let app = TestApp::new().await;

    // available 50: normal.
    app.product_with_stock("Normal", 50).await;
    // available 5: low.
    app.product_with_stock("Low", 5).await;
    // available 2: critical.
    app.product_with_stock("Critical", 2).await;

    // Reserved 20 of 20, then 5 vanish: available -5, negative.
    let negative = app.product_with_stock("Negative", 20).await;
    app.order(&[(negative.id, 20)]).await;
    app.services
        .adjust_stock(TEST_ACTOR, negative.id, -5, None)
        .await
        .unwrap();

    // Cache corrupted by hand: invalid data.
    let invalid = app.product_with_stock("Invalid", 10).await;
    corrupt_reserved(&app, invalid.id, 4).await;

    let stats = app.services.consistency.get_stock_statistics().await.unwrap();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.normal, 1);
    assert_eq!(stats.low, 1);
    assert_eq!(stats.critical, 1);
    assert_eq!(stats.negative, 1);
    assert_eq!(stats.invalid_data, 1);
}
