mod common;

use common::{TestApp, TEST_ACTOR};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use stockline::entities::product::{self, Grade};
use stockline::entities::stock_movement::{self, MovementType};
use stockline::services::cutting::{CreateCuttingRequest, CuttingOutcome};
use stockline::ServiceError;
use uuid::Uuid;

fn cut_request(source: Uuid, target: Uuid, source_qty: i32, target_qty: i32) -> CreateCuttingRequest {
    CreateCuttingRequest {
        source_product_id: source,
        target_product_id: target,
        source_quantity: source_qty,
        target_quantity: target_qty,
        planned_date: None,
    }
}

// Ten source units become 7 target, 2 second-grade and 1 defect. Every unit
// is accounted for and the second-grade variant appears on first use.
#[tokio::test]
async fn completed_cut_distributes_units_and_creates_the_variant() {
    let app = TestApp::new().await;
    let source = app.product_with_stock("Plate X", 10).await;
    let target = app.product_with_stock("Plate Y", 0).await;

    let operation = app
        .services
        .cutting
        .create_operation(TEST_ACTOR, cut_request(source.id, target.id, 10, 8))
        .await
        .unwrap();
    assert_eq!(operation.waste_quantity, 2);

    // Starting the cut claims the whole source quantity.
    let record = app.stock(source.id).await;
    assert_eq!(record.reserved_stock, 10);
    assert_eq!(record.available(), 0);

    app.services
        .cutting
        .complete_operation(
            TEST_ACTOR,
            operation.id,
            CuttingOutcome {
                target_quantity: 7,
                second_grade_quantity: 2,
                defect_quantity: 1,
            },
        )
        .await
        .unwrap();

    let source_record = app.stock(source.id).await;
    assert_eq!(source_record.current_stock, 0);
    assert_eq!(source_record.reserved_stock, 0);
    assert_eq!(app.stock(target.id).await.current_stock, 7);

    let variant = product::Entity::find()
        .filter(product::Column::VariantOfId.eq(target.id))
        .filter(product::Column::Grade.eq(Grade::Second))
        .one(&*app.db)
        .await
        .unwrap()
        .expect("second-grade variant created");
    assert_eq!(variant.sku.as_deref(), Some("SKU-PLATE-Y-2G"));
    assert_eq!(app.stock(variant.id).await.current_stock, 2);

    // The defect is audit-only: a movement, no stock.
    let defects = stock_movement::Entity::find()
        .filter(stock_movement::Column::ProductId.eq(target.id))
        .filter(stock_movement::Column::MovementType.eq(MovementType::CuttingDefect))
        .all(&*app.db)
        .await
        .unwrap();
    assert_eq!(defects.len(), 1);
    assert_eq!(defects[0].quantity, -1);

    // 7 + 2 + 1 accounts for all 10 source units: no variance row.
    let variances = stock_movement::Entity::find()
        .filter(stock_movement::Column::MovementType.eq(MovementType::CuttingVariance))
        .all(&*app.db)
        .await
        .unwrap();
    assert!(variances.is_empty());
}

#[tokio::test]
async fn unaccounted_units_leave_a_variance_trail() {
    let app = TestApp::new().await;
    let source = app.product_with_stock("Bar X", 10).await;
    let target = app.product_with_stock("Bar Y", 0).await;

    let operation = app
        .services
        .cutting
        .create_operation(TEST_ACTOR, cut_request(source.id, target.id, 10, 8))
        .await
        .unwrap();
    app.services
        .cutting
        .complete_operation(
            TEST_ACTOR,
            operation.id,
            CuttingOutcome {
                target_quantity: 6,
                second_grade_quantity: 0,
                defect_quantity: 1,
            },
        )
        .await
        .unwrap();

    let variances = stock_movement::Entity::find()
        .filter(stock_movement::Column::ProductId.eq(source.id))
        .filter(stock_movement::Column::MovementType.eq(MovementType::CuttingVariance))
        .all(&*app.db)
        .await
        .unwrap();
    assert_eq!(variances.len(), 1);
    assert_eq!(variances[0].quantity, 3);
}

#[tokio::test]
async fn cancelling_a_cut_returns_the_reserved_units() {
    let app = TestApp::new().await;
    let source = app.product_with_stock("Tube X", 5).await;
    let target = app.product_with_stock("Tube Y", 0).await;

    let operation = app
        .services
        .cutting
        .create_operation(TEST_ACTOR, cut_request(source.id, target.id, 5, 4))
        .await
        .unwrap();
    assert_eq!(app.stock(source.id).await.reserved_stock, 5);

    app.services
        .cutting
        .cancel_operation(TEST_ACTOR, operation.id)
        .await
        .unwrap();
    let record = app.stock(source.id).await;
    assert_eq!(record.reserved_stock, 0);
    assert_eq!(record.current_stock, 5);
}

#[tokio::test]
async fn resuming_a_cancelled_cut_re_reserves_the_source() {
    let app = TestApp::new().await;
    let source = app.product_with_stock("Coil X", 5).await;
    let target = app.product_with_stock("Coil Y", 0).await;

    let operation = app
        .services
        .cutting
        .create_operation(TEST_ACTOR, cut_request(source.id, target.id, 5, 5))
        .await
        .unwrap();
    app.services
        .cutting
        .cancel_operation(TEST_ACTOR, operation.id)
        .await
        .unwrap();

    app.services
        .cutting
        .resume_operation(TEST_ACTOR, operation.id)
        .await
        .unwrap();
    assert_eq!(app.stock(source.id).await.reserved_stock, 5);

    // The units are claimed again, so a second cut cannot have them.
    let result = app
        .services
        .cutting
        .create_operation(TEST_ACTOR, cut_request(source.id, target.id, 1, 1))
        .await;
    assert!(matches!(result, Err(ServiceError::ValidationError(_))));
}

#[tokio::test]
async fn completed_cuts_are_frozen() {
    let app = TestApp::new().await;
    let source = app.product_with_stock("Rod X", 4).await;
    let target = app.product_with_stock("Rod Y", 0).await;

    let operation = app
        .services
        .cutting
        .create_operation(TEST_ACTOR, cut_request(source.id, target.id, 4, 4))
        .await
        .unwrap();
    app.services
        .cutting
        .complete_operation(
            TEST_ACTOR,
            operation.id,
            CuttingOutcome {
                target_quantity: 4,
                second_grade_quantity: 0,
                defect_quantity: 0,
            },
        )
        .await
        .unwrap();

    let again = app
        .services
        .cutting
        .complete_operation(
            TEST_ACTOR,
            operation.id,
            CuttingOutcome {
                target_quantity: 4,
                second_grade_quantity: 0,
                defect_quantity: 0,
            },
        )
        .await;
    assert!(matches!(again, Err(ServiceError::IrreversibleState(_))));

    let cancel = app
        .services
        .cutting
        .cancel_operation(TEST_ACTOR, operation.id)
        .await;
    assert!(matches!(cancel, Err(ServiceError::IrreversibleState(_))));
}

#[tokio::test]
async fn cut_requires_available_source_stock() {
    let app = TestApp::new().await;
    let source = app.product_with_stock("Strip X", 3).await;
    let target = app.product_with_stock("Strip Y", 0).await;

    // An order already holds 2 of the 3 units.
    app.order(&[(source.id, 2)]).await;

    let result = app
        .services
        .cutting
        .create_operation(TEST_ACTOR, cut_request(source.id, target.id, 2, 2))
        .await;
    assert!(matches!(result, Err(ServiceError::ValidationError(_))));

    // One unit is still free, a one-unit cut goes through.
    app.services
        .cutting
        .create_operation(TEST_ACTOR, cut_request(source.id, target.id, 1, 1))
        .await
        .unwrap();
}
