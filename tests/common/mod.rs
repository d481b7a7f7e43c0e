#![allow(dead_code)]

use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use stockline::config::StockThresholds;
use stockline::db::{self, DbConfig, DbPool};
use stockline::entities::product;
use stockline::entities::stock_movement::MovementType;
use stockline::entities::stock_record;
use stockline::services::orders::{CreateOrderRequest, OrderDetails, OrderItemRequest};
use stockline::services::products::CreateProductRequest;
use stockline::services::MovementContext;
use stockline::{process_events, AppServices, EventSender};

pub const TEST_ACTOR: Uuid = Uuid::from_u128(0xA11CE);

pub struct TestApp {
    pub db: Arc<DbPool>,
    pub services: AppServices,
}

impl TestApp {
    /// In-memory database with a single connection, so every handle sees
    /// the same data.
    pub async fn new() -> Self {
        let config = DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        };
        let pool = db::establish_connection_with_config(&config)
            .await
            .expect("connect to in-memory database");
        db::run_migrations(&pool).await.expect("run migrations");

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(process_events(rx));

        let db = Arc::new(pool);
        let services = AppServices::new(
            db.clone(),
            Some(Arc::new(EventSender::new(tx))),
            StockThresholds::default(),
        );
        Self { db, services }
    }

    pub async fn product_with_stock(&self, name: &str, quantity: i32) -> product::Model {
        let created = self
            .services
            .products
            .create_product(CreateProductRequest {
                name: name.to_string(),
                sku: Some(format!("SKU-{}", name.to_uppercase().replace(' ', "-"))),
            })
            .await
            .expect("create product");

        if quantity != 0 {
            self.services
                .ledger
                .adjust(
                    created.id,
                    quantity,
                    MovementType::Adjustment,
                    MovementContext::new(TEST_ACTOR),
                )
                .await
                .expect("seed stock");
        }
        created
    }

    pub async fn order(&self, items: &[(Uuid, i32)]) -> OrderDetails {
        let request = CreateOrderRequest {
            customer_name: "Test Customer".to_string(),
            customer_contact: None,
            notes: None,
            items: items
                .iter()
                .map(|(product_id, quantity)| OrderItemRequest {
                    product_id: *product_id,
                    quantity: *quantity,
                    unit_price: dec!(10),
                })
                .collect(),
        };
        self.services
            .orders
            .create_order(TEST_ACTOR, request)
            .await
            .expect("create order")
    }

    pub async fn stock(&self, product_id: Uuid) -> stock_record::Model {
        self.services
            .ledger
            .get(product_id)
            .await
            .expect("stock record")
    }
}
