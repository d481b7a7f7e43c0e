//! Stockline: inventory and fulfillment consistency engine.
//!
//! One physical stock pool per product with a cached reservation counter,
//! an append-only movement ledger, and order statuses derived from
//! availability. Over-reservation is a tolerated, visible business state;
//! the consistency validator audits and repairs the cached counters.

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod sequences;
pub mod services;

pub use errors::ServiceError;
pub use events::{process_events, Event, EventSender};

use std::sync::Arc;
use uuid::Uuid;

use crate::config::StockThresholds;
use crate::db::DbPool;
use crate::entities::stock_movement::MovementType;
use crate::entities::stock_record;
use crate::services::{
    ConsistencyValidator, CuttingService, MovementContext, OrderService, OrderStatusEngine,
    ProductService, ProductionService, ReservationManager, ShipmentService, StockLedger,
};

/// All services wired over one connection pool and one event channel.
#[derive(Clone)]
pub struct AppServices {
    pub ledger: StockLedger,
    pub reservations: ReservationManager,
    pub status_engine: OrderStatusEngine,
    pub products: ProductService,
    pub orders: OrderService,
    pub production: ProductionService,
    pub cutting: CuttingService,
    pub shipments: ShipmentService,
    pub consistency: ConsistencyValidator,
}

impl AppServices {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        thresholds: StockThresholds,
    ) -> Self {
        let ledger = StockLedger::new(db.clone(), event_sender.clone());
        let reservations = ReservationManager::new(db.clone(), event_sender.clone());
        let status_engine = OrderStatusEngine::new(db.clone(), event_sender.clone());
        let products = ProductService::new(db.clone());
        let orders = OrderService::new(
            db.clone(),
            reservations.clone(),
            status_engine.clone(),
            event_sender.clone(),
        );
        let production = ProductionService::new(
            db.clone(),
            ledger.clone(),
            status_engine.clone(),
            event_sender.clone(),
        );
        let cutting = CuttingService::new(
            db.clone(),
            ledger.clone(),
            products.clone(),
            status_engine.clone(),
            event_sender.clone(),
        );
        let shipments =
            ShipmentService::new(db.clone(), status_engine.clone(), event_sender.clone());
        let consistency = ConsistencyValidator::new(
            db,
            reservations.clone(),
            status_engine.clone(),
            thresholds,
            event_sender,
        );

        Self {
            ledger,
            reservations,
            status_engine,
            products,
            orders,
            production,
            cutting,
            shipments,
            consistency,
        }
    }

    /// Manual stock adjustment followed by re-derivation of every open
    /// order that references the product. The one entry point for "someone
    /// counted the shelf and corrected the number".
    pub async fn adjust_stock(
        &self,
        actor_id: Uuid,
        product_id: Uuid,
        delta: i32,
        note: Option<String>,
    ) -> Result<stock_record::Model, ServiceError> {
        let mut ctx = MovementContext::new(actor_id);
        if let Some(note) = note {
            ctx = ctx.note(note);
        }
        let record = self
            .ledger
            .adjust(product_id, delta, MovementType::Adjustment, ctx)
            .await?;
        self.status_engine.recalculate_for_product(product_id).await?;
        Ok(record)
    }
}
