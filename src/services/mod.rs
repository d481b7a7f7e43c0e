pub mod consistency;
pub mod cutting;
pub mod order_status;
pub mod orders;
pub mod production;
pub mod products;
pub mod reservations;
pub mod shipments;
pub mod stock_ledger;

pub use consistency::ConsistencyValidator;
pub use cutting::CuttingService;
pub use order_status::OrderStatusEngine;
pub use orders::OrderService;
pub use production::ProductionService;
pub use products::ProductService;
pub use reservations::ReservationManager;
pub use shipments::ShipmentService;
pub use stock_ledger::{MovementContext, ReservePolicy, StockLedger, SYSTEM_ACTOR_ID};
