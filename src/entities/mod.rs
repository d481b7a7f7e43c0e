pub mod cutting_operation;
pub mod number_sequence;
pub mod order;
pub mod order_item;
pub mod product;
pub mod production_task;
pub mod shipment;
pub mod shipment_item;
pub mod stock_movement;
pub mod stock_record;
