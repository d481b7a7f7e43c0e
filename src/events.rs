use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::entities::order::OrderStatus;

/// Domain events emitted after a mutating transaction commits. Consumers
/// attach to the receiving end of the channel; losing an event is logged but
/// never fails the originating operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: i64,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderDeleted {
        order_id: Uuid,
    },
    StockAdjusted {
        product_id: Uuid,
        delta: i32,
        current_stock: i32,
    },
    ReservationsChanged {
        order_id: Uuid,
    },
    ProductionTaskCompleted {
        task_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    CuttingOperationCreated {
        operation_id: Uuid,
    },
    CuttingOperationCompleted {
        operation_id: Uuid,
        source_product_id: Uuid,
        target_product_id: Uuid,
    },
    CuttingOperationCancelled {
        operation_id: Uuid,
    },
    ShipmentCreated {
        shipment_id: Uuid,
        shipment_number: i64,
    },
    ShipmentCompleted {
        shipment_id: Uuid,
    },
    ShipmentCancelled {
        shipment_id: Uuid,
    },
    StockCorrectionApplied {
        product_id: Uuid,
        old_reserved: i32,
        new_reserved: i32,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Drains the event channel, logging each event. Spawn this alongside the
/// services; downstream consumers (notifications, exports) hook in here.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        info!(event = ?event, "domain event");
    }
}
