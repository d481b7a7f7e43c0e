//! Shipments: grouping ready orders for departure, snapshotting planned
//! quantities, and consuming reservations when the goods actually leave.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, DbPool};
use crate::entities::order::{self, Entity as OrderEntity, OrderStatus};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::shipment::{self, Entity as ShipmentEntity, ShipmentStatus};
use crate::entities::shipment_item::{self, Entity as ShipmentItemEntity};
use crate::entities::stock_movement::MovementType;
use crate::entities::stock_record;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::sequences;
use crate::services::order_status::OrderStatusEngine;
use crate::services::stock_ledger::{locked_stock_record, record_movement, MovementContext};

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateShipmentRequest {
    pub order_ids: Vec<Uuid>,
    pub planned_date: Option<DateTime<Utc>>,
    pub transport_info: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShipmentDetails {
    pub shipment: shipment::Model,
    pub items: Vec<shipment_item::Model>,
}

#[derive(Clone)]
pub struct ShipmentService {
    db: Arc<DbPool>,
    status_engine: OrderStatusEngine,
    event_sender: Option<Arc<EventSender>>,
}

impl ShipmentService {
    pub fn new(
        db: Arc<DbPool>,
        status_engine: OrderStatusEngine,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db,
            status_engine,
            event_sender,
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "failed to publish event");
            }
        }
    }

    /// Creates a shipment from ready orders. Each order is locked, checked
    /// (ready, not already attached) and attached, and its reservations are
    /// snapshotted as the planned quantities.
    #[instrument(skip(self, request), fields(orders = request.order_ids.len()))]
    pub async fn create_shipment(
        &self,
        request: CreateShipmentRequest,
    ) -> Result<ShipmentDetails, ServiceError> {
        if request.order_ids.is_empty() {
            return Err(ServiceError::ValidationError(
                "Shipment must contain at least one order".to_string(),
            ));
        }
        let unique: BTreeSet<Uuid> = request.order_ids.iter().copied().collect();
        if unique.len() != request.order_ids.len() {
            return Err(ServiceError::ValidationError(
                "Duplicate orders in shipment".to_string(),
            ));
        }

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let backend = txn.get_database_backend();

        let shipment_id = Uuid::new_v4();
        let shipment_number = sequences::next_value(&txn, sequences::SHIPMENT_NUMBER_SEQ).await?;
        let now = Utc::now();

        let shipment_active = shipment::ActiveModel {
            id: Set(shipment_id),
            shipment_number: Set(shipment_number),
            status: Set(ShipmentStatus::Pending),
            planned_date: Set(request.planned_date),
            transport_info: Set(request.transport_info),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(None),
        };
        let created = shipment_active
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        for order_id in &request.order_ids {
            let order = db::locked_for_update(OrderEntity::find_by_id(*order_id), backend)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Order {} not found", order_id))
                })?;

            if order.status != OrderStatus::Ready {
                return Err(ServiceError::ValidationError(format!(
                    "Order {} is {}; only ready orders can be shipped",
                    order_id, order.status
                )));
            }
            if order.shipment_id.is_some() {
                return Err(ServiceError::ValidationError(format!(
                    "Order {} is already attached to a shipment",
                    order_id
                )));
            }

            let mut order_active: order::ActiveModel = order.into();
            order_active.shipment_id = Set(Some(shipment_id));
            order_active.updated_at = Set(Some(now));
            order_active
                .update(&txn)
                .await
                .map_err(ServiceError::db_error)?;

            let items = OrderItemEntity::find()
                .filter(order_item::Column::OrderId.eq(*order_id))
                .order_by_asc(order_item::Column::CreatedAt)
                .all(&txn)
                .await
                .map_err(ServiceError::db_error)?;
            for item in items {
                let snapshot = shipment_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    shipment_id: Set(shipment_id),
                    order_id: Set(*order_id),
                    order_item_id: Set(item.id),
                    product_id: Set(item.product_id),
                    planned_quantity: Set(item.reserved_quantity),
                    actual_quantity: Set(None),
                    created_at: Set(now),
                };
                snapshot
                    .insert(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;
            }
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            shipment_id = %shipment_id,
            shipment_number = shipment_number,
            "Shipment created"
        );
        self.emit(Event::ShipmentCreated {
            shipment_id,
            shipment_number,
        })
        .await;

        let items = self.shipment_items(shipment_id).await?;
        Ok(ShipmentDetails {
            shipment: created,
            items,
        })
    }

    pub async fn get_shipment(&self, shipment_id: Uuid) -> Result<ShipmentDetails, ServiceError> {
        let shipment = ShipmentEntity::find_by_id(shipment_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Shipment {} not found", shipment_id))
            })?;
        let items = self.shipment_items(shipment_id).await?;
        Ok(ShipmentDetails { shipment, items })
    }

    async fn shipment_items(
        &self,
        shipment_id: Uuid,
    ) -> Result<Vec<shipment_item::Model>, ServiceError> {
        ShipmentItemEntity::find()
            .filter(shipment_item::Column::ShipmentId.eq(shipment_id))
            .order_by_asc(shipment_item::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Completes a shipment: every item's shipped quantity (actual when
    /// given, planned otherwise) leaves both the physical and the reserved
    /// pool, and the attached orders complete. One transaction end to end.
    #[instrument(skip(self, actual_quantities), fields(shipment_id = %shipment_id))]
    pub async fn complete_shipment(
        &self,
        actor_id: Uuid,
        shipment_id: Uuid,
        actual_quantities: HashMap<Uuid, i32>,
    ) -> Result<ShipmentDetails, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let shipment = ShipmentEntity::find_by_id(shipment_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Shipment {} not found", shipment_id))
            })?;
        check_shipment_transition(shipment.status, ShipmentStatus::Completed, shipment_id)?;

        let items = ShipmentItemEntity::find()
            .filter(shipment_item::Column::ShipmentId.eq(shipment_id))
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let item_ids: BTreeSet<Uuid> = items.iter().map(|i| i.id).collect();
        if let Some(unknown) = actual_quantities.keys().find(|id| !item_ids.contains(id)) {
            return Err(ServiceError::ValidationError(format!(
                "Actual quantity given for item {} which is not part of shipment {}",
                unknown, shipment_id
            )));
        }

        let mut order_ids = BTreeSet::new();
        for item in items {
            let shipped = match actual_quantities.get(&item.id) {
                Some(actual) if *actual < 0 => {
                    return Err(ServiceError::ValidationError(format!(
                        "Shipped quantity must be non-negative for item {}",
                        item.id
                    )));
                }
                Some(actual) => *actual,
                None => item.planned_quantity,
            };
            order_ids.insert(item.order_id);

            if shipped != 0 {
                let record = locked_stock_record(&txn, item.product_id).await?;
                let current_before = record.current_stock;
                let reserved_before = record.reserved_stock;
                if shipped != item.planned_quantity {
                    warn!(
                        shipment_item_id = %item.id,
                        planned = item.planned_quantity,
                        shipped = shipped,
                        "shipped quantity differs from plan"
                    );
                }
                let mut record_active: stock_record::ActiveModel = record.into();
                record_active.current_stock = Set(current_before - shipped);
                record_active.reserved_stock = Set(reserved_before - shipped);
                record_active.updated_at = Set(Some(Utc::now()));
                record_active
                    .update(&txn)
                    .await
                    .map_err(ServiceError::db_error)?;

                let ctx = MovementContext::new(actor_id).reference("shipment", shipment_id);
                record_movement(
                    &txn,
                    item.product_id,
                    MovementType::ShipmentOut,
                    -shipped,
                    &ctx,
                )
                .await?;
            }

            let mut item_active: shipment_item::ActiveModel = item.into();
            item_active.actual_quantity = Set(Some(shipped));
            item_active
                .update(&txn)
                .await
                .map_err(ServiceError::db_error)?;
        }

        let mut completed_orders = Vec::new();
        for order_id in &order_ids {
            let order = OrderEntity::find_by_id(*order_id)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Order {} not found", order_id))
                })?;
            let old_status = order.status;
            let mut order_active: order::ActiveModel = order.into();
            order_active.status = Set(OrderStatus::Completed);
            order_active.updated_at = Set(Some(Utc::now()));
            order_active
                .update(&txn)
                .await
                .map_err(ServiceError::db_error)?;
            completed_orders.push((*order_id, old_status));
        }

        // Spent reservations: zero the items so later passes over these
        // orders find nothing to release.
        OrderItemEntity::update_many()
            .col_expr(order_item::Column::ReservedQuantity, Expr::value(0))
            .col_expr(order_item::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order_item::Column::OrderId.is_in(order_ids.iter().copied()))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut active: shipment::ActiveModel = shipment.into();
        active.status = Set(ShipmentStatus::Completed);
        active.completed_at = Set(Some(Utc::now()));
        active.updated_at = Set(Some(Utc::now()));
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            shipment_id = %shipment_id,
            orders = completed_orders.len(),
            "Shipment completed"
        );
        self.emit(Event::ShipmentCompleted { shipment_id }).await;
        for (order_id, old_status) in completed_orders {
            self.emit(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status: OrderStatus::Completed,
            })
            .await;
        }

        self.get_shipment(shipment_id).await
    }

    /// Cancels a shipment, detaching its orders. The orders keep their
    /// reservations and are re-derived (normally straight back to ready).
    #[instrument(skip(self), fields(shipment_id = %shipment_id))]
    pub async fn cancel_shipment(
        &self,
        shipment_id: Uuid,
    ) -> Result<ShipmentDetails, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let shipment = ShipmentEntity::find_by_id(shipment_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Shipment {} not found", shipment_id))
            })?;
        check_shipment_transition(shipment.status, ShipmentStatus::Cancelled, shipment_id)?;

        let attached = OrderEntity::find()
            .filter(order::Column::ShipmentId.eq(shipment_id))
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        let mut detached_ids = Vec::with_capacity(attached.len());
        for order in attached {
            detached_ids.push(order.id);
            let mut order_active: order::ActiveModel = order.into();
            order_active.shipment_id = Set(None);
            order_active.updated_at = Set(Some(Utc::now()));
            order_active
                .update(&txn)
                .await
                .map_err(ServiceError::db_error)?;
        }

        let mut active: shipment::ActiveModel = shipment.into();
        active.status = Set(ShipmentStatus::Cancelled);
        active.updated_at = Set(Some(Utc::now()));
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            shipment_id = %shipment_id,
            detached_orders = detached_ids.len(),
            "Shipment cancelled"
        );
        self.emit(Event::ShipmentCancelled { shipment_id }).await;

        for order_id in detached_ids {
            self.status_engine.recalculate_order(order_id).await?;
        }

        self.get_shipment(shipment_id).await
    }

    #[instrument(skip(self), fields(shipment_id = %shipment_id))]
    pub async fn pause_shipment(
        &self,
        shipment_id: Uuid,
    ) -> Result<ShipmentDetails, ServiceError> {
        self.set_status_only(shipment_id, ShipmentStatus::Paused)
            .await
    }

    #[instrument(skip(self), fields(shipment_id = %shipment_id))]
    pub async fn resume_shipment(
        &self,
        shipment_id: Uuid,
    ) -> Result<ShipmentDetails, ServiceError> {
        self.set_status_only(shipment_id, ShipmentStatus::Pending)
            .await
    }

    async fn set_status_only(
        &self,
        shipment_id: Uuid,
        new_status: ShipmentStatus,
    ) -> Result<ShipmentDetails, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let shipment = ShipmentEntity::find_by_id(shipment_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Shipment {} not found", shipment_id))
            })?;
        check_shipment_transition(shipment.status, new_status, shipment_id)?;

        let mut active: shipment::ActiveModel = shipment.into();
        active.status = Set(new_status);
        active.updated_at = Set(Some(Utc::now()));
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;
        self.get_shipment(shipment_id).await
    }
}

fn check_shipment_transition(
    from: ShipmentStatus,
    to: ShipmentStatus,
    shipment_id: Uuid,
) -> Result<(), ServiceError> {
    use ShipmentStatus::*;

    if from.is_terminal() {
        return Err(ServiceError::IrreversibleState(format!(
            "Shipment {} is {} and cannot change status",
            shipment_id, from
        )));
    }

    let allowed = matches!(
        (from, to),
        (Pending, Paused)
            | (Pending, Completed)
            | (Pending, Cancelled)
            | (Paused, Pending)
            | (Paused, Cancelled)
    );
    if allowed {
        Ok(())
    } else {
        Err(ServiceError::ValidationError(format!(
            "Shipment {} cannot go from {} to {}",
            shipment_id, from, to
        )))
    }
}
