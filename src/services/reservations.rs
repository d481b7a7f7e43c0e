//! Reservation manager: the only code allowed to mutate
//! `order_items.reserved_quantity`.
//!
//! Allocation rule: stock available *to a specific order* excludes every
//! other order's reservation but includes its own, so re-running allocation
//! for a later order can never take units an earlier order already holds.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::order::{self, Entity as OrderEntity};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::stock_movement::MovementType;
use crate::entities::stock_record;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::stock_ledger::{locked_stock_record, record_movement, MovementContext};

/// Result of (re-)allocating one order item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemReservationOutcome {
    pub order_item_id: Uuid,
    pub product_id: Uuid,
    pub requested: i32,
    pub reserved: i32,
    pub delta: i32,
}

impl ItemReservationOutcome {
    pub fn fully_reserved(&self) -> bool {
        self.reserved == self.requested
    }
}

#[derive(Clone)]
pub struct ReservationManager {
    db: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl ReservationManager {
    pub fn new(db: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self { db, event_sender }
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "failed to publish event");
            }
        }
    }

    /// Stock available to one order for one product: everything not claimed
    /// by *other* orders. May be negative.
    pub fn available_for_order(record: &stock_record::Model, reserved_for_this: i32) -> i32 {
        record.current_stock - (record.reserved_stock - reserved_for_this)
    }

    /// Re-allocates every item of an order against current stock, inside the
    /// caller's transaction. Items are processed in creation order. Grants
    /// `min(quantity, max(available_for_this_order, 0))` per item; already
    /// settled items produce a zero delta, which makes the pass idempotent.
    pub(crate) async fn reserve_for_order_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        actor_id: Uuid,
    ) -> Result<Vec<ItemReservationOutcome>, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.status.is_terminal() {
            return Err(ServiceError::InvalidOperation(format!(
                "Cannot reserve stock for {} order {}",
                order.status, order_id
            )));
        }

        if order.shipment_id.is_some() {
            return Err(ServiceError::ValidationError(format!(
                "Order {} is attached to a shipment; detach it first",
                order_id
            )));
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            let outcome = self
                .allocate_item_in(conn, &item, item.quantity, actor_id)
                .await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Allocates a single item toward `desired_quantity`, applying the delta
    /// to both the item and the stock record under one row lock.
    async fn allocate_item_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        item: &order_item::Model,
        desired_quantity: i32,
        actor_id: Uuid,
    ) -> Result<ItemReservationOutcome, ServiceError> {
        let record = locked_stock_record(conn, item.product_id).await?;
        let available = Self::available_for_order(&record, item.reserved_quantity);
        let target = desired_quantity.min(available.max(0));
        let delta = target - item.reserved_quantity;

        if delta != 0 {
            let reserved_before = record.reserved_stock;
            let mut record_active: stock_record::ActiveModel = record.into();
            record_active.reserved_stock = Set(reserved_before + delta);
            record_active.updated_at = Set(Some(Utc::now()));
            record_active
                .update(conn)
                .await
                .map_err(ServiceError::db_error)?;

            let mut item_active: order_item::ActiveModel = item.clone().into();
            item_active.reserved_quantity = Set(target);
            item_active.updated_at = Set(Some(Utc::now()));
            item_active
                .update(conn)
                .await
                .map_err(ServiceError::db_error)?;

            let movement_type = if delta > 0 {
                MovementType::Reserve
            } else {
                MovementType::Release
            };
            let ctx = MovementContext::new(actor_id).reference("order", item.order_id);
            record_movement(conn, item.product_id, movement_type, -delta, &ctx).await?;
        }

        Ok(ItemReservationOutcome {
            order_item_id: item.id,
            product_id: item.product_id,
            requested: desired_quantity,
            reserved: target,
            delta,
        })
    }

    /// Re-allocates every item of an order in its own transaction.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn reserve_for_order(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
    ) -> Result<Vec<ItemReservationOutcome>, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let outcomes = self.reserve_for_order_in(&txn, order_id, actor_id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        if outcomes.iter().any(|o| o.delta != 0) {
            self.emit(Event::ReservationsChanged { order_id }).await;
        }
        info!(
            order_id = %order_id,
            items = outcomes.len(),
            fully_reserved = outcomes.iter().all(|o| o.fully_reserved()),
            "Order reservations recalculated"
        );
        Ok(outcomes)
    }

    /// Releases every reservation held by an order: decrements
    /// `reserved_stock` by exactly the order's reservation sum and zeroes
    /// the items. Runs inside the caller's transaction.
    pub(crate) async fn release_for_order_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        actor_id: Uuid,
    ) -> Result<i32, ServiceError> {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .filter(order_item::Column::ReservedQuantity.gt(0))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut total_released = 0;
        for item in items {
            let reserved = item.reserved_quantity;
            let record = locked_stock_record(conn, item.product_id).await?;
            let reserved_before = record.reserved_stock;

            let mut record_active: stock_record::ActiveModel = record.into();
            record_active.reserved_stock = Set(reserved_before - reserved);
            record_active.updated_at = Set(Some(Utc::now()));
            record_active
                .update(conn)
                .await
                .map_err(ServiceError::db_error)?;

            let product_id = item.product_id;
            let mut item_active: order_item::ActiveModel = item.into();
            item_active.reserved_quantity = Set(0);
            item_active.updated_at = Set(Some(Utc::now()));
            item_active
                .update(conn)
                .await
                .map_err(ServiceError::db_error)?;

            let ctx = MovementContext::new(actor_id).reference("order", order_id);
            record_movement(conn, product_id, MovementType::Release, reserved, &ctx).await?;
            total_released += reserved;
        }
        Ok(total_released)
    }

    /// Releases every reservation held by an order in its own transaction.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn release_for_order(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
    ) -> Result<i32, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let released = self.release_for_order_in(&txn, order_id, actor_id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        if released != 0 {
            self.emit(Event::ReservationsChanged { order_id }).await;
        }
        info!(order_id = %order_id, released = released, "Order reservations released");
        Ok(released)
    }

    /// Changes an item's ordered quantity and re-allocates its reservation.
    #[instrument(skip(self), fields(order_item_id = %order_item_id))]
    pub async fn adjust_reservation(
        &self,
        order_item_id: Uuid,
        new_quantity: i32,
        actor_id: Uuid,
    ) -> Result<ItemReservationOutcome, ServiceError> {
        if new_quantity < 0 {
            return Err(ServiceError::ValidationError(format!(
                "Quantity must be non-negative, got {}",
                new_quantity
            )));
        }

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let item = OrderItemEntity::find_by_id(order_item_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order item {} not found", order_item_id))
            })?;

        let order = OrderEntity::find_by_id(item.order_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", item.order_id)))?;

        if order.status.is_terminal() {
            return Err(ServiceError::InvalidOperation(format!(
                "Cannot change items of {} order {}",
                order.status, order.id
            )));
        }
        if order.shipment_id.is_some() {
            return Err(ServiceError::ValidationError(format!(
                "Order {} is attached to a shipment; detach it first",
                order.id
            )));
        }

        let mut item_active: order_item::ActiveModel = item.clone().into();
        item_active.quantity = Set(new_quantity);
        item_active.updated_at = Set(Some(Utc::now()));
        let item = item_active
            .update(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        let outcome = self
            .allocate_item_in(&txn, &item, new_quantity, actor_id)
            .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        self.emit(Event::ReservationsChanged {
            order_id: item.order_id,
        })
        .await;
        Ok(outcome)
    }

    /// Sum of reservations held by open orders for one product. This is the
    /// authoritative figure `reserved_stock` caches.
    pub(crate) async fn reserved_by_open_orders<C: ConnectionTrait>(
        conn: &C,
        product_id: Uuid,
    ) -> Result<i32, ServiceError> {
        let open_orders = OrderEntity::find()
            .filter(order::Column::Status.is_in(order::OrderStatus::OPEN))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if open_orders.is_empty() {
            return Ok(0);
        }
        let open_ids: Vec<Uuid> = open_orders.into_iter().map(|o| o.id).collect();

        let items = OrderItemEntity::find()
            .filter(order_item::Column::ProductId.eq(product_id))
            .filter(order_item::Column::OrderId.is_in(open_ids))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(items.iter().map(|i| i.reserved_quantity).sum())
    }
}
