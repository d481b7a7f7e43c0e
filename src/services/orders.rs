use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::order::{self, Entity as OrderEntity, OrderStatus};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::product::{self, Entity as ProductEntity};
use crate::entities::stock_movement::MovementType;
use crate::entities::stock_record;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::sequences;
use crate::services::order_status::OrderStatusEngine;
use crate::services::reservations::ReservationManager;
use crate::services::stock_ledger::{locked_stock_record, record_movement, MovementContext};

#[derive(Debug, Serialize, Deserialize)]
pub struct OrderItemRequest {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 255, message = "Customer name is required"))]
    pub customer_name: String,
    pub customer_contact: Option<String>,
    pub notes: Option<String>,
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<OrderItemRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

#[derive(Debug, Serialize)]
pub struct OrderListResponse {
    pub orders: Vec<order::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Order lifecycle: creation (with initial reservation and derived status),
/// the user-driven transitions, and deletion. Everything else about an
/// order's status comes from the status engine.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
    reservations: ReservationManager,
    status_engine: OrderStatusEngine,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderService {
    pub fn new(
        db: Arc<DbPool>,
        reservations: ReservationManager,
        status_engine: OrderStatusEngine,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db,
            reservations,
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

    /// Creates an order, reserves stock for it and derives its initial
    /// status, all in one transaction.
    #[instrument(skip(self, request), fields(customer = %request.customer_name))]
    pub async fn create_order(
        &self,
        actor_id: Uuid,
        request: CreateOrderRequest,
    ) -> Result<OrderDetails, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        for item in &request.items {
            if item.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Item quantity must be positive, got {} for product {}",
                    item.quantity, item.product_id
                )));
            }
            if item.unit_price < Decimal::ZERO {
                return Err(ServiceError::ValidationError(format!(
                    "Item price must be non-negative for product {}",
                    item.product_id
                )));
            }
        }

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let requested_ids: BTreeSet<Uuid> =
            request.items.iter().map(|i| i.product_id).collect();
        let known = ProductEntity::find()
            .filter(product::Column::Id.is_in(requested_ids.iter().copied()))
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        if known.len() != requested_ids.len() {
            let known_ids: BTreeSet<Uuid> = known.iter().map(|p| p.id).collect();
            let missing: Vec<String> = requested_ids
                .difference(&known_ids)
                .map(|id| id.to_string())
                .collect();
            return Err(ServiceError::ValidationError(format!(
                "Unknown products: {}",
                missing.join(", ")
            )));
        }

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order_number = sequences::next_value(&txn, sequences::ORDER_NUMBER_SEQ).await?;

        let order_active = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            customer_name: Set(request.customer_name),
            customer_contact: Set(request.customer_contact),
            status: Set(OrderStatus::New),
            notes: Set(request.notes),
            shipment_id: Set(None),
            created_at: Set(now),
            updated_at: Set(None),
        };
        order_active
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        for item in &request.items {
            let item_active = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                quantity: Set(item.quantity),
                reserved_quantity: Set(0),
                unit_price: Set(item.unit_price),
                created_at: Set(now),
                updated_at: Set(None),
            };
            item_active
                .insert(&txn)
                .await
                .map_err(ServiceError::db_error)?;
        }

        self.reservations
            .reserve_for_order_in(&txn, order_id, actor_id)
            .await?;
        self.status_engine
            .recalculate_order_in(&txn, order_id)
            .await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order_id = %order_id, order_number = order_number, "Order created");
        self.emit(Event::OrderCreated {
            order_id,
            order_number,
        })
        .await;

        self.get_order(order_id).await
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db;
        let order = OrderEntity::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(OrderDetails { order, items })
    }

    /// Lists orders with pagination. `page` is 1-based.
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListResponse, ServiceError> {
        if page == 0 {
            return Err(ServiceError::ValidationError(
                "Page number must be greater than 0".to_string(),
            ));
        }

        let paginator = OrderEntity::find()
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page);

        let total = paginator
            .num_items()
            .await
            .map_err(ServiceError::db_error)?;
        let orders = paginator
            .fetch_page(page - 1)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(OrderListResponse {
            orders,
            total,
            page,
            per_page,
        })
    }

    /// Applies a user-driven status transition. Only `ready -> completed`
    /// and non-terminal `-> cancelled` are accepted here; every other
    /// status is derived by the status engine and cannot be set by hand.
    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_order_status(
        &self,
        actor_id: Uuid,
        order_id: Uuid,
        new_status: OrderStatus,
        comment: Option<String>,
    ) -> Result<OrderDetails, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let old_status = order.status;
        if old_status.is_terminal() {
            return Err(ServiceError::IrreversibleState(format!(
                "Order {} is {} and cannot change status",
                order_id, old_status
            )));
        }

        match new_status {
            OrderStatus::Completed => {
                if old_status != OrderStatus::Ready {
                    return Err(ServiceError::ValidationError(format!(
                        "Only ready orders can be completed; order {} is {}",
                        order_id, old_status
                    )));
                }
                if order.shipment_id.is_some() {
                    return Err(ServiceError::ValidationError(format!(
                        "Order {} is attached to a shipment; complete the shipment instead",
                        order_id
                    )));
                }
                self.consume_reservations_in(&txn, order_id, actor_id)
                    .await?;
            }
            OrderStatus::Cancelled => {
                if order.shipment_id.is_some() {
                    return Err(ServiceError::ValidationError(format!(
                        "Order {} is attached to a shipment; cancel the shipment first",
                        order_id
                    )));
                }
                self.reservations
                    .release_for_order_in(&txn, order_id, actor_id)
                    .await?;
            }
            other => {
                return Err(ServiceError::ValidationError(format!(
                    "Status '{}' is derived from availability and cannot be set directly",
                    other
                )));
            }
        }

        let mut active: order::ActiveModel = order.into();
        active.status = Set(new_status);
        active.updated_at = Set(Some(Utc::now()));
        if let Some(comment) = comment {
            active.notes = Set(Some(comment));
        }
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            order_id = %order_id,
            old_status = %old_status,
            new_status = %new_status,
            "Order status updated"
        );
        self.emit(Event::OrderStatusChanged {
            order_id,
            old_status,
            new_status,
        })
        .await;

        self.get_order(order_id).await
    }

    /// Deletes an order, synchronously releasing all its reservations.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn delete_order(&self, actor_id: Uuid, order_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.shipment_id.is_some() {
            return Err(ServiceError::ValidationError(format!(
                "Order {} is attached to a shipment and cannot be deleted",
                order_id
            )));
        }

        self.reservations
            .release_for_order_in(&txn, order_id, actor_id)
            .await?;

        OrderItemEntity::delete_many()
            .filter(order_item::Column::OrderId.eq(order_id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        OrderEntity::delete_by_id(order_id)
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order_id = %order_id, "Order deleted");
        self.emit(Event::OrderDeleted { order_id }).await;
        Ok(())
    }

    /// Physical departure outside a shipment: decrements both current and
    /// reserved stock by each item's reservation.
    async fn consume_reservations_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        actor_id: Uuid,
    ) -> Result<(), ServiceError> {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .filter(order_item::Column::ReservedQuantity.gt(0))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        for item in items {
            let product_id = item.product_id;
            let consumed = item.reserved_quantity;

            let record = locked_stock_record(conn, product_id).await?;
            let current_before = record.current_stock;
            let reserved_before = record.reserved_stock;

            let mut active: stock_record::ActiveModel = record.into();
            active.current_stock = Set(current_before - consumed);
            active.reserved_stock = Set(reserved_before - consumed);
            active.updated_at = Set(Some(Utc::now()));
            active.update(conn).await.map_err(ServiceError::db_error)?;

            let ctx = MovementContext::new(actor_id).reference("order", order_id);
            record_movement(conn, product_id, MovementType::OrderOut, -consumed, &ctx).await?;

            // The reservation is spent; a later release pass must find
            // nothing left to hand back.
            let mut item_active: order_item::ActiveModel = item.into();
            item_active.reserved_quantity = Set(0);
            item_active.updated_at = Set(Some(Utc::now()));
            item_active
                .update(conn)
                .await
                .map_err(ServiceError::db_error)?;
        }
        Ok(())
    }
}
