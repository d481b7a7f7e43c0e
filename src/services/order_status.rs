//! Order status derivation.
//!
//! One pure function decides the next status from item availability and
//! production state; the service wrappers query that state and apply the
//! result. Every availability-changing commit triggers one of the wrappers
//! before its request returns, and nowhere else re-derives statuses.

use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::order::{self, Entity as OrderEntity, OrderStatus};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::production_task::{self, Entity as ProductionTaskEntity, ProductionTaskStatus};
use crate::entities::stock_record;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::reservations::ReservationManager;

/// Per-item classification against stock available to its order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ItemAvailability {
    Full,
    Partial,
    NeedsProduction,
}

pub fn classify_item(quantity: i32, available_for_this_order: i32) -> ItemAvailability {
    if available_for_this_order >= quantity {
        ItemAvailability::Full
    } else if available_for_this_order > 0 {
        ItemAvailability::Partial
    } else {
        ItemAvailability::NeedsProduction
    }
}

/// Next status from current status, item availability and open production.
/// Terminal statuses and the user-driven transitions (`ready -> completed`,
/// `-> cancelled`) are never produced here.
pub fn derive_status(
    current: OrderStatus,
    items: &[ItemAvailability],
    has_open_production: bool,
) -> OrderStatus {
    if current.is_terminal() {
        return current;
    }

    let all_full = !items.is_empty() && items.iter().all(|a| *a == ItemAvailability::Full);
    if all_full {
        return match current {
            OrderStatus::New => OrderStatus::Confirmed,
            OrderStatus::Confirmed | OrderStatus::InProduction => OrderStatus::Ready,
            other => other,
        };
    }

    if has_open_production {
        return OrderStatus::InProduction;
    }

    // Short on stock with nothing queued: a confirmed order signals that
    // production must be queued; a new order waits for confirmation.
    match current {
        OrderStatus::Confirmed => OrderStatus::InProduction,
        other => other,
    }
}

/// Result of re-deriving one order.
#[derive(Debug, Clone, Copy)]
pub struct Recalculation {
    pub order_id: Uuid,
    pub previous: OrderStatus,
    pub derived: OrderStatus,
}

impl Recalculation {
    pub fn changed(&self) -> bool {
        self.previous != self.derived
    }
}

#[derive(Clone)]
pub struct OrderStatusEngine {
    db: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderStatusEngine {
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

    /// Re-derives one order inside the caller's transaction. Writes only
    /// when the derived status differs from the stored one.
    pub(crate) async fn recalculate_order_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<Recalculation, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let previous = order.status;
        if previous.is_terminal() {
            return Ok(Recalculation {
                order_id,
                previous,
                derived: previous,
            });
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut availabilities = Vec::with_capacity(items.len());
        let mut has_open_production = false;
        for item in &items {
            let record = stock_record::Entity::find_by_id(item.product_id)
                .one(conn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!(
                        "No stock record for product {}",
                        item.product_id
                    ))
                })?;

            let available =
                ReservationManager::available_for_order(&record, item.reserved_quantity);
            availabilities.push(classify_item(item.quantity, available));

            if !has_open_production {
                has_open_production =
                    open_production_quantity(conn, item.product_id).await? > 0;
            }
        }

        let derived = derive_status(previous, &availabilities, has_open_production);
        if derived != previous {
            let mut active: order::ActiveModel = order.into();
            active.status = Set(derived);
            active.updated_at = Set(Some(chrono::Utc::now()));
            active.update(conn).await.map_err(ServiceError::db_error)?;
        }

        Ok(Recalculation {
            order_id,
            previous,
            derived,
        })
    }

    /// Re-derives one order in its own transaction.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn recalculate_order(&self, order_id: Uuid) -> Result<Recalculation, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let recalc = self.recalculate_order_in(&txn, order_id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        if recalc.changed() {
            info!(
                order_id = %order_id,
                old_status = %recalc.previous,
                new_status = %recalc.derived,
                "Order status re-derived"
            );
            self.emit(Event::OrderStatusChanged {
                order_id,
                old_status: recalc.previous,
                new_status: recalc.derived,
            })
            .await;
        }
        Ok(recalc)
    }

    /// Re-derives every open order that references a product. Called by
    /// whichever request changed the product's availability, before it
    /// returns.
    #[instrument(skip(self), fields(product_id = %product_id))]
    pub async fn recalculate_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<Recalculation>, ServiceError> {
        let db = &*self.db;

        let open_orders = OrderEntity::find()
            .filter(order::Column::Status.is_in(OrderStatus::OPEN))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;
        if open_orders.is_empty() {
            return Ok(vec![]);
        }
        let open_ids: Vec<Uuid> = open_orders.into_iter().map(|o| o.id).collect();

        let items = OrderItemEntity::find()
            .filter(order_item::Column::ProductId.eq(product_id))
            .filter(order_item::Column::OrderId.is_in(open_ids))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let affected: BTreeSet<Uuid> = items.into_iter().map(|i| i.order_id).collect();

        let mut recalcs = Vec::with_capacity(affected.len());
        for order_id in affected {
            recalcs.push(self.recalculate_order(order_id).await?);
        }
        Ok(recalcs)
    }
}

/// Open (non-terminal) production quantity queued for a product.
pub(crate) async fn open_production_quantity<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<i32, ServiceError> {
    let tasks = ProductionTaskEntity::find()
        .filter(production_task::Column::ProductId.eq(product_id))
        .filter(production_task::Column::Status.is_in(ProductionTaskStatus::OPEN))
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(tasks.iter().map(|t| t.requested_quantity.max(0)).sum())
}
