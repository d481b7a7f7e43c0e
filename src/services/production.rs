use chrono::Utc;
use sea_orm::{ActiveModelTrait, EntityTrait, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::product::Entity as ProductEntity;
use crate::entities::production_task::{self, Entity as ProductionTaskEntity, ProductionTaskStatus};
use crate::entities::stock_movement::MovementType;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::order_status::OrderStatusEngine;
use crate::services::stock_ledger::{MovementContext, StockLedger};

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateProductionTaskRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Requested quantity must be positive"))]
    pub requested_quantity: i32,
    pub order_id: Option<Uuid>,
}

/// Production tasks: queued manufacturing that counts as "on the way" for
/// status derivation and lands in stock on completion.
#[derive(Clone)]
pub struct ProductionService {
    db: Arc<DbPool>,
    ledger: StockLedger,
    status_engine: OrderStatusEngine,
    event_sender: Option<Arc<EventSender>>,
}

impl ProductionService {
    pub fn new(
        db: Arc<DbPool>,
        ledger: StockLedger,
        status_engine: OrderStatusEngine,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db,
            ledger,
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

    #[instrument(skip(self, request), fields(product_id = %request.product_id))]
    pub async fn create_task(
        &self,
        request: CreateProductionTaskRequest,
    ) -> Result<production_task::Model, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        ProductEntity::find_by_id(request.product_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::ValidationError(format!(
                    "Unknown product {}",
                    request.product_id
                ))
            })?;

        let task = production_task::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(request.product_id),
            requested_quantity: Set(request.requested_quantity),
            order_id: Set(request.order_id),
            status: Set(ProductionTaskStatus::Pending),
            completed_at: Set(None),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        };
        let created = task.insert(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(task_id = %created.id, quantity = created.requested_quantity, "Production task created");

        // Open production can move shortfall orders to in_production.
        self.status_engine
            .recalculate_for_product(request.product_id)
            .await?;

        Ok(created)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<production_task::Model, ServiceError> {
        ProductionTaskEntity::find_by_id(task_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Production task {} not found", task_id))
            })
    }

    /// Moves a task through its lifecycle. Completion credits the produced
    /// quantity to stock and re-derives affected orders.
    #[instrument(skip(self), fields(task_id = %task_id, new_status = %new_status))]
    pub async fn update_task_status(
        &self,
        actor_id: Uuid,
        task_id: Uuid,
        new_status: ProductionTaskStatus,
    ) -> Result<production_task::Model, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let task = ProductionTaskEntity::find_by_id(task_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Production task {} not found", task_id))
            })?;

        check_task_transition(task.status, new_status, task_id)?;

        let product_id = task.product_id;
        let quantity = task.requested_quantity;
        let completing = new_status == ProductionTaskStatus::Completed;

        if completing {
            let ctx = MovementContext::new(actor_id).reference("production_task", task_id);
            self.ledger
                .adjust_in(&txn, product_id, quantity, MovementType::ProductionIn, &ctx)
                .await?;
        }

        let old_status = task.status;
        let mut active: production_task::ActiveModel = task.into();
        active.status = Set(new_status);
        active.updated_at = Set(Some(Utc::now()));
        if completing {
            active.completed_at = Set(Some(Utc::now()));
        }
        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            task_id = %task_id,
            old_status = %old_status,
            new_status = %new_status,
            "Production task status updated"
        );

        if completing {
            self.emit(Event::ProductionTaskCompleted {
                task_id,
                product_id,
                quantity,
            })
            .await;
        }

        // Completion changes stock; cancellation removes queued production.
        // Both can change order statuses.
        if completing || new_status == ProductionTaskStatus::Cancelled {
            self.status_engine
                .recalculate_for_product(product_id)
                .await?;
        }

        Ok(updated)
    }
}

fn check_task_transition(
    from: ProductionTaskStatus,
    to: ProductionTaskStatus,
    task_id: Uuid,
) -> Result<(), ServiceError> {
    use ProductionTaskStatus::*;

    if from.is_terminal() {
        return Err(ServiceError::IrreversibleState(format!(
            "Production task {} is {} and cannot change status",
            task_id, from
        )));
    }

    let allowed = matches!(
        (from, to),
        (Pending, InProgress)
            | (Pending, Cancelled)
            | (InProgress, Paused)
            | (InProgress, Completed)
            | (InProgress, Cancelled)
            | (Paused, InProgress)
            | (Paused, Cancelled)
    );
    if allowed {
        Ok(())
    } else {
        Err(ServiceError::ValidationError(format!(
            "Production task {} cannot go from {} to {}",
            task_id, from, to
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProductionTaskStatus::*;

    #[test]
    fn transitions_follow_the_lattice() {
        let id = Uuid::new_v4();
        assert!(check_task_transition(Pending, InProgress, id).is_ok());
        assert!(check_task_transition(Pending, Cancelled, id).is_ok());
        assert!(check_task_transition(InProgress, Completed, id).is_ok());
        assert!(check_task_transition(InProgress, Paused, id).is_ok());
        assert!(check_task_transition(Paused, InProgress, id).is_ok());

        assert!(matches!(
            check_task_transition(Pending, Completed, id),
            Err(ServiceError::ValidationError(_))
        ));
        assert!(matches!(
            check_task_transition(Paused, Completed, id),
            Err(ServiceError::ValidationError(_))
        ));
    }

    #[test]
    fn terminal_tasks_are_frozen() {
        let id = Uuid::new_v4();
        for from in [Completed, Cancelled] {
            for to in [Pending, InProgress, Paused, Completed, Cancelled] {
                assert!(matches!(
                    check_task_transition(from, to, id),
                    Err(ServiceError::IrreversibleState(_))
                ));
            }
        }
    }
}
