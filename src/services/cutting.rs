//! Cutting operations: converting source-product units into a target
//! product, with second-grade and defect outcomes recorded at completion.
//!
//! Source units are reserved when the operation starts (recorded as a
//! `cutting_out` movement) and physically written off at completion, so
//! the pool sees the outflow exactly once.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::cutting_operation::{self, CuttingStatus, Entity as CuttingEntity};
use crate::entities::product::Entity as ProductEntity;
use crate::entities::stock_movement::MovementType;
use crate::entities::stock_record;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::order_status::OrderStatusEngine;
use crate::services::products::ProductService;
use crate::services::stock_ledger::{
    locked_stock_record, record_movement, MovementContext, ReservePolicy, StockLedger,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateCuttingRequest {
    pub source_product_id: Uuid,
    pub target_product_id: Uuid,
    pub source_quantity: i32,
    pub target_quantity: i32,
    pub planned_date: Option<DateTime<Utc>>,
}

/// Actual outcome of a completed cut.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CuttingOutcome {
    pub target_quantity: i32,
    pub second_grade_quantity: i32,
    pub defect_quantity: i32,
}

#[derive(Clone)]
pub struct CuttingService {
    db: Arc<DbPool>,
    ledger: StockLedger,
    products: ProductService,
    status_engine: OrderStatusEngine,
    event_sender: Option<Arc<EventSender>>,
}

impl CuttingService {
    pub fn new(
        db: Arc<DbPool>,
        ledger: StockLedger,
        products: ProductService,
        status_engine: OrderStatusEngine,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db,
            ledger,
            products,
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

    /// Starts a cutting operation, reserving the full source quantity.
    /// Unlike order reservations, starting a cut requires the source to be
    /// actually available: a cut is a deliberate act, not a promise.
    #[instrument(skip(self, request), fields(source = %request.source_product_id, target = %request.target_product_id))]
    pub async fn create_operation(
        &self,
        actor_id: Uuid,
        request: CreateCuttingRequest,
    ) -> Result<cutting_operation::Model, ServiceError> {
        if request.source_product_id == request.target_product_id {
            return Err(ServiceError::ValidationError(
                "Source and target products must differ".to_string(),
            ));
        }
        if request.source_quantity <= 0 || request.target_quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Source and target quantities must be positive".to_string(),
            ));
        }
        if request.target_quantity > request.source_quantity {
            return Err(ServiceError::ValidationError(format!(
                "Planned target {} exceeds source quantity {}",
                request.target_quantity, request.source_quantity
            )));
        }

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        for product_id in [request.source_product_id, request.target_product_id] {
            ProductEntity::find_by_id(product_id)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!("Unknown product {}", product_id))
                })?;
        }

        let operation_id = Uuid::new_v4();
        let ctx = MovementContext::new(actor_id).reference("cutting_operation", operation_id);
        self.ledger
            .reserve_in(
                &txn,
                request.source_product_id,
                request.source_quantity,
                ReservePolicy::RequireAvailable,
                MovementType::CuttingOut,
                &ctx,
            )
            .await?;

        let operation = cutting_operation::ActiveModel {
            id: Set(operation_id),
            source_product_id: Set(request.source_product_id),
            target_product_id: Set(request.target_product_id),
            source_quantity: Set(request.source_quantity),
            target_quantity: Set(request.target_quantity),
            waste_quantity: Set(request.source_quantity - request.target_quantity),
            actual_target_quantity: Set(None),
            actual_second_grade_quantity: Set(None),
            actual_defect_quantity: Set(None),
            status: Set(CuttingStatus::InProgress),
            planned_date: Set(request.planned_date),
            completed_at: Set(None),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        };
        let created = operation
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            operation_id = %created.id,
            source_quantity = created.source_quantity,
            "Cutting operation started"
        );
        self.emit(Event::CuttingOperationCreated {
            operation_id: created.id,
        })
        .await;

        // Reserving the source shrinks what orders can claim.
        self.status_engine
            .recalculate_for_product(request.source_product_id)
            .await?;

        Ok(created)
    }

    pub async fn get_operation(
        &self,
        operation_id: Uuid,
    ) -> Result<cutting_operation::Model, ServiceError> {
        CuttingEntity::find_by_id(operation_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Cutting operation {} not found", operation_id))
            })
    }

    /// Completes an in-progress cut with actual outcomes: target units in,
    /// second-grade units credited to the target's graded variant, defects
    /// and any unexplained remainder recorded as audit-only movements. All
    /// stock effects commit atomically.
    #[instrument(skip(self), fields(operation_id = %operation_id))]
    pub async fn complete_operation(
        &self,
        actor_id: Uuid,
        operation_id: Uuid,
        outcome: CuttingOutcome,
    ) -> Result<cutting_operation::Model, ServiceError> {
        if outcome.target_quantity < 0
            || outcome.second_grade_quantity < 0
            || outcome.defect_quantity < 0
        {
            return Err(ServiceError::ValidationError(
                "Actual quantities must be non-negative".to_string(),
            ));
        }

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let operation = CuttingEntity::find_by_id(operation_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Cutting operation {} not found", operation_id))
            })?;
        check_cutting_transition(operation.status, CuttingStatus::Completed, operation_id)?;

        let ctx = MovementContext::new(actor_id).reference("cutting_operation", operation_id);

        // The source outflow was already recorded as `cutting_out` when the
        // operation started; here the reserved units physically leave.
        let record = locked_stock_record(&txn, operation.source_product_id).await?;
        let current_before = record.current_stock;
        let reserved_before = record.reserved_stock;
        let to_release = operation.source_quantity.min(reserved_before.max(0));
        if to_release < operation.source_quantity {
            warn!(
                operation_id = %operation_id,
                reserved = reserved_before,
                source_quantity = operation.source_quantity,
                "cutting reservation shorter than source quantity; clamping release"
            );
        }
        let mut record_active: stock_record::ActiveModel = record.into();
        record_active.current_stock = Set(current_before - operation.source_quantity);
        record_active.reserved_stock = Set(reserved_before - to_release);
        record_active.updated_at = Set(Some(Utc::now()));
        record_active
            .update(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        if outcome.target_quantity > 0 {
            self.ledger
                .adjust_in(
                    &txn,
                    operation.target_product_id,
                    outcome.target_quantity,
                    MovementType::CuttingIn,
                    &ctx,
                )
                .await?;
        }

        let mut variant_id = None;
        if outcome.second_grade_quantity > 0 {
            let target = ProductEntity::find_by_id(operation.target_product_id)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!(
                        "Product {} not found",
                        operation.target_product_id
                    ))
                })?;
            let variant = self
                .products
                .find_or_create_second_grade_in(&txn, &target)
                .await?;
            self.ledger
                .adjust_in(
                    &txn,
                    variant.id,
                    outcome.second_grade_quantity,
                    MovementType::CuttingIn,
                    &ctx,
                )
                .await?;
            variant_id = Some(variant.id);
        }

        if outcome.defect_quantity > 0 {
            // Audit only: defective pieces never enter the target's pool.
            record_movement(
                &txn,
                operation.target_product_id,
                MovementType::CuttingDefect,
                -outcome.defect_quantity,
                &ctx,
            )
            .await?;
        }

        let accounted = outcome.target_quantity
            + outcome.second_grade_quantity
            + outcome.defect_quantity;
        let remainder = operation.source_quantity - accounted;
        if remainder != 0 {
            warn!(
                operation_id = %operation_id,
                source_quantity = operation.source_quantity,
                accounted = accounted,
                remainder = remainder,
                "cutting outcome does not account for full source quantity"
            );
            let variance_ctx = ctx.clone().note(format!(
                "{} of {} source units unaccounted after cut",
                remainder, operation.source_quantity
            ));
            record_movement(
                &txn,
                operation.source_product_id,
                MovementType::CuttingVariance,
                remainder,
                &variance_ctx,
            )
            .await?;
        }

        let source_product_id = operation.source_product_id;
        let target_product_id = operation.target_product_id;
        let mut active: cutting_operation::ActiveModel = operation.into();
        active.actual_target_quantity = Set(Some(outcome.target_quantity));
        active.actual_second_grade_quantity = Set(Some(outcome.second_grade_quantity));
        active.actual_defect_quantity = Set(Some(outcome.defect_quantity));
        active.status = Set(CuttingStatus::Completed);
        active.completed_at = Set(Some(Utc::now()));
        active.updated_at = Set(Some(Utc::now()));
        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            operation_id = %operation_id,
            target = outcome.target_quantity,
            second_grade = outcome.second_grade_quantity,
            defect = outcome.defect_quantity,
            "Cutting operation completed"
        );
        self.emit(Event::CuttingOperationCompleted {
            operation_id,
            source_product_id,
            target_product_id,
        })
        .await;

        self.status_engine
            .recalculate_for_product(source_product_id)
            .await?;
        self.status_engine
            .recalculate_for_product(target_product_id)
            .await?;
        if let Some(variant_id) = variant_id {
            self.status_engine.recalculate_for_product(variant_id).await?;
        }

        Ok(updated)
    }

    /// Cancels an operation and hands the reserved source units back.
    #[instrument(skip(self), fields(operation_id = %operation_id))]
    pub async fn cancel_operation(
        &self,
        actor_id: Uuid,
        operation_id: Uuid,
    ) -> Result<cutting_operation::Model, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let operation = CuttingEntity::find_by_id(operation_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Cutting operation {} not found", operation_id))
            })?;
        check_cutting_transition(operation.status, CuttingStatus::Cancelled, operation_id)?;

        let ctx = MovementContext::new(actor_id).reference("cutting_operation", operation_id);
        self.ledger
            .release_in(&txn, operation.source_product_id, operation.source_quantity, &ctx)
            .await?;

        let source_product_id = operation.source_product_id;
        let mut active: cutting_operation::ActiveModel = operation.into();
        active.status = Set(CuttingStatus::Cancelled);
        active.updated_at = Set(Some(Utc::now()));
        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(operation_id = %operation_id, "Cutting operation cancelled");
        self.emit(Event::CuttingOperationCancelled { operation_id })
            .await;

        self.status_engine
            .recalculate_for_product(source_product_id)
            .await?;

        Ok(updated)
    }

    #[instrument(skip(self), fields(operation_id = %operation_id))]
    pub async fn pause_operation(
        &self,
        operation_id: Uuid,
    ) -> Result<cutting_operation::Model, ServiceError> {
        self.set_status_only(operation_id, CuttingStatus::Paused)
            .await
    }

    /// Resumes a paused or cancelled operation. Resuming from cancelled
    /// re-reserves the source quantity, which fails if the units have been
    /// claimed in the meantime.
    #[instrument(skip(self), fields(operation_id = %operation_id))]
    pub async fn resume_operation(
        &self,
        actor_id: Uuid,
        operation_id: Uuid,
    ) -> Result<cutting_operation::Model, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let operation = CuttingEntity::find_by_id(operation_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Cutting operation {} not found", operation_id))
            })?;
        check_cutting_transition(operation.status, CuttingStatus::InProgress, operation_id)?;

        let was_cancelled = operation.status == CuttingStatus::Cancelled;
        if was_cancelled {
            let ctx = MovementContext::new(actor_id).reference("cutting_operation", operation_id);
            self.ledger
                .reserve_in(
                    &txn,
                    operation.source_product_id,
                    operation.source_quantity,
                    ReservePolicy::RequireAvailable,
                    MovementType::CuttingOut,
                    &ctx,
                )
                .await?;
        }

        let source_product_id = operation.source_product_id;
        let mut active: cutting_operation::ActiveModel = operation.into();
        active.status = Set(CuttingStatus::InProgress);
        active.updated_at = Set(Some(Utc::now()));
        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(operation_id = %operation_id, "Cutting operation resumed");
        if was_cancelled {
            self.status_engine
                .recalculate_for_product(source_product_id)
                .await?;
        }
        Ok(updated)
    }

    async fn set_status_only(
        &self,
        operation_id: Uuid,
        new_status: CuttingStatus,
    ) -> Result<cutting_operation::Model, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let operation = CuttingEntity::find_by_id(operation_id)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Cutting operation {} not found", operation_id))
            })?;
        check_cutting_transition(operation.status, new_status, operation_id)?;

        let mut active: cutting_operation::ActiveModel = operation.into();
        active.status = Set(new_status);
        active.updated_at = Set(Some(Utc::now()));
        let updated = active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(updated)
    }
}

/// Source units reserved by live (in-progress or paused) cutting operations
/// for one product. These are legitimate reservations the order ledger does
/// not know about; the consistency validator adds them to the open-order sum.
pub(crate) async fn reserved_by_open_cutting<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<i32, ServiceError> {
    let operations = CuttingEntity::find()
        .filter(cutting_operation::Column::SourceProductId.eq(product_id))
        .filter(
            cutting_operation::Column::Status
                .is_in([CuttingStatus::InProgress, CuttingStatus::Paused]),
        )
        .all(conn)
        .await
        .map_err(ServiceError::db_error)?;
    Ok(operations.iter().map(|o| o.source_quantity).sum())
}

/// Completed cuts are frozen; a cancelled cut may be resumed (its stock
/// effects are re-applied on resume).
fn check_cutting_transition(
    from: CuttingStatus,
    to: CuttingStatus,
    operation_id: Uuid,
) -> Result<(), ServiceError> {
    use CuttingStatus::*;

    if from == Completed {
        return Err(ServiceError::IrreversibleState(format!(
            "Cutting operation {} is completed and cannot change status",
            operation_id
        )));
    }

    let allowed = matches!(
        (from, to),
        (InProgress, Paused)
            | (InProgress, Completed)
            | (InProgress, Cancelled)
            | (Paused, InProgress)
            | (Paused, Cancelled)
            | (Cancelled, InProgress)
    );
    if allowed {
        Ok(())
    } else {
        Err(ServiceError::ValidationError(format!(
            "Cutting operation {} cannot go from {} to {}",
            operation_id, from, to
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CuttingStatus::*;

    #[test]
    fn transitions_follow_the_lattice() {
        let id = Uuid::new_v4();
        assert!(check_cutting_transition(InProgress, Paused, id).is_ok());
        assert!(check_cutting_transition(InProgress, Completed, id).is_ok());
        assert!(check_cutting_transition(InProgress, Cancelled, id).is_ok());
        assert!(check_cutting_transition(Paused, InProgress, id).is_ok());
        assert!(check_cutting_transition(Cancelled, InProgress, id).is_ok());

        assert!(matches!(
            check_cutting_transition(Paused, Completed, id),
            Err(ServiceError::ValidationError(_))
        ));
        assert!(matches!(
            check_cutting_transition(Cancelled, Completed, id),
            Err(ServiceError::ValidationError(_))
        ));
    }

    #[test]
    fn completed_operations_are_frozen() {
        let id = Uuid::new_v4();
        for to in [InProgress, Paused, Cancelled, Completed] {
            assert!(matches!(
                check_cutting_transition(Completed, to, id),
                Err(ServiceError::IrreversibleState(_))
            ));
        }
    }
}
