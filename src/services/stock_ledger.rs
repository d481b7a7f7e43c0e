//! Stock ledger: the only code allowed to mutate `stock_records`.
//!
//! Every primitive takes a row lock, applies a read-modify-write, and
//! appends one audit movement, all on the connection it is given. The
//! `*_in` variants run on a caller-supplied transaction so multi-product
//! operations (cutting completion, shipment completion) commit atomically.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ConnectionTrait, EntityTrait, Set, TransactionTrait};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, DbPool};
use crate::entities::stock_movement::{self, MovementType};
use crate::entities::stock_record;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Reserved audit identity for corrections applied by the system itself.
pub const SYSTEM_ACTOR_ID: Uuid = Uuid::nil();

/// How `reserve` treats insufficient availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservePolicy {
    /// Reserve the full amount even if available stock goes negative.
    /// Over-reservation is a recorded business state, not a failure.
    AllowNegative,
    /// Refuse unless the full amount is available.
    RequireAvailable,
    /// Reserve at most what is available (never below zero).
    ClampToAvailable,
}

#[derive(Debug, Clone, Copy)]
pub struct ReserveOutcome {
    pub granted: i32,
    pub available_before: i32,
}

/// Audit attribution carried alongside every stock mutation.
#[derive(Debug, Clone, Default)]
pub struct MovementContext {
    pub actor_id: Uuid,
    pub reference_type: Option<String>,
    pub reference_id: Option<Uuid>,
    pub note: Option<String>,
}

impl MovementContext {
    pub fn new(actor_id: Uuid) -> Self {
        Self {
            actor_id,
            ..Default::default()
        }
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_ACTOR_ID)
    }

    pub fn reference(mut self, kind: &str, id: Uuid) -> Self {
        self.reference_type = Some(kind.to_string());
        self.reference_id = Some(id);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Fetches the stock record under a write lock. Must run inside the
/// transaction that will modify the record.
pub(crate) async fn locked_stock_record<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<stock_record::Model, ServiceError> {
    let backend = conn.get_database_backend();
    db::locked_for_update(stock_record::Entity::find_by_id(product_id), backend)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("No stock record for product {}", product_id)))
}

/// Appends one audit row. Movements are write-once.
pub(crate) async fn record_movement<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    movement_type: MovementType,
    quantity: i32,
    ctx: &MovementContext,
) -> Result<(), ServiceError> {
    let row = stock_movement::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(product_id),
        movement_type: Set(movement_type),
        quantity: Set(quantity),
        reference_type: Set(ctx.reference_type.clone()),
        reference_id: Set(ctx.reference_id),
        actor_id: Set(ctx.actor_id),
        note: Set(ctx.note.clone()),
        created_at: Set(Utc::now()),
    };
    row.insert(conn).await.map_err(ServiceError::db_error)?;
    Ok(())
}

#[derive(Clone)]
pub struct StockLedger {
    db: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl StockLedger {
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

    /// Adjusts physical stock by `delta` inside the given transaction.
    pub async fn adjust_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        delta: i32,
        movement_type: MovementType,
        ctx: &MovementContext,
    ) -> Result<stock_record::Model, ServiceError> {
        let record = locked_stock_record(conn, product_id).await?;
        let new_current = record.current_stock + delta;

        let mut active: stock_record::ActiveModel = record.into();
        active.current_stock = Set(new_current);
        active.updated_at = Set(Some(Utc::now()));
        let updated = active.update(conn).await.map_err(ServiceError::db_error)?;

        record_movement(conn, product_id, movement_type, delta, ctx).await?;
        Ok(updated)
    }

    /// Adjusts physical stock by `delta` in its own transaction.
    #[instrument(skip(self, ctx), fields(product_id = %product_id, delta = delta))]
    pub async fn adjust(
        &self,
        product_id: Uuid,
        delta: i32,
        movement_type: MovementType,
        ctx: MovementContext,
    ) -> Result<stock_record::Model, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let updated = self
            .adjust_in(&txn, product_id, delta, movement_type, &ctx)
            .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            product_id = %product_id,
            delta = delta,
            current_stock = updated.current_stock,
            "Stock adjusted"
        );
        self.emit(Event::StockAdjusted {
            product_id,
            delta,
            current_stock: updated.current_stock,
        })
        .await;
        Ok(updated)
    }

    /// Reserves `amount` units inside the given transaction. The movement
    /// type is parameterized so cutting can record its reservation as
    /// `cutting_out` per the audit conventions.
    pub async fn reserve_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        amount: i32,
        policy: ReservePolicy,
        movement_type: MovementType,
        ctx: &MovementContext,
    ) -> Result<ReserveOutcome, ServiceError> {
        if amount < 0 {
            return Err(ServiceError::ValidationError(format!(
                "Reserve amount must be non-negative, got {}",
                amount
            )));
        }

        let record = locked_stock_record(conn, product_id).await?;
        let available_before = record.available();
        let reserved_before = record.reserved_stock;

        let granted = match policy {
            ReservePolicy::AllowNegative => amount,
            ReservePolicy::RequireAvailable => {
                if available_before < amount {
                    return Err(ServiceError::ValidationError(format!(
                        "Insufficient stock for product {}: requested {}, available {}",
                        product_id, amount, available_before
                    )));
                }
                amount
            }
            ReservePolicy::ClampToAvailable => amount.min(available_before.max(0)),
        };

        if granted != 0 {
            let mut active: stock_record::ActiveModel = record.into();
            active.reserved_stock = Set(reserved_before + granted);
            active.updated_at = Set(Some(Utc::now()));
            active.update(conn).await.map_err(ServiceError::db_error)?;

            record_movement(conn, product_id, movement_type, -granted, ctx).await?;
        }

        Ok(ReserveOutcome {
            granted,
            available_before,
        })
    }

    /// Reserves in its own transaction.
    #[instrument(skip(self, ctx), fields(product_id = %product_id, amount = amount))]
    pub async fn reserve(
        &self,
        product_id: Uuid,
        amount: i32,
        policy: ReservePolicy,
        ctx: MovementContext,
    ) -> Result<ReserveOutcome, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let outcome = self
            .reserve_in(&txn, product_id, amount, policy, MovementType::Reserve, &ctx)
            .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            product_id = %product_id,
            granted = outcome.granted,
            available_before = outcome.available_before,
            "Stock reserved"
        );
        Ok(outcome)
    }

    /// Releases up to `amount` reserved units inside the given transaction.
    /// Returns the amount actually released; a shortfall is logged as drift
    /// for the consistency validator rather than failing the release.
    pub async fn release_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        amount: i32,
        ctx: &MovementContext,
    ) -> Result<i32, ServiceError> {
        if amount < 0 {
            return Err(ServiceError::ValidationError(format!(
                "Release amount must be non-negative, got {}",
                amount
            )));
        }
        if amount == 0 {
            return Ok(0);
        }

        let record = locked_stock_record(conn, product_id).await?;
        let reserved_before = record.reserved_stock;
        let released = amount.min(reserved_before.max(0));
        if released < amount {
            warn!(
                product_id = %product_id,
                requested = amount,
                reserved = reserved_before,
                "release exceeds reserved stock; clamping"
            );
        }

        let mut active: stock_record::ActiveModel = record.into();
        active.reserved_stock = Set(reserved_before - released);
        active.updated_at = Set(Some(Utc::now()));
        active.update(conn).await.map_err(ServiceError::db_error)?;

        record_movement(conn, product_id, MovementType::Release, released, ctx).await?;
        Ok(released)
    }

    /// Releases in its own transaction.
    #[instrument(skip(self, ctx), fields(product_id = %product_id, amount = amount))]
    pub async fn release(
        &self,
        product_id: Uuid,
        amount: i32,
        ctx: MovementContext,
    ) -> Result<i32, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let released = self.release_in(&txn, product_id, amount, &ctx).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(product_id = %product_id, released = released, "Reservation released");
        Ok(released)
    }

    /// Current counters for a product.
    pub async fn get(&self, product_id: Uuid) -> Result<stock_record::Model, ServiceError> {
        stock_record::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No stock record for product {}", product_id))
            })
    }
}
