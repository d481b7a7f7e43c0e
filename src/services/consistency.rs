//! Consistency validator: audits the cached `reserved_stock` counters
//! against what legitimately holds reservations (open-order items plus
//! live cutting operations), repairs drift, and reports stock health.
//! Read paths never mutate; repairs run one product per transaction so a
//! single bad row cannot block the rest.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::StockThresholds;
use crate::db::{self, DbPool};
use crate::entities::order::{self, Entity as OrderEntity, OrderStatus};
use crate::entities::stock_movement::MovementType;
use crate::entities::stock_record::{self, Entity as StockRecordEntity};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::cutting;
use crate::services::order_status::OrderStatusEngine;
use crate::services::reservations::ReservationManager;
use crate::services::stock_ledger::{locked_stock_record, record_movement, MovementContext};

/// Health classification of one product's stock counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StockHealth {
    Normal,
    Low,
    Critical,
    /// More is promised than physically exists. A legitimate business
    /// state, surfaced so someone queues production.
    Negative,
    /// The counters themselves are wrong: negative values or a reserved
    /// cache that disagrees with what open orders and live cuts actually
    /// hold.
    InvalidData,
}

pub fn classify(
    current_stock: i32,
    reserved_stock: i32,
    expected_reserved: i32,
    thresholds: &StockThresholds,
) -> StockHealth {
    if current_stock < 0 || reserved_stock < 0 || reserved_stock != expected_reserved {
        return StockHealth::InvalidData;
    }
    let available = current_stock - reserved_stock;
    if available < 0 {
        StockHealth::Negative
    } else if available <= thresholds.critical {
        StockHealth::Critical
    } else if available <= thresholds.low {
        StockHealth::Low
    } else {
        StockHealth::Normal
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StockViolation {
    pub product_id: Uuid,
    pub health: StockHealth,
    pub current_stock: i32,
    pub reserved_stock: i32,
    pub reserved_from_orders: i32,
    pub reserved_from_cutting: i32,
    pub explanation: String,
}

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub checked: usize,
    pub valid: usize,
    pub violations: Vec<StockViolation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StockCorrection {
    pub product_id: Uuid,
    pub old_reserved: i32,
    pub new_reserved: i32,
}

#[derive(Debug, Serialize)]
pub struct FixReport {
    pub checked: usize,
    pub corrected: Vec<StockCorrection>,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub orders_checked: usize,
    pub orders_changed: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct StockStatistics {
    pub total: usize,
    pub normal: usize,
    pub low: usize,
    pub critical: usize,
    pub negative: usize,
    pub invalid_data: usize,
}

#[derive(Clone)]
pub struct ConsistencyValidator {
    db: Arc<DbPool>,
    reservations: ReservationManager,
    status_engine: OrderStatusEngine,
    thresholds: StockThresholds,
    event_sender: Option<Arc<EventSender>>,
}

impl ConsistencyValidator {
    pub fn new(
        db: Arc<DbPool>,
        reservations: ReservationManager,
        status_engine: OrderStatusEngine,
        thresholds: StockThresholds,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db,
            reservations,
            status_engine,
            thresholds,
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

    /// Audits every stock record without mutating anything.
    #[instrument(skip(self))]
    pub async fn validate_all_stock(&self) -> Result<ValidationReport, ServiceError> {
        let db = &*self.db;
        let records = StockRecordEntity::find()
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut violations = Vec::new();
        let checked = records.len();
        for record in records {
            let reserved_from_orders =
                ReservationManager::reserved_by_open_orders(db, record.product_id).await?;
            let reserved_from_cutting =
                cutting::reserved_by_open_cutting(db, record.product_id).await?;
            let expected = reserved_from_orders + reserved_from_cutting;
            let health = classify(
                record.current_stock,
                record.reserved_stock,
                expected,
                &self.thresholds,
            );
            if health == StockHealth::Normal {
                continue;
            }
            violations.push(StockViolation {
                product_id: record.product_id,
                health,
                current_stock: record.current_stock,
                reserved_stock: record.reserved_stock,
                reserved_from_orders,
                reserved_from_cutting,
                explanation: explain(&record, expected, health),
            });
        }

        let valid = checked - violations.len();
        info!(checked = checked, violations = violations.len(), "Stock validated");
        Ok(ValidationReport {
            checked,
            valid,
            violations,
        })
    }

    /// Rewrites each drifted `reserved_stock` cache to the sum actually held
    /// by open orders and live cutting operations, one product per
    /// transaction. A failed product is reported and skipped; the rest are
    /// still repaired.
    #[instrument(skip(self))]
    pub async fn fix_stock_inconsistencies(
        &self,
        acting_user_id: Uuid,
    ) -> Result<FixReport, ServiceError> {
        let records = StockRecordEntity::find()
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let checked = records.len();
        let mut corrected = Vec::new();
        let mut errors = Vec::new();
        for record in records {
            // Repairs race with live traffic holding the same row locks.
            let attempt = db::retry_on_conflict(3, || {
                self.fix_one(acting_user_id, record.product_id)
            })
            .await;
            match attempt {
                Ok(Some(correction)) => corrected.push(correction),
                Ok(None) => {}
                Err(e) => {
                    error!(product_id = %record.product_id, error = %e, "stock fix failed");
                    errors.push(format!("product {}: {}", record.product_id, e));
                }
            }
        }

        info!(
            checked = checked,
            corrected = corrected.len(),
            errors = errors.len(),
            "Stock inconsistency fix finished"
        );
        Ok(FixReport {
            checked,
            corrected,
            errors,
        })
    }

    async fn fix_one(
        &self,
        acting_user_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<StockCorrection>, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        // Re-read under lock: the snapshot taken for the product list may
        // already be stale.
        let record = locked_stock_record(&txn, product_id).await?;
        let authoritative = ReservationManager::reserved_by_open_orders(&txn, product_id).await?
            + cutting::reserved_by_open_cutting(&txn, product_id).await?;
        let old_reserved = record.reserved_stock;
        if old_reserved == authoritative {
            return Ok(None);
        }

        let mut active: stock_record::ActiveModel = record.into();
        active.reserved_stock = Set(authoritative);
        active.updated_at = Set(Some(Utc::now()));
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        let ctx = MovementContext::new(acting_user_id).note(format!(
            "reserved cache corrected from {} to {}",
            old_reserved, authoritative
        ));
        record_movement(
            &txn,
            product_id,
            MovementType::SystemFix,
            old_reserved - authoritative,
            &ctx,
        )
        .await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        warn!(
            product_id = %product_id,
            old_reserved = old_reserved,
            new_reserved = authoritative,
            "Reserved stock cache corrected"
        );
        self.emit(Event::StockCorrectionApplied {
            product_id,
            old_reserved,
            new_reserved: authoritative,
        })
        .await;

        Ok(Some(StockCorrection {
            product_id,
            old_reserved,
            new_reserved: authoritative,
        }))
    }

    /// Re-runs allocation for every open order, oldest first, then
    /// re-derives the orders whose reservations moved. Orders attached to a
    /// shipment are skipped: their reservations are a frozen snapshot until
    /// the shipment resolves. Idempotent: a second run reports zero changes.
    #[instrument(skip(self))]
    pub async fn sync_reservations_with_orders(
        &self,
        acting_user_id: Uuid,
    ) -> Result<SyncReport, ServiceError> {
        let open_orders = OrderEntity::find()
            .filter(order::Column::Status.is_in(OrderStatus::OPEN))
            .filter(order::Column::ShipmentId.is_null())
            .order_by_asc(order::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let orders_checked = open_orders.len();
        let mut changed_ids = Vec::new();
        for open_order in open_orders {
            let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
            let outcomes = self
                .reservations
                .reserve_for_order_in(&txn, open_order.id, acting_user_id)
                .await?;
            txn.commit().await.map_err(ServiceError::db_error)?;

            if outcomes.iter().any(|o| o.delta != 0) {
                changed_ids.push(open_order.id);
            }
        }

        for order_id in &changed_ids {
            self.status_engine.recalculate_order(*order_id).await?;
        }

        info!(
            orders_checked = orders_checked,
            orders_changed = changed_ids.len(),
            "Reservations synced with orders"
        );
        Ok(SyncReport {
            orders_checked,
            orders_changed: changed_ids.len(),
        })
    }

    /// Health counts across all stock records.
    #[instrument(skip(self))]
    pub async fn get_stock_statistics(&self) -> Result<StockStatistics, ServiceError> {
        let db = &*self.db;
        let records = StockRecordEntity::find()
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut stats = StockStatistics {
            total: records.len(),
            ..Default::default()
        };
        for record in records {
            let expected = ReservationManager::reserved_by_open_orders(db, record.product_id)
                .await?
                + cutting::reserved_by_open_cutting(db, record.product_id).await?;
            match classify(
                record.current_stock,
                record.reserved_stock,
                expected,
                &self.thresholds,
            ) {
                StockHealth::Normal => stats.normal += 1,
                StockHealth::Low => stats.low += 1,
                StockHealth::Critical => stats.critical += 1,
                StockHealth::Negative => stats.negative += 1,
                StockHealth::InvalidData => stats.invalid_data += 1,
            }
        }
        Ok(stats)
    }
}

fn explain(record: &stock_record::Model, expected_reserved: i32, health: StockHealth) -> String {
    match health {
        StockHealth::InvalidData => {
            if record.current_stock < 0 {
                format!("current stock is negative ({})", record.current_stock)
            } else if record.reserved_stock < 0 {
                format!("reserved stock is negative ({})", record.reserved_stock)
            } else {
                format!(
                    "reserved cache {} disagrees with open-order and cutting reservations {}",
                    record.reserved_stock, expected_reserved
                )
            }
        }
        StockHealth::Negative => format!(
            "over-reserved: {} available ({} on hand, {} promised)",
            record.available(),
            record.current_stock,
            record.reserved_stock
        ),
        StockHealth::Critical => format!("available stock critical ({})", record.available()),
        StockHealth::Low => format!("available stock low ({})", record.available()),
        StockHealth::Normal => String::new(),
    }
}
