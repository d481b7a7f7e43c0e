//! Named monotonic counters.
//!
//! `next_value` increments a `number_sequences` row under a row lock inside
//! the caller's transaction, so two concurrent allocations serialize and the
//! returned values are unique without insert-and-retry loops.

use sea_orm::{ActiveModelTrait, ConnectionTrait, EntityTrait, Set};

use crate::db;
use crate::entities::number_sequence::{self, Entity as NumberSequenceEntity};
use crate::errors::ServiceError;

pub const ORDER_NUMBER_SEQ: &str = "order_number";
pub const SHIPMENT_NUMBER_SEQ: &str = "shipment_number";

/// Returns the next value of the named sequence. The well-known counters are
/// seeded by the migrations; the insert branch only covers ad-hoc names.
/// Must be called inside the transaction that consumes the number, so a
/// rollback returns the value to the gap it would otherwise leave.
pub async fn next_value<C: ConnectionTrait>(conn: &C, name: &str) -> Result<i64, ServiceError> {
    let backend = conn.get_database_backend();

    let existing = db::locked_for_update(
        NumberSequenceEntity::find_by_id(name.to_string()),
        backend,
    )
    .one(conn)
    .await
    .map_err(ServiceError::db_error)?;

    match existing {
        Some(row) => {
            let next = row.value + 1;
            let mut active: number_sequence::ActiveModel = row.into();
            active.value = Set(next);
            active.update(conn).await.map_err(ServiceError::db_error)?;
            Ok(next)
        }
        None => {
            let row = number_sequence::ActiveModel {
                name: Set(name.to_string()),
                value: Set(1),
            };
            row.insert(conn).await.map_err(ServiceError::db_error)?;
            Ok(1)
        }
    }
}
