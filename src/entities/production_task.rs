use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum ProductionTaskStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "paused")]
    Paused,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl ProductionTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProductionTaskStatus::Completed | ProductionTaskStatus::Cancelled
        )
    }

    /// Statuses that count toward "in production" for status derivation.
    pub const OPEN: [ProductionTaskStatus; 3] = [
        ProductionTaskStatus::Pending,
        ProductionTaskStatus::InProgress,
        ProductionTaskStatus::Paused,
    ];
}

impl fmt::Display for ProductionTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProductionTaskStatus::Pending => "pending",
            ProductionTaskStatus::InProgress => "in_progress",
            ProductionTaskStatus::Paused => "paused",
            ProductionTaskStatus::Completed => "completed",
            ProductionTaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "production_tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    pub requested_quantity: i32,
    /// Order that prompted the task, when queued for a specific shortfall.
    pub order_id: Option<Uuid>,
    pub status: ProductionTaskStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
