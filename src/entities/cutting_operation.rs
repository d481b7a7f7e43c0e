use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum CuttingStatus {
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "paused")]
    Paused,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl fmt::Display for CuttingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CuttingStatus::InProgress => "in_progress",
            CuttingStatus::Paused => "paused",
            CuttingStatus::Completed => "completed",
            CuttingStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A lossy transformation of one product's stock into another's.
///
/// Source stock is reserved at creation and consumed at completion; target
/// stock (primary and second grade) appears only at completion. Planned
/// figures are set up front, actual figures when the work is closed out.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cutting_operations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub source_product_id: Uuid,
    pub target_product_id: Uuid,
    pub source_quantity: i32,
    pub target_quantity: i32,
    pub waste_quantity: i32,
    pub actual_target_quantity: Option<i32>,
    pub actual_second_grade_quantity: Option<i32>,
    pub actual_defect_quantity: Option<i32>,
    pub status: CuttingStatus,
    pub planned_date: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::SourceProductId",
        to = "super::product::Column::Id"
    )]
    SourceProduct,
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::TargetProductId",
        to = "super::product::Column::Id"
    )]
    TargetProduct,
}

impl ActiveModelBehavior for ActiveModel {}
