use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of stock-affecting action behind a movement row.
///
/// Quantity sign convention: positive quantities add to a product's
/// available pool, negative quantities take from it. Reservations count as
/// movements of the available pool even though physical stock is untouched.
/// `cutting_defect` and `cutting_variance` rows are informational: they carry
/// no stock effect of their own and exist so losses are never silently
/// dropped from the trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum MovementType {
    #[sea_orm(string_value = "adjustment")]
    Adjustment,
    #[sea_orm(string_value = "reserve")]
    Reserve,
    #[sea_orm(string_value = "release")]
    Release,
    #[sea_orm(string_value = "cutting_out")]
    CuttingOut,
    #[sea_orm(string_value = "cutting_in")]
    CuttingIn,
    #[sea_orm(string_value = "cutting_defect")]
    CuttingDefect,
    #[sea_orm(string_value = "cutting_variance")]
    CuttingVariance,
    #[sea_orm(string_value = "shipment_out")]
    ShipmentOut,
    #[sea_orm(string_value = "order_out")]
    OrderOut,
    #[sea_orm(string_value = "production_in")]
    ProductionIn,
    #[sea_orm(string_value = "system_fix")]
    SystemFix,
}

impl fmt::Display for MovementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MovementType::Adjustment => "adjustment",
            MovementType::Reserve => "reserve",
            MovementType::Release => "release",
            MovementType::CuttingOut => "cutting_out",
            MovementType::CuttingIn => "cutting_in",
            MovementType::CuttingDefect => "cutting_defect",
            MovementType::CuttingVariance => "cutting_variance",
            MovementType::ShipmentOut => "shipment_out",
            MovementType::OrderOut => "order_out",
            MovementType::ProductionIn => "production_in",
            MovementType::SystemFix => "system_fix",
        };
        write!(f, "{}", s)
    }
}

/// Append-only audit trail of every stock-affecting action. Rows are
/// write-once; nothing in the system updates or deletes them.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stock_movements")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    pub movement_type: MovementType,
    pub quantity: i32,
    /// Entity kind the movement was made on behalf of ("order",
    /// "cutting_operation", "shipment", "production_task").
    pub reference_type: Option<String>,
    pub reference_id: Option<Uuid>,
    pub actor_id: Uuid,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
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
