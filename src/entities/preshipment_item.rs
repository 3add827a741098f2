use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One line item of a preshipment: a requested quantity of a part,
/// optionally pinned to a specific lot. The quantity here is a
/// commitment against on-hand inventory, not inventory truth.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "preshipment_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub preshipment_id: Uuid,

    pub part_id: Uuid,

    /// When set, shipment confirmation consumes exactly this lot;
    /// otherwise lots of the part are consumed oldest first.
    pub lot_id: Option<Uuid>,

    pub quantity: i32,

    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub unit_value: Decimal,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::preshipment::Entity",
        from = "Column::PreshipmentId",
        to = "super::preshipment::Column::Id",
        on_delete = "Cascade"
    )]
    Preshipment,

    #[sea_orm(
        belongs_to = "super::lot::Entity",
        from = "Column::LotId",
        to = "super::lot::Column::Id"
    )]
    Lot,
}

impl Related<super::preshipment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Preshipment.def()
    }
}

impl Related<super::lot::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lot.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
