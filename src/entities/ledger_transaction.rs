use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of ledger transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum TransactionKind {
    #[sea_orm(string_value = "receipt")]
    Receipt,
    #[sea_orm(string_value = "shipment")]
    Shipment,
    #[sea_orm(string_value = "adjustment")]
    Adjustment,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Receipt => write!(f, "receipt"),
            TransactionKind::Shipment => write!(f, "shipment"),
            TransactionKind::Adjustment => write!(f, "adjustment"),
        }
    }
}

/// An immutable, append-only ledger entry. Once written, a row is never
/// updated or deleted; the lot's quantity is the sum of its deltas.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ledger_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub lot_id: Uuid,

    /// Signed quantity delta. Receipts are positive, shipments negative,
    /// adjustments either.
    pub quantity: i32,

    pub kind: TransactionKind,

    /// External reference (shipment identifier, receiving document, ...).
    pub reference: Option<String>,

    pub notes: Option<String>,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::lot::Entity",
        from = "Column::LotId",
        to = "super::lot::Column::Id"
    )]
    Lot,
}

impl Related<super::lot::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lot.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, _insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        if let ActiveValue::NotSet = active_model.created_at {
            active_model.created_at = Set(Utc::now());
        }
        Ok(active_model)
    }
}
