use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical handling stage of an outbound preshipment.
///
/// Stages advance strictly forward; `OnHold` is a side-state reachable
/// from any non-terminal stage, and `Shipped`/`Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum Stage {
    #[sea_orm(string_value = "Planning")]
    Planning,
    #[sea_orm(string_value = "Picking")]
    Picking,
    #[sea_orm(string_value = "Packing")]
    Packing,
    #[sea_orm(string_value = "Loading")]
    Loading,
    #[sea_orm(string_value = "ReadyToShip")]
    ReadyToShip,
    #[sea_orm(string_value = "Staged")]
    Staged,
    #[sea_orm(string_value = "Shipped")]
    Shipped,
    #[sea_orm(string_value = "OnHold")]
    OnHold,
    #[sea_orm(string_value = "Cancelled")]
    Cancelled,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Planning => write!(f, "Planning"),
            Stage::Picking => write!(f, "Picking"),
            Stage::Packing => write!(f, "Packing"),
            Stage::Loading => write!(f, "Loading"),
            Stage::ReadyToShip => write!(f, "Ready to Ship"),
            Stage::Staged => write!(f, "Staged"),
            Stage::Shipped => write!(f, "Shipped"),
            Stage::OnHold => write!(f, "On Hold"),
            Stage::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl Stage {
    /// The next stage in the physical handling sequence. `Staged` has no
    /// successor here; only driver signoff moves a shipment to `Shipped`.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Planning => Some(Stage::Picking),
            Stage::Picking => Some(Stage::Packing),
            Stage::Packing => Some(Stage::Loading),
            Stage::Loading => Some(Stage::ReadyToShip),
            Stage::ReadyToShip => Some(Stage::Staged),
            Stage::Staged | Stage::Shipped | Stage::OnHold | Stage::Cancelled => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Shipped | Stage::Cancelled)
    }

    /// Whether requested quantities of this preshipment still count
    /// against available-to-promise.
    pub fn counts_toward_allocation(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_hold(self) -> bool {
        !self.is_terminal() && self != Stage::OnHold
    }

    pub fn can_cancel(self) -> bool {
        !self.is_terminal()
    }

    /// Label generation is allowed once the shipment has reached the
    /// loading dock and until it leaves the building.
    pub fn allows_label_generation(self) -> bool {
        matches!(self, Stage::Loading | Stage::ReadyToShip | Stage::Staged)
    }

    pub fn allows_driver_signoff(self) -> bool {
        matches!(self, Stage::ReadyToShip | Stage::Staged)
    }

    /// Line items are frozen once physical handling is underway.
    pub fn allows_item_changes(self) -> bool {
        matches!(self, Stage::Planning | Stage::Picking)
    }
}

/// Regulatory entry-summary filing status, orthogonal to [`Stage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum EntrySummaryStatus {
    #[sea_orm(string_value = "NOT_PREPARED")]
    NotPrepared,
    #[sea_orm(string_value = "DRAFT")]
    Draft,
    #[sea_orm(string_value = "READY_TO_FILE")]
    ReadyToFile,
    #[sea_orm(string_value = "FILED")]
    Filed,
    #[sea_orm(string_value = "ACCEPTED")]
    Accepted,
    #[sea_orm(string_value = "REJECTED")]
    Rejected,
}

impl fmt::Display for EntrySummaryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntrySummaryStatus::NotPrepared => write!(f, "NOT_PREPARED"),
            EntrySummaryStatus::Draft => write!(f, "DRAFT"),
            EntrySummaryStatus::ReadyToFile => write!(f, "READY_TO_FILE"),
            EntrySummaryStatus::Filed => write!(f, "FILED"),
            EntrySummaryStatus::Accepted => write!(f, "ACCEPTED"),
            EntrySummaryStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

impl EntrySummaryStatus {
    /// The filing status transition table. `Rejected` may be reopened to
    /// `Draft` for correction; `Accepted` is final.
    pub fn can_transition_to(self, next: EntrySummaryStatus) -> bool {
        matches!(
            (self, next),
            (EntrySummaryStatus::NotPrepared, EntrySummaryStatus::Draft)
                | (EntrySummaryStatus::Draft, EntrySummaryStatus::ReadyToFile)
                | (EntrySummaryStatus::ReadyToFile, EntrySummaryStatus::Filed)
                | (EntrySummaryStatus::Filed, EntrySummaryStatus::Accepted)
                | (EntrySummaryStatus::Filed, EntrySummaryStatus::Rejected)
                | (EntrySummaryStatus::Rejected, EntrySummaryStatus::Draft)
        )
    }

    pub fn allows_filing(self) -> bool {
        self == EntrySummaryStatus::ReadyToFile
    }

    /// Regulatory identifiers stay editable until the entry is filed.
    pub fn allows_regulatory_edits(self) -> bool {
        matches!(
            self,
            EntrySummaryStatus::NotPrepared
                | EntrySummaryStatus::Draft
                | EntrySummaryStatus::ReadyToFile
                | EntrySummaryStatus::Rejected
        )
    }
}

/// An outbound shipment record under preparation. Line-item quantities
/// are commitments against on-hand inventory, not inventory truth.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "preshipments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Caller-supplied shipment identifier, unique across the system.
    #[sea_orm(unique)]
    pub shipment_id: String,

    pub customer_id: Uuid,

    pub stage: Stage,

    /// The stage this shipment was held from, set while `stage` is
    /// `OnHold` so that release can restore it.
    pub held_from_stage: Option<Stage>,

    pub entry_summary_status: EntrySummaryStatus,

    pub filing_district_port: Option<String>,

    pub entry_filer_code: Option<String>,

    /// SCAC carrier code.
    pub carrier_code: Option<String>,

    pub importer_of_record: Option<String>,

    pub weekly_entry: bool,

    pub zone_week_ending_date: Option<NaiveDate>,

    pub priority: i32,

    pub driver_name: Option<String>,

    pub driver_license: Option<String>,

    pub vehicle_plate: Option<String>,

    pub carrier_name: Option<String>,

    pub signature: Option<String>,

    pub shipped_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::preshipment_item::Entity")]
    PreshipmentItems,
}

impl Related<super::preshipment_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PreshipmentItems.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C: ConnectionTrait>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        let now = Utc::now();
        if insert {
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(now);
            }
        }
        active_model.updated_at = Set(now);
        Ok(active_model)
    }
}
