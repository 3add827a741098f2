//! Allocation reservation: admits or rejects a preshipment's requested
//! quantities against available-to-promise inventory.
//!
//! Available-to-promise for a part is its on-hand quantity (derived from
//! the ledger) minus the quantities committed by every non-terminal
//! preshipment. The check and the subsequent write are one atomic unit:
//! a per-part advisory lock is held across the sequence and the writes
//! run inside a single database transaction, so two concurrent requests
//! can never jointly over-commit the same inventory.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, JoinType,
    ModelTrait, QueryFilter, QuerySelect, RelationTrait, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::entities::ledger_transaction::{self, Entity as LedgerTransactions};
use crate::entities::lot::{self, Entity as Lots};
use crate::entities::preshipment::{self, Entity as Preshipments, EntrySummaryStatus, Stage};
use crate::entities::preshipment_item::{self, Entity as PreshipmentItems};
use crate::errors::{CoreError, Shortfall};
use crate::events::{Event, EventSender};
use crate::services::compliance::{self, ComplianceFields};

/// Advisory locks keyed by part id. Held across every
/// check-allocation-then-write sequence, and by ledger writes, so that
/// admissions against the same part serialize.
#[derive(Default)]
pub struct PartLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl PartLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, part_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(part_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquires the locks for the given parts. Lock order is sorted part
    /// id, so overlapping acquisitions cannot deadlock.
    pub async fn acquire(&self, parts: &[Uuid]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<Uuid> = parts.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for part_id in sorted {
            guards.push(self.handle(part_id).lock_owned().await);
        }
        guards
    }
}

/// One requested line item of a preshipment.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ItemRequest {
    pub part_id: Uuid,
    /// Pin consumption to a specific lot; otherwise lots of the part are
    /// consumed oldest first at shipment confirmation.
    pub lot_id: Option<Uuid>,
    #[validate(range(min = 1, message = "requested quantity must be positive"))]
    pub quantity: i32,
    pub unit_value: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePreshipmentInput {
    #[validate(length(min = 1, max = 64, message = "shipment identifier is required"))]
    pub shipment_id: String,
    pub customer_id: Uuid,
    #[validate(length(min = 1, message = "at least one line item is required"))]
    pub items: Vec<ItemRequest>,
    pub filing_district_port: Option<String>,
    pub entry_filer_code: Option<String>,
    pub carrier_code: Option<String>,
    pub importer_of_record: Option<String>,
    #[serde(default)]
    pub weekly_entry: bool,
    pub zone_week_ending_date: Option<NaiveDate>,
    #[serde(default)]
    pub priority: i32,
}

/// Service computing available-to-promise and admitting preshipment
/// commitments against it.
#[derive(Clone)]
pub struct AllocationService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    part_locks: Arc<PartLocks>,
}

impl AllocationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        part_locks: Arc<PartLocks>,
    ) -> Self {
        Self {
            db,
            event_sender,
            part_locks,
        }
    }

    /// Sum of current quantity across all lots of a part.
    #[instrument(skip(self))]
    pub async fn on_hand(&self, part_id: Uuid) -> Result<i32, CoreError> {
        on_hand_with(&*self.db, part_id).await
    }

    /// Sum of requested quantities across every preshipment that still
    /// counts toward allocation, optionally excluding one preshipment
    /// (used when re-validating an update to itself).
    #[instrument(skip(self))]
    pub async fn committed(
        &self,
        part_id: Uuid,
        excluding: Option<Uuid>,
    ) -> Result<i32, CoreError> {
        committed_with(&*self.db, part_id, excluding).await
    }

    /// On-hand minus committed.
    #[instrument(skip(self))]
    pub async fn available_to_promise(&self, part_id: Uuid) -> Result<i32, CoreError> {
        available_to_promise_with(&*self.db, part_id, None).await
    }

    /// On-hand quantity of a part valued at each lot's unit value.
    #[instrument(skip(self))]
    pub async fn on_hand_value(&self, part_id: Uuid) -> Result<Decimal, CoreError> {
        let lots = Lots::find()
            .filter(lot::Column::PartId.eq(part_id))
            .all(&*self.db)
            .await?;

        let mut value = Decimal::ZERO;
        for l in lots {
            let balance = crate::services::ledger::lot_balance(&*self.db, l.id).await?;
            value += Decimal::from(balance) * l.unit_value;
        }
        Ok(value)
    }

    /// Advisory read of the shortfalls a request would hit right now.
    /// The authoritative check runs again under the part locks when a
    /// preshipment is created or updated.
    #[instrument(skip(self, items))]
    pub async fn check_allocation(
        &self,
        items: &[ItemRequest],
        excluding: Option<Uuid>,
    ) -> Result<Vec<Shortfall>, CoreError> {
        check_allocation_with(&*self.db, items, excluding).await
    }

    /// Creates a preshipment after compliance validation and an atomic
    /// allocation check. All-or-nothing: any shortfall rejects the whole
    /// request.
    #[instrument(skip(self, input), fields(shipment_id = %input.shipment_id))]
    pub async fn create_preshipment(
        &self,
        input: CreatePreshipmentInput,
    ) -> Result<preshipment::Model, CoreError> {
        input.validate()?;
        for item in &input.items {
            item.validate()?;
        }

        let violations = compliance::validate(&ComplianceFields {
            filing_district_port: input.filing_district_port.as_deref(),
            entry_filer_code: input.entry_filer_code.as_deref(),
            carrier_code: input.carrier_code.as_deref(),
            weekly_entry: input.weekly_entry,
            zone_week_ending_date: input.zone_week_ending_date,
        });
        if !violations.is_empty() {
            return Err(CoreError::Validation(violations));
        }

        let parts: Vec<Uuid> = input.items.iter().map(|i| i.part_id).collect();
        let _guards = self.part_locks.acquire(&parts).await;

        let created = self
            .db
            .transaction::<_, preshipment::Model, CoreError>(move |txn| {
                Box::pin(async move {
                    let duplicate = Preshipments::find()
                        .filter(preshipment::Column::ShipmentId.eq(input.shipment_id.as_str()))
                        .one(txn)
                        .await?;
                    if duplicate.is_some() {
                        return Err(CoreError::Conflict(format!(
                            "shipment identifier {} already exists",
                            input.shipment_id
                        )));
                    }

                    verify_lot_pins(txn, &input.items).await?;

                    let shortfalls = check_allocation_with(txn, &input.items, None).await?;
                    if !shortfalls.is_empty() {
                        return Err(CoreError::InsufficientAllocation(shortfalls));
                    }

                    let now = Utc::now();
                    let created = preshipment::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        shipment_id: Set(input.shipment_id.clone()),
                        customer_id: Set(input.customer_id),
                        stage: Set(Stage::Planning),
                        held_from_stage: Set(None),
                        entry_summary_status: Set(EntrySummaryStatus::NotPrepared),
                        filing_district_port: Set(input.filing_district_port.clone()),
                        entry_filer_code: Set(input.entry_filer_code.clone()),
                        carrier_code: Set(input.carrier_code.clone()),
                        importer_of_record: Set(input.importer_of_record.clone()),
                        weekly_entry: Set(input.weekly_entry),
                        zone_week_ending_date: Set(input.zone_week_ending_date),
                        priority: Set(input.priority),
                        driver_name: Set(None),
                        driver_license: Set(None),
                        vehicle_plate: Set(None),
                        carrier_name: Set(None),
                        signature: Set(None),
                        shipped_at: Set(None),
                        created_at: Set(now),
                        updated_at: Set(now),
                    }
                    .insert(txn)
                    .await?;

                    insert_items(txn, created.id, &input.items, now).await?;

                    Ok(created)
                })
            })
            .await?;

        info!(
            preshipment_id = %created.id,
            shipment_id = %created.shipment_id,
            "Created preshipment"
        );

        self.event_sender
            .send(Event::PreshipmentCreated {
                id: created.id,
                shipment_id: created.shipment_id.clone(),
            })
            .await
            .map_err(CoreError::Event)?;

        Ok(created)
    }

    /// Replaces a preshipment's line items, re-running the allocation
    /// check with the preshipment's own commitment excluded. Items are
    /// frozen once physical handling is underway.
    #[instrument(skip(self, items))]
    pub async fn update_preshipment_items(
        &self,
        preshipment_id: Uuid,
        items: Vec<ItemRequest>,
    ) -> Result<preshipment::Model, CoreError> {
        if items.is_empty() {
            return Err(CoreError::validation(
                "items",
                "at least one line item is required",
            ));
        }
        for item in &items {
            item.validate()?;
        }

        let existing = Preshipments::find_by_id(preshipment_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("Preshipment {} not found", preshipment_id))
            })?;
        if !existing.stage.allows_item_changes() {
            return Err(CoreError::InvalidTransition {
                state: existing.stage.to_string(),
                action: "UpdateItems".to_string(),
            });
        }

        let previous_items = existing
            .find_related(PreshipmentItems)
            .all(&*self.db)
            .await?;

        // Lock the union of old and new parts: freed commitments change
        // availability for the old parts too.
        let mut parts: Vec<Uuid> = items.iter().map(|i| i.part_id).collect();
        parts.extend(previous_items.iter().map(|i| i.part_id));
        let _guards = self.part_locks.acquire(&parts).await;

        let updated = self
            .db
            .transaction::<_, preshipment::Model, CoreError>(move |txn| {
                Box::pin(async move {
                    let current = Preshipments::find_by_id(preshipment_id)
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            CoreError::NotFound(format!(
                                "Preshipment {} not found",
                                preshipment_id
                            ))
                        })?;
                    if !current.stage.allows_item_changes() {
                        return Err(CoreError::InvalidTransition {
                            state: current.stage.to_string(),
                            action: "UpdateItems".to_string(),
                        });
                    }

                    verify_lot_pins(txn, &items).await?;

                    let shortfalls =
                        check_allocation_with(txn, &items, Some(preshipment_id)).await?;
                    if !shortfalls.is_empty() {
                        return Err(CoreError::InsufficientAllocation(shortfalls));
                    }

                    PreshipmentItems::delete_many()
                        .filter(preshipment_item::Column::PreshipmentId.eq(preshipment_id))
                        .exec(txn)
                        .await?;

                    let now = Utc::now();
                    insert_items(txn, preshipment_id, &items, now).await?;

                    let mut active: preshipment::ActiveModel = current.into();
                    active.updated_at = Set(now);
                    let updated = active.update(txn).await?;

                    Ok(updated)
                })
            })
            .await?;

        info!(preshipment_id = %updated.id, "Updated preshipment items");

        self.event_sender
            .send(Event::PreshipmentUpdated { id: updated.id })
            .await
            .map_err(CoreError::Event)?;

        Ok(updated)
    }
}

async fn insert_items<C: ConnectionTrait>(
    conn: &C,
    preshipment_id: Uuid,
    items: &[ItemRequest],
    now: chrono::DateTime<Utc>,
) -> Result<(), CoreError> {
    for item in items {
        preshipment_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            preshipment_id: Set(preshipment_id),
            part_id: Set(item.part_id),
            lot_id: Set(item.lot_id),
            quantity: Set(item.quantity),
            unit_value: Set(item.unit_value),
            created_at: Set(now),
        }
        .insert(conn)
        .await?;
    }
    Ok(())
}

/// A pinned lot must exist and belong to the requested part.
async fn verify_lot_pins<C: ConnectionTrait>(
    conn: &C,
    items: &[ItemRequest],
) -> Result<(), CoreError> {
    for item in items {
        if let Some(lot_id) = item.lot_id {
            let pinned = Lots::find_by_id(lot_id)
                .one(conn)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("Lot {} not found", lot_id)))?;
            if pinned.part_id != item.part_id {
                return Err(CoreError::validation(
                    "lot_id",
                    format!("lot {} does not hold part {}", lot_id, item.part_id),
                ));
            }
        }
    }
    Ok(())
}

pub(crate) async fn on_hand_with<C: ConnectionTrait>(
    conn: &C,
    part_id: Uuid,
) -> Result<i32, CoreError> {
    let transactions = LedgerTransactions::find()
        .join(JoinType::InnerJoin, ledger_transaction::Relation::Lot.def())
        .filter(lot::Column::PartId.eq(part_id))
        .all(conn)
        .await?;
    Ok(transactions.iter().map(|t| t.quantity).sum())
}

pub(crate) async fn committed_with<C: ConnectionTrait>(
    conn: &C,
    part_id: Uuid,
    excluding: Option<Uuid>,
) -> Result<i32, CoreError> {
    let mut query = PreshipmentItems::find()
        .join(
            JoinType::InnerJoin,
            preshipment_item::Relation::Preshipment.def(),
        )
        .filter(preshipment_item::Column::PartId.eq(part_id))
        .filter(preshipment::Column::Stage.is_not_in([Stage::Shipped, Stage::Cancelled]));

    if let Some(excluded) = excluding {
        query = query.filter(preshipment::Column::Id.ne(excluded));
    }

    let items = query.all(conn).await?;
    Ok(items.iter().map(|i| i.quantity).sum())
}

pub(crate) async fn available_to_promise_with<C: ConnectionTrait>(
    conn: &C,
    part_id: Uuid,
    excluding: Option<Uuid>,
) -> Result<i32, CoreError> {
    let on_hand = on_hand_with(conn, part_id).await?;
    let committed = committed_with(conn, part_id, excluding).await?;
    Ok(on_hand - committed)
}

/// Shortfalls for a request, with items of the same part aggregated so a
/// request cannot sneak past the bound by splitting a part across lines.
pub(crate) async fn check_allocation_with<C: ConnectionTrait>(
    conn: &C,
    items: &[ItemRequest],
    excluding: Option<Uuid>,
) -> Result<Vec<Shortfall>, CoreError> {
    let mut requested_per_part: BTreeMap<Uuid, i32> = BTreeMap::new();
    for item in items {
        *requested_per_part.entry(item.part_id).or_insert(0) += item.quantity;
    }

    let mut shortfalls = Vec::new();
    for (part_id, requested) in requested_per_part {
        let available = available_to_promise_with(conn, part_id, excluding).await?;
        if requested > available {
            shortfalls.push(Shortfall {
                part_id,
                available,
                requested,
            });
        }
    }
    Ok(shortfalls)
}
