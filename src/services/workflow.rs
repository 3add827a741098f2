//! Shipment workflow: the two state machines that travel together on a
//! preshipment, and the side-effecting actions they gate.
//!
//! Every stage and status change goes through the transition tables in
//! the `preshipment` entity; nothing updates those columns directly.
//! Driver signoff is the only path to `Shipped`, and reaching `Shipped`
//! is the only event that converts reserved allocation into recorded
//! `shipment` transactions against the consumed lots, exactly once.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::entities::ledger_transaction::{self, TransactionKind};
use crate::entities::lot::{self, Entity as Lots};
use crate::entities::preshipment::{self, Entity as Preshipments, EntrySummaryStatus, Stage};
use crate::entities::preshipment_item::{self, Entity as PreshipmentItems};
use crate::errors::{CoreError, Shortfall};
use crate::events::{Event, EventSender};
use crate::services::allocation::PartLocks;
use crate::services::compliance::{self, ComplianceFields};
use crate::services::ledger::lot_balance;

/// Actions the workflow accepts. Stage actions on the left of the
/// taxonomy, entry-summary actions on the right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum WorkflowAction {
    /// Advance the physical stage one step forward.
    Advance,
    /// Park the shipment, remembering the stage it was held from.
    Hold,
    /// Return a held shipment to the stage it was held from.
    Release,
    /// Cancel the shipment; its commitment stops counting.
    Cancel,
    /// Driver signoff; the only path to `Shipped`.
    DriverSignoff,
    /// NOT_PREPARED -> DRAFT
    PrepareEntry,
    /// DRAFT -> READY_TO_FILE; requires the compliance fields to pass.
    MarkEntryReady,
    /// READY_TO_FILE -> FILED (CBP filing)
    FileEntry,
    /// FILED -> ACCEPTED
    AcceptEntry,
    /// FILED -> REJECTED
    RejectEntry,
    /// REJECTED -> DRAFT, for correction.
    ReopenEntry,
}

/// Driver details captured at signoff.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DriverSignoffPayload {
    #[validate(length(min = 1, message = "driver name is required"))]
    pub driver_name: String,
    #[validate(length(min = 1, message = "driver license number is required"))]
    pub driver_license: String,
    #[validate(length(min = 1, message = "vehicle plate number is required"))]
    pub vehicle_plate: String,
    pub carrier_name: Option<String>,
    /// Opaque signature payload captured by the gate device.
    pub signature: Option<String>,
}

/// Label data handed to the printing layer once the gate allows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingLabel {
    pub shipment_id: String,
    pub carrier_code: Option<String>,
    pub reference: String,
    pub generated_at: DateTime<Utc>,
}

/// Replacement values for the regulatory identifier bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegulatoryFieldsInput {
    pub filing_district_port: Option<String>,
    pub entry_filer_code: Option<String>,
    pub carrier_code: Option<String>,
    pub importer_of_record: Option<String>,
    #[serde(default)]
    pub weekly_entry: bool,
    pub zone_week_ending_date: Option<NaiveDate>,
}

#[derive(Clone)]
pub struct ShipmentWorkflowService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    part_locks: Arc<PartLocks>,
}

impl ShipmentWorkflowService {
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

    pub async fn get_preshipment(&self, id: Uuid) -> Result<preshipment::Model, CoreError> {
        Preshipments::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Preshipment {} not found", id)))
    }

    pub async fn get_items(
        &self,
        preshipment_id: Uuid,
    ) -> Result<Vec<preshipment_item::Model>, CoreError> {
        Ok(PreshipmentItems::find()
            .filter(preshipment_item::Column::PreshipmentId.eq(preshipment_id))
            .all(&*self.db)
            .await?)
    }

    /// Lists preshipments, newest first, paginated.
    #[instrument(skip(self))]
    pub async fn list_preshipments(
        &self,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<preshipment::Model>, u64), CoreError> {
        if page == 0 {
            return Err(CoreError::validation("page", "page number must be greater than 0"));
        }
        if limit == 0 || limit > 1000 {
            return Err(CoreError::validation("limit", "limit must be between 1 and 1000"));
        }

        let paginator = Preshipments::find()
            .order_by_desc(preshipment::Column::CreatedAt)
            .paginate(&*self.db, limit);

        let total = paginator.num_items().await?;
        let models = paginator.fetch_page(page - 1).await?;

        Ok((models, total))
    }

    /// Attempts a workflow action. Returns the updated preshipment or
    /// `InvalidTransition` with the current state and attempted action,
    /// performing no side effect in the latter case.
    #[instrument(skip(self, signoff))]
    pub async fn attempt_transition(
        &self,
        preshipment_id: Uuid,
        action: WorkflowAction,
        signoff: Option<DriverSignoffPayload>,
    ) -> Result<preshipment::Model, CoreError> {
        let current = self.get_preshipment(preshipment_id).await?;

        match action {
            WorkflowAction::Advance => {
                let target = current.stage.next().ok_or_else(|| invalid_stage(&current, action))?;
                self.set_stage(&current, target, None, action).await
            }
            WorkflowAction::Hold => {
                if !current.stage.can_hold() {
                    return Err(invalid_stage(&current, action));
                }
                self.set_stage(&current, Stage::OnHold, Some(current.stage), action)
                    .await
            }
            WorkflowAction::Release => {
                if current.stage != Stage::OnHold {
                    return Err(invalid_stage(&current, action));
                }
                let back = current
                    .held_from_stage
                    .ok_or_else(|| invalid_stage(&current, action))?;
                self.set_stage(&current, back, None, action).await
            }
            WorkflowAction::Cancel => {
                if !current.stage.can_cancel() {
                    return Err(invalid_stage(&current, action));
                }
                self.set_stage(&current, Stage::Cancelled, None, action).await
            }
            WorkflowAction::DriverSignoff => {
                let payload = signoff.ok_or_else(|| {
                    CoreError::validation("payload", "driver signoff requires driver details")
                })?;
                self.driver_signoff(preshipment_id, payload).await
            }
            WorkflowAction::PrepareEntry => {
                self.set_entry_status(&current, EntrySummaryStatus::Draft, action)
                    .await
            }
            WorkflowAction::MarkEntryReady => {
                let violations = compliance::validate_for_filing(&ComplianceFields::from_model(&current));
                if !violations.is_empty() {
                    return Err(CoreError::Validation(violations));
                }
                self.set_entry_status(&current, EntrySummaryStatus::ReadyToFile, action)
                    .await
            }
            WorkflowAction::FileEntry => {
                if !current.entry_summary_status.allows_filing() {
                    return Err(invalid_status(&current, action));
                }
                self.set_entry_status(&current, EntrySummaryStatus::Filed, action)
                    .await
            }
            WorkflowAction::AcceptEntry => {
                self.set_entry_status(&current, EntrySummaryStatus::Accepted, action)
                    .await
            }
            WorkflowAction::RejectEntry => {
                self.set_entry_status(&current, EntrySummaryStatus::Rejected, action)
                    .await
            }
            WorkflowAction::ReopenEntry => {
                self.set_entry_status(&current, EntrySummaryStatus::Draft, action)
                    .await
            }
        }
    }

    /// Driver signoff: stamps the driver details and shipped timestamp,
    /// drives the stage to `Shipped`, and records one `shipment`
    /// transaction per consumed lot — all in one unit of work.
    #[instrument(skip(self, payload))]
    pub async fn driver_signoff(
        &self,
        preshipment_id: Uuid,
        payload: DriverSignoffPayload,
    ) -> Result<preshipment::Model, CoreError> {
        payload.validate()?;

        let items = self.get_items(preshipment_id).await?;
        let parts: Vec<Uuid> = items.iter().map(|i| i.part_id).collect();
        let _guards = self.part_locks.acquire(&parts).await;

        let (shipped, previous_stage, lots_consumed) = self
            .db
            .transaction::<_, (preshipment::Model, Stage, usize), CoreError>(move |txn| {
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

                    // Re-entering Shipped must never debit twice.
                    if !current.stage.allows_driver_signoff() {
                        return Err(CoreError::InvalidTransition {
                            state: current.stage.to_string(),
                            action: WorkflowAction::DriverSignoff.to_string(),
                        });
                    }

                    let items = PreshipmentItems::find()
                        .filter(preshipment_item::Column::PreshipmentId.eq(preshipment_id))
                        .all(txn)
                        .await?;

                    let mut lots_consumed = 0usize;
                    for item in &items {
                        lots_consumed += consume_item(txn, &current, item).await?;
                    }

                    let previous_stage = current.stage;
                    let now = Utc::now();
                    let mut active: preshipment::ActiveModel = current.into();
                    active.stage = Set(Stage::Shipped);
                    active.held_from_stage = Set(None);
                    active.driver_name = Set(Some(payload.driver_name.clone()));
                    active.driver_license = Set(Some(payload.driver_license.clone()));
                    active.vehicle_plate = Set(Some(payload.vehicle_plate.clone()));
                    active.carrier_name = Set(payload.carrier_name.clone());
                    active.signature = Set(payload.signature.clone());
                    active.shipped_at = Set(Some(now));
                    active.updated_at = Set(now);
                    let shipped = active.update(txn).await?;

                    Ok((shipped, previous_stage, lots_consumed))
                })
            })
            .await?;

        info!(
            preshipment_id = %shipped.id,
            shipment_id = %shipped.shipment_id,
            lots_consumed,
            "Confirmed shipment"
        );

        self.event_sender
            .send(Event::StageChanged {
                id: shipped.id,
                from: previous_stage,
                to: Stage::Shipped,
            })
            .await
            .map_err(CoreError::Event)?;
        self.event_sender
            .send(Event::ShipmentConfirmed {
                id: shipped.id,
                shipment_id: shipped.shipment_id.clone(),
                shipped_at: shipped.shipped_at.unwrap_or_else(Utc::now),
                lots_consumed,
            })
            .await
            .map_err(CoreError::Event)?;

        Ok(shipped)
    }

    /// Produces label data once the stage gate allows it. No state
    /// change; printing is the surrounding layer's concern.
    #[instrument(skip(self))]
    pub async fn generate_label(&self, preshipment_id: Uuid) -> Result<ShippingLabel, CoreError> {
        let current = self.get_preshipment(preshipment_id).await?;
        if !current.stage.allows_label_generation() {
            return Err(CoreError::InvalidTransition {
                state: current.stage.to_string(),
                action: "GenerateLabel".to_string(),
            });
        }

        Ok(ShippingLabel {
            shipment_id: current.shipment_id.clone(),
            carrier_code: current.carrier_code.clone(),
            reference: format!("LBL-{}", current.shipment_id),
            generated_at: Utc::now(),
        })
    }

    /// Replaces the regulatory identifier bundle, re-validating formats.
    /// Frozen once the entry summary is filed.
    #[instrument(skip(self, input))]
    pub async fn update_regulatory_fields(
        &self,
        preshipment_id: Uuid,
        input: RegulatoryFieldsInput,
    ) -> Result<preshipment::Model, CoreError> {
        let current = self.get_preshipment(preshipment_id).await?;
        if !current.entry_summary_status.allows_regulatory_edits() {
            return Err(CoreError::InvalidTransition {
                state: current.entry_summary_status.to_string(),
                action: "UpdateRegulatoryFields".to_string(),
            });
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

        let mut active: preshipment::ActiveModel = current.into();
        active.filing_district_port = Set(input.filing_district_port);
        active.entry_filer_code = Set(input.entry_filer_code);
        active.carrier_code = Set(input.carrier_code);
        active.importer_of_record = Set(input.importer_of_record);
        active.weekly_entry = Set(input.weekly_entry);
        active.zone_week_ending_date = Set(input.zone_week_ending_date);
        active.updated_at = Set(Utc::now());
        let updated = active.update(&*self.db).await?;

        self.event_sender
            .send(Event::PreshipmentUpdated { id: updated.id })
            .await
            .map_err(CoreError::Event)?;

        Ok(updated)
    }

    /// Stage write guarded against concurrent modification: the row must
    /// still be in the stage the decision was made against, otherwise
    /// the other writer won and the caller may safely retry.
    async fn set_stage(
        &self,
        current: &preshipment::Model,
        target: Stage,
        held_from: Option<Stage>,
        action: WorkflowAction,
    ) -> Result<preshipment::Model, CoreError> {
        let id = current.id;
        let expected = current.stage;

        let updated = self
            .db
            .transaction::<_, preshipment::Model, CoreError>(move |txn| {
                Box::pin(async move {
                    let fresh = Preshipments::find_by_id(id)
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            CoreError::NotFound(format!("Preshipment {} not found", id))
                        })?;
                    if fresh.stage != expected {
                        return Err(CoreError::Conflict(format!(
                            "preshipment {} changed concurrently during {}",
                            id, action
                        )));
                    }

                    let mut active: preshipment::ActiveModel = fresh.into();
                    active.stage = Set(target);
                    active.held_from_stage = Set(held_from);
                    active.updated_at = Set(Utc::now());
                    Ok(active.update(txn).await?)
                })
            })
            .await?;

        info!(
            preshipment_id = %updated.id,
            from = %expected,
            to = %target,
            %action,
            "Stage transition"
        );

        self.event_sender
            .send(Event::StageChanged {
                id: updated.id,
                from: expected,
                to: target,
            })
            .await
            .map_err(CoreError::Event)?;

        Ok(updated)
    }

    /// Entry-summary status write through the transition table, guarded
    /// the same way as [`Self::set_stage`].
    async fn set_entry_status(
        &self,
        current: &preshipment::Model,
        target: EntrySummaryStatus,
        action: WorkflowAction,
    ) -> Result<preshipment::Model, CoreError> {
        if !current.entry_summary_status.can_transition_to(target) {
            return Err(invalid_status(current, action));
        }

        let id = current.id;
        let expected = current.entry_summary_status;

        let updated = self
            .db
            .transaction::<_, preshipment::Model, CoreError>(move |txn| {
                Box::pin(async move {
                    let fresh = Preshipments::find_by_id(id)
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            CoreError::NotFound(format!("Preshipment {} not found", id))
                        })?;
                    if fresh.entry_summary_status != expected {
                        return Err(CoreError::Conflict(format!(
                            "preshipment {} changed concurrently during {}",
                            id, action
                        )));
                    }

                    let mut active: preshipment::ActiveModel = fresh.into();
                    active.entry_summary_status = Set(target);
                    active.updated_at = Set(Utc::now());
                    Ok(active.update(txn).await?)
                })
            })
            .await?;

        info!(
            preshipment_id = %updated.id,
            from = %expected,
            to = %target,
            %action,
            "Entry summary status transition"
        );

        self.event_sender
            .send(Event::EntrySummaryStatusChanged {
                id: updated.id,
                from: expected,
                to: target,
            })
            .await
            .map_err(CoreError::Event)?;

        Ok(updated)
    }
}

fn invalid_stage(current: &preshipment::Model, action: WorkflowAction) -> CoreError {
    CoreError::InvalidTransition {
        state: current.stage.to_string(),
        action: action.to_string(),
    }
}

fn invalid_status(current: &preshipment::Model, action: WorkflowAction) -> CoreError {
    CoreError::InvalidTransition {
        state: current.entry_summary_status.to_string(),
        action: action.to_string(),
    }
}

/// Records the `shipment` transactions consuming one line item. Pinned
/// items debit their lot; unpinned items consume the part's lots oldest
/// first. Returns the number of lots touched.
async fn consume_item<C: ConnectionTrait>(
    conn: &C,
    pre: &preshipment::Model,
    item: &preshipment_item::Model,
) -> Result<usize, CoreError> {
    if let Some(lot_id) = item.lot_id {
        let balance = lot_balance(conn, lot_id).await?;
        if balance < item.quantity {
            return Err(CoreError::InsufficientQuantity {
                lot_id,
                balance,
                delta: -item.quantity,
            });
        }
        record_shipment_delta(conn, lot_id, item.quantity, pre).await?;
        return Ok(1);
    }

    let lots = Lots::find()
        .filter(lot::Column::PartId.eq(item.part_id))
        .order_by_asc(lot::Column::CreatedAt)
        .all(conn)
        .await?;

    let mut remaining = item.quantity;
    let mut touched = 0usize;
    for candidate in lots {
        if remaining == 0 {
            break;
        }
        let balance = lot_balance(conn, candidate.id).await?;
        if balance <= 0 {
            continue;
        }
        let take = balance.min(remaining);
        record_shipment_delta(conn, candidate.id, take, pre).await?;
        remaining -= take;
        touched += 1;
    }

    if remaining > 0 {
        // On-hand shrank below the commitment since admission.
        return Err(CoreError::InsufficientAllocation(vec![Shortfall {
            part_id: item.part_id,
            available: item.quantity - remaining,
            requested: item.quantity,
        }]));
    }

    Ok(touched)
}

async fn record_shipment_delta<C: ConnectionTrait>(
    conn: &C,
    lot_id: Uuid,
    quantity: i32,
    pre: &preshipment::Model,
) -> Result<(), CoreError> {
    ledger_transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        lot_id: Set(lot_id),
        quantity: Set(-quantity),
        kind: Set(TransactionKind::Shipment),
        reference: Set(Some(pre.shipment_id.clone())),
        notes: Set(None),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;
    Ok(())
}
