//! Ledger store: lots and their append-only transaction log.
//!
//! A lot's current quantity is never stored; it is the sum of the signed
//! deltas recorded against it. Every mutating call persists durably
//! before returning, and the running balance is enforced non-negative at
//! write time.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::entities::ledger_transaction::{self, Entity as LedgerTransactions, TransactionKind};
use crate::entities::lot::{self, Entity as Lots};
use crate::errors::CoreError;
use crate::events::{Event, EventSender};
use crate::services::allocation::PartLocks;

/// Current balance of a lot: the sum of its transaction deltas.
pub(crate) async fn lot_balance<C: ConnectionTrait>(
    conn: &C,
    lot_id: Uuid,
) -> Result<i32, CoreError> {
    let transactions = LedgerTransactions::find()
        .filter(ledger_transaction::Column::LotId.eq(lot_id))
        .all(conn)
        .await?;
    Ok(transactions.iter().map(|t| t.quantity).sum())
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateLotInput {
    pub part_id: Uuid,
    pub customer_id: Uuid,
    pub storage_location_id: Uuid,
    #[validate(range(min = 1, message = "initial quantity must be positive"))]
    pub initial_quantity: i32,
    pub unit_value: Decimal,
}

/// Service owning lot and transaction identity. The single source of
/// truth for on-hand quantity.
#[derive(Clone)]
pub struct LedgerService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    part_locks: Arc<PartLocks>,
}

impl LedgerService {
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

    /// Creates a lot and, in the same unit of work, its initial receipt
    /// transaction.
    #[instrument(skip(self))]
    pub async fn create_lot(&self, input: CreateLotInput) -> Result<lot::Model, CoreError> {
        input.validate()?;
        let initial_quantity = input.initial_quantity;

        let created = self
            .db
            .transaction::<_, lot::Model, CoreError>(move |txn| {
                Box::pin(async move {
                    let now = Utc::now();
                    let created = lot::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        part_id: Set(input.part_id),
                        customer_id: Set(input.customer_id),
                        storage_location_id: Set(input.storage_location_id),
                        unit_value: Set(input.unit_value),
                        created_at: Set(now),
                    }
                    .insert(txn)
                    .await?;

                    ledger_transaction::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        lot_id: Set(created.id),
                        quantity: Set(input.initial_quantity),
                        kind: Set(TransactionKind::Receipt),
                        reference: Set(None),
                        notes: Set(Some("Initial receipt".to_string())),
                        created_at: Set(now),
                    }
                    .insert(txn)
                    .await?;

                    Ok(created)
                })
            })
            .await?;

        info!(lot_id = %created.id, part_id = %created.part_id, "Created lot");

        self.event_sender
            .send(Event::LotCreated {
                lot_id: created.id,
                part_id: created.part_id,
                initial_quantity,
            })
            .await
            .map_err(CoreError::Event)?;

        Ok(created)
    }

    /// Appends a ledger entry, rejecting any delta that would drive the
    /// lot's running balance negative. The balance check and the insert
    /// are one atomic unit.
    #[instrument(skip(self))]
    pub async fn record_transaction(
        &self,
        lot_id: Uuid,
        delta: i32,
        kind: TransactionKind,
        reference: Option<String>,
        notes: Option<String>,
    ) -> Result<ledger_transaction::Model, CoreError> {
        if delta == 0 {
            return Err(CoreError::validation("quantity", "delta must be non-zero"));
        }
        if kind == TransactionKind::Shipment && delta >= 0 {
            return Err(CoreError::validation(
                "quantity",
                "shipment transactions must carry a negative delta",
            ));
        }
        if kind == TransactionKind::Adjustment
            && reference.as_deref().map_or(true, |r| r.trim().is_empty())
        {
            return Err(CoreError::validation(
                "reference",
                "adjustments must carry an external reference",
            ));
        }

        // Serialize against allocation admissions and other ledger
        // writes touching the same part.
        let lot = Lots::find_by_id(lot_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Lot {} not found", lot_id)))?;
        let _guard = self.part_locks.acquire(&[lot.part_id]).await;

        let recorded = self
            .db
            .transaction::<_, ledger_transaction::Model, CoreError>(move |txn| {
                Box::pin(async move {
                    let balance = lot_balance(txn, lot_id).await?;
                    if balance + delta < 0 {
                        return Err(CoreError::InsufficientQuantity {
                            lot_id,
                            balance,
                            delta,
                        });
                    }

                    let recorded = ledger_transaction::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        lot_id: Set(lot_id),
                        quantity: Set(delta),
                        kind: Set(kind),
                        reference: Set(reference),
                        notes: Set(notes),
                        created_at: Set(Utc::now()),
                    }
                    .insert(txn)
                    .await?;

                    Ok(recorded)
                })
            })
            .await?;

        info!(
            transaction_id = %recorded.id,
            lot_id = %lot_id,
            kind = %recorded.kind,
            quantity = recorded.quantity,
            "Recorded ledger transaction"
        );

        self.event_sender
            .send(Event::TransactionRecorded {
                transaction_id: recorded.id,
                lot_id,
                kind: recorded.kind,
                quantity: recorded.quantity,
            })
            .await
            .map_err(CoreError::Event)?;

        Ok(recorded)
    }

    /// Derived current quantity of a lot.
    #[instrument(skip(self))]
    pub async fn current_quantity(&self, lot_id: Uuid) -> Result<i32, CoreError> {
        self.require_lot(lot_id).await?;
        lot_balance(&*self.db, lot_id).await
    }

    /// Current quantity times unit value.
    #[instrument(skip(self))]
    pub async fn lot_value(&self, lot_id: Uuid) -> Result<Decimal, CoreError> {
        let lot = self.require_lot(lot_id).await?;
        let quantity = lot_balance(&*self.db, lot_id).await?;
        Ok(Decimal::from(quantity) * lot.unit_value)
    }

    /// Transaction history for a lot, newest first, paginated.
    #[instrument(skip(self))]
    pub async fn transaction_history(
        &self,
        lot_id: Uuid,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<ledger_transaction::Model>, u64), CoreError> {
        if page == 0 {
            return Err(CoreError::validation("page", "page number must be greater than 0"));
        }
        if limit == 0 || limit > 1000 {
            return Err(CoreError::validation("limit", "limit must be between 1 and 1000"));
        }
        self.require_lot(lot_id).await?;

        let paginator = LedgerTransactions::find()
            .filter(ledger_transaction::Column::LotId.eq(lot_id))
            .order_by_desc(ledger_transaction::Column::CreatedAt)
            .paginate(&*self.db, limit);

        let total = paginator.num_items().await?;
        let entries = paginator.fetch_page(page - 1).await?;

        Ok((entries, total))
    }

    pub async fn get_lot(&self, lot_id: Uuid) -> Result<Option<lot::Model>, CoreError> {
        Ok(Lots::find_by_id(lot_id).one(&*self.db).await?)
    }

    async fn require_lot(&self, lot_id: Uuid) -> Result<lot::Model, CoreError> {
        Lots::find_by_id(lot_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Lot {} not found", lot_id)))
    }
}
