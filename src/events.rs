use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::entities::ledger_transaction::TransactionKind;
use crate::entities::preshipment::{EntrySummaryStatus, Stage};

/// Domain events emitted after successful mutations. Consumed by the
/// surrounding application for notifications and audit feeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    LotCreated {
        lot_id: Uuid,
        part_id: Uuid,
        initial_quantity: i32,
    },
    TransactionRecorded {
        transaction_id: Uuid,
        lot_id: Uuid,
        kind: TransactionKind,
        quantity: i32,
    },
    PreshipmentCreated {
        id: Uuid,
        shipment_id: String,
    },
    PreshipmentUpdated {
        id: Uuid,
    },
    StageChanged {
        id: Uuid,
        from: Stage,
        to: Stage,
    },
    EntrySummaryStatusChanged {
        id: Uuid,
        from: EntrySummaryStatus,
        to: EntrySummaryStatus,
    },
    ShipmentConfirmed {
        id: Uuid,
        shipment_id: String,
        shipped_at: DateTime<Utc>,
        lots_consumed: usize,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Drains the event channel, logging each event. The embedding
/// application replaces this with its own consumer when it needs more
/// than the audit log.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        info!(?event, "Processing event");
    }
}
