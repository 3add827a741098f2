use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::DatabaseConnection;
use tokio::sync::mpsc;
use uuid::Uuid;

use ftz_core::config::AppConfig;
use ftz_core::db;
use ftz_core::entities::lot;
use ftz_core::events::{self, EventSender};
use ftz_core::services::allocation::{CreatePreshipmentInput, ItemRequest};
use ftz_core::services::ledger::CreateLotInput;
use ftz_core::CoreServices;

/// Test harness backed by an in-memory SQLite database. One pooled
/// connection, so every handle sees the same database.
pub struct TestCore {
    pub db: Arc<DatabaseConnection>,
    pub services: CoreServices,
    _event_task: tokio::task::JoinHandle<()>,
}

pub async fn setup() -> TestCore {
    let mut cfg = AppConfig::new("sqlite::memory:", "test");
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;

    let pool = db::establish_connection_from_app_config(&cfg)
        .await
        .expect("failed to create test database");
    db::init_schema(&pool).await.expect("failed to create schema");

    let db = Arc::new(pool);
    let (tx, rx) = mpsc::channel(256);
    let sender = EventSender::new(tx);
    let event_task = tokio::spawn(events::process_events(rx));

    TestCore {
        services: CoreServices::new(db.clone(), sender),
        db,
        _event_task: event_task,
    }
}

/// Creates a lot of a fresh part and returns it.
#[allow(dead_code)]
pub async fn seed_lot(core: &TestCore, part_id: Uuid, quantity: i32) -> lot::Model {
    seed_lot_valued(core, part_id, quantity, dec!(10)).await
}

#[allow(dead_code)]
pub async fn seed_lot_valued(
    core: &TestCore,
    part_id: Uuid,
    quantity: i32,
    unit_value: Decimal,
) -> lot::Model {
    core.services
        .ledger
        .create_lot(CreateLotInput {
            part_id,
            customer_id: Uuid::new_v4(),
            storage_location_id: Uuid::new_v4(),
            initial_quantity: quantity,
            unit_value,
        })
        .await
        .expect("failed to seed lot")
}

/// A minimal, compliant preshipment request for a single part.
#[allow(dead_code)]
pub fn preshipment_request(shipment_id: &str, part_id: Uuid, quantity: i32) -> CreatePreshipmentInput {
    CreatePreshipmentInput {
        shipment_id: shipment_id.to_string(),
        customer_id: Uuid::new_v4(),
        items: vec![ItemRequest {
            part_id,
            lot_id: None,
            quantity,
            unit_value: dec!(10),
        }],
        filing_district_port: Some("2704".to_string()),
        entry_filer_code: Some("ABC".to_string()),
        carrier_code: Some("FDEG".to_string()),
        importer_of_record: Some("12-3456789".to_string()),
        weekly_entry: false,
        zone_week_ending_date: None,
        priority: 0,
    }
}
