//! FTZ Core
//!
//! Inventory ledger, allocation reservation, and customs workflow engine
//! for foreign-trade-zone warehouse operations. A library-style engine:
//! the surrounding CRUD layer invokes it in-process and owns transport,
//! authentication, and storage of uploaded documents.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod logging;
pub mod services;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::events::EventSender;
use crate::services::allocation::{AllocationService, PartLocks};
use crate::services::ledger::LedgerService;
use crate::services::workflow::ShipmentWorkflowService;

/// The engine's service set, sharing one connection pool, one event
/// channel, and one advisory lock table.
#[derive(Clone)]
pub struct CoreServices {
    pub ledger: LedgerService,
    pub allocation: AllocationService,
    pub workflow: ShipmentWorkflowService,
}

impl CoreServices {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        let part_locks = Arc::new(PartLocks::new());
        Self {
            ledger: LedgerService::new(db.clone(), event_sender.clone(), part_locks.clone()),
            allocation: AllocationService::new(db.clone(), event_sender.clone(), part_locks.clone()),
            workflow: ShipmentWorkflowService::new(db, event_sender, part_locks),
        }
    }
}
