mod common;

use assert_matches::assert_matches;
use rust_decimal_macros::dec;
use uuid::Uuid;

use common::{preshipment_request, seed_lot, setup, TestCore};
use ftz_core::entities::ledger_transaction::TransactionKind;
use ftz_core::entities::preshipment::{EntrySummaryStatus, Stage};
use ftz_core::errors::CoreError;
use ftz_core::services::allocation::ItemRequest;
use ftz_core::services::workflow::{DriverSignoffPayload, WorkflowAction};

fn signoff_payload() -> DriverSignoffPayload {
    DriverSignoffPayload {
        driver_name: "R. Alvarez".to_string(),
        driver_license: "D1234567".to_string(),
        vehicle_plate: "7KXJ241".to_string(),
        carrier_name: Some("FedEx Ground".to_string()),
        signature: Some("data:image/png;base64,iVBORw0KGgo=".to_string()),
    }
}

async fn advance_to(core: &TestCore, id: Uuid, target: Stage) {
    loop {
        let current = core.services.workflow.get_preshipment(id).await.unwrap();
        if current.stage == target {
            return;
        }
        core.services
            .workflow
            .attempt_transition(id, WorkflowAction::Advance, None)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn full_physical_flow_ships_and_debits_the_ledger() {
    let core = setup().await;
    let part_id = Uuid::new_v4();
    let lot = seed_lot(&core, part_id, 100).await;

    let pre = core
        .services
        .allocation
        .create_preshipment(preshipment_request("PS-FLOW", part_id, 60))
        .await
        .unwrap();
    assert_eq!(pre.stage, Stage::Planning);
    assert_eq!(pre.entry_summary_status, EntrySummaryStatus::NotPrepared);

    advance_to(&core, pre.id, Stage::ReadyToShip).await;

    let shipped = core
        .services
        .workflow
        .driver_signoff(pre.id, signoff_payload())
        .await
        .unwrap();
    assert_eq!(shipped.stage, Stage::Shipped);
    assert!(shipped.shipped_at.is_some());
    assert_eq!(shipped.driver_name.as_deref(), Some("R. Alvarez"));
    assert_eq!(shipped.vehicle_plate.as_deref(), Some("7KXJ241"));

    // Exactly one shipment transaction against the consumed lot.
    assert_eq!(core.services.ledger.current_quantity(lot.id).await.unwrap(), 40);
    let (history, _) = core
        .services
        .ledger
        .transaction_history(lot.id, 1, 50)
        .await
        .unwrap();
    let shipments: Vec<_> = history
        .iter()
        .filter(|t| t.kind == TransactionKind::Shipment)
        .collect();
    assert_eq!(shipments.len(), 1);
    assert_eq!(shipments[0].quantity, -60);
    assert_eq!(shipments[0].reference.as_deref(), Some("PS-FLOW"));

    // The shipped preshipment no longer counts toward allocation.
    assert_eq!(core.services.allocation.committed(part_id, None).await.unwrap(), 0);
    assert_eq!(
        core.services.allocation.available_to_promise(part_id).await.unwrap(),
        40
    );
}

#[tokio::test]
async fn signoff_outside_its_gate_is_rejected() {
    let core = setup().await;
    let part_id = Uuid::new_v4();
    let lot = seed_lot(&core, part_id, 100).await;

    let pre = core
        .services
        .allocation
        .create_preshipment(preshipment_request("PS-GATE", part_id, 60))
        .await
        .unwrap();

    let result = core
        .services
        .workflow
        .driver_signoff(pre.id, signoff_payload())
        .await;
    assert_matches!(
        result,
        Err(CoreError::InvalidTransition { ref state, .. }) if state == "Planning"
    );

    // No side effects.
    assert_eq!(core.services.ledger.current_quantity(lot.id).await.unwrap(), 100);
    let current = core.services.workflow.get_preshipment(pre.id).await.unwrap();
    assert_eq!(current.stage, Stage::Planning);
}

#[tokio::test]
async fn second_signoff_is_rejected_and_debits_nothing() {
    let core = setup().await;
    let part_id = Uuid::new_v4();
    let lot = seed_lot(&core, part_id, 100).await;

    let pre = core
        .services
        .allocation
        .create_preshipment(preshipment_request("PS-ONCE", part_id, 60))
        .await
        .unwrap();
    advance_to(&core, pre.id, Stage::Staged).await;

    core.services
        .workflow
        .driver_signoff(pre.id, signoff_payload())
        .await
        .unwrap();
    assert_eq!(core.services.ledger.current_quantity(lot.id).await.unwrap(), 40);

    let again = core
        .services
        .workflow
        .driver_signoff(pre.id, signoff_payload())
        .await;
    assert_matches!(again, Err(CoreError::InvalidTransition { .. }));

    assert_eq!(core.services.ledger.current_quantity(lot.id).await.unwrap(), 40);
    let (history, _) = core
        .services
        .ledger
        .transaction_history(lot.id, 1, 50)
        .await
        .unwrap();
    let shipment_count = history
        .iter()
        .filter(|t| t.kind == TransactionKind::Shipment)
        .count();
    assert_eq!(shipment_count, 1);
}

#[tokio::test]
async fn label_generation_respects_the_stage_gate() {
    let core = setup().await;
    let part_id = Uuid::new_v4();
    seed_lot(&core, part_id, 100).await;

    let pre = core
        .services
        .allocation
        .create_preshipment(preshipment_request("PS-LBL", part_id, 10))
        .await
        .unwrap();

    let early = core.services.workflow.generate_label(pre.id).await;
    assert_matches!(early, Err(CoreError::InvalidTransition { .. }));

    advance_to(&core, pre.id, Stage::Loading).await;
    let label = core.services.workflow.generate_label(pre.id).await.unwrap();
    assert_eq!(label.shipment_id, "PS-LBL");
    assert_eq!(label.reference, "LBL-PS-LBL");
    assert_eq!(label.carrier_code.as_deref(), Some("FDEG"));
}

#[tokio::test]
async fn hold_returns_to_the_stage_it_was_held_from() {
    let core = setup().await;
    let part_id = Uuid::new_v4();
    seed_lot(&core, part_id, 100).await;

    let pre = core
        .services
        .allocation
        .create_preshipment(preshipment_request("PS-HOLD", part_id, 10))
        .await
        .unwrap();
    advance_to(&core, pre.id, Stage::Packing).await;

    let held = core
        .services
        .workflow
        .attempt_transition(pre.id, WorkflowAction::Hold, None)
        .await
        .unwrap();
    assert_eq!(held.stage, Stage::OnHold);
    assert_eq!(held.held_from_stage, Some(Stage::Packing));

    // Advancing or re-holding a held shipment is illegal.
    assert_matches!(
        core.services
            .workflow
            .attempt_transition(pre.id, WorkflowAction::Advance, None)
            .await,
        Err(CoreError::InvalidTransition { .. })
    );
    assert_matches!(
        core.services
            .workflow
            .attempt_transition(pre.id, WorkflowAction::Hold, None)
            .await,
        Err(CoreError::InvalidTransition { .. })
    );

    let released = core
        .services
        .workflow
        .attempt_transition(pre.id, WorkflowAction::Release, None)
        .await
        .unwrap();
    assert_eq!(released.stage, Stage::Packing);
    assert_eq!(released.held_from_stage, None);
}

#[tokio::test]
async fn entry_summary_flow_with_rejection_loop() {
    let core = setup().await;
    let part_id = Uuid::new_v4();
    seed_lot(&core, part_id, 100).await;

    let pre = core
        .services
        .allocation
        .create_preshipment(preshipment_request("PS-ACE", part_id, 10))
        .await
        .unwrap();

    // CBP filing before READY_TO_FILE is illegal.
    assert_matches!(
        core.services
            .workflow
            .attempt_transition(pre.id, WorkflowAction::FileEntry, None)
            .await,
        Err(CoreError::InvalidTransition { .. })
    );

    core.services
        .workflow
        .attempt_transition(pre.id, WorkflowAction::PrepareEntry, None)
        .await
        .unwrap();

    assert_matches!(
        core.services
            .workflow
            .attempt_transition(pre.id, WorkflowAction::FileEntry, None)
            .await,
        Err(CoreError::InvalidTransition { .. })
    );

    core.services
        .workflow
        .attempt_transition(pre.id, WorkflowAction::MarkEntryReady, None)
        .await
        .unwrap();
    let filed = core
        .services
        .workflow
        .attempt_transition(pre.id, WorkflowAction::FileEntry, None)
        .await
        .unwrap();
    assert_eq!(filed.entry_summary_status, EntrySummaryStatus::Filed);

    let rejected = core
        .services
        .workflow
        .attempt_transition(pre.id, WorkflowAction::RejectEntry, None)
        .await
        .unwrap();
    assert_eq!(rejected.entry_summary_status, EntrySummaryStatus::Rejected);

    let reopened = core
        .services
        .workflow
        .attempt_transition(pre.id, WorkflowAction::ReopenEntry, None)
        .await
        .unwrap();
    assert_eq!(reopened.entry_summary_status, EntrySummaryStatus::Draft);
}

#[tokio::test]
async fn entry_cannot_be_marked_ready_with_missing_identifiers() {
    let core = setup().await;
    let part_id = Uuid::new_v4();
    seed_lot(&core, part_id, 100).await;

    let mut request = preshipment_request("PS-MISS", part_id, 10);
    request.entry_filer_code = None;
    let pre = core.services.allocation.create_preshipment(request).await.unwrap();

    core.services
        .workflow
        .attempt_transition(pre.id, WorkflowAction::PrepareEntry, None)
        .await
        .unwrap();

    let result = core
        .services
        .workflow
        .attempt_transition(pre.id, WorkflowAction::MarkEntryReady, None)
        .await;
    match result {
        Err(CoreError::Validation(violations)) => {
            assert!(violations.iter().any(|v| v.field == "entry_filer_code"));
        }
        other => panic!("expected Validation, got {other:?}"),
    }
}

#[tokio::test]
async fn regulatory_fields_freeze_once_filed() {
    let core = setup().await;
    let part_id = Uuid::new_v4();
    seed_lot(&core, part_id, 100).await;

    let pre = core
        .services
        .allocation
        .create_preshipment(preshipment_request("PS-EDIT", part_id, 10))
        .await
        .unwrap();

    for action in [
        WorkflowAction::PrepareEntry,
        WorkflowAction::MarkEntryReady,
        WorkflowAction::FileEntry,
    ] {
        core.services
            .workflow
            .attempt_transition(pre.id, action, None)
            .await
            .unwrap();
    }

    let result = core
        .services
        .workflow
        .update_regulatory_fields(
            pre.id,
            ftz_core::services::workflow::RegulatoryFieldsInput {
                filing_district_port: Some("3901".to_string()),
                entry_filer_code: Some("XYZ".to_string()),
                carrier_code: Some("UPSN".to_string()),
                importer_of_record: None,
                weekly_entry: false,
                zone_week_ending_date: None,
            },
        )
        .await;
    assert_matches!(result, Err(CoreError::InvalidTransition { .. }));
}

#[tokio::test]
async fn unpinned_items_consume_lots_oldest_first() {
    let core = setup().await;
    let part_id = Uuid::new_v4();
    let older = seed_lot(&core, part_id, 30).await;
    let newer = seed_lot(&core, part_id, 40).await;

    let pre = core
        .services
        .allocation
        .create_preshipment(preshipment_request("PS-FIFO", part_id, 50))
        .await
        .unwrap();
    advance_to(&core, pre.id, Stage::ReadyToShip).await;

    core.services
        .workflow
        .driver_signoff(pre.id, signoff_payload())
        .await
        .unwrap();

    assert_eq!(core.services.ledger.current_quantity(older.id).await.unwrap(), 0);
    assert_eq!(core.services.ledger.current_quantity(newer.id).await.unwrap(), 20);
}

#[tokio::test]
async fn pinned_items_consume_only_their_lot() {
    let core = setup().await;
    let part_id = Uuid::new_v4();
    let first = seed_lot(&core, part_id, 30).await;
    let second = seed_lot(&core, part_id, 40).await;

    let mut request = preshipment_request("PS-PINNED", part_id, 10);
    request.items = vec![ItemRequest {
        part_id,
        lot_id: Some(second.id),
        quantity: 10,
        unit_value: dec!(10),
    }];
    let pre = core.services.allocation.create_preshipment(request).await.unwrap();
    advance_to(&core, pre.id, Stage::Staged).await;

    core.services
        .workflow
        .driver_signoff(pre.id, signoff_payload())
        .await
        .unwrap();

    assert_eq!(core.services.ledger.current_quantity(first.id).await.unwrap(), 30);
    assert_eq!(core.services.ledger.current_quantity(second.id).await.unwrap(), 30);
}

#[tokio::test]
async fn signoff_requires_driver_details() {
    let core = setup().await;
    let part_id = Uuid::new_v4();
    seed_lot(&core, part_id, 100).await;

    let pre = core
        .services
        .allocation
        .create_preshipment(preshipment_request("PS-NODRV", part_id, 10))
        .await
        .unwrap();
    advance_to(&core, pre.id, Stage::ReadyToShip).await;

    assert_matches!(
        core.services
            .workflow
            .attempt_transition(pre.id, WorkflowAction::DriverSignoff, None)
            .await,
        Err(CoreError::Validation(_))
    );

    let mut payload = signoff_payload();
    payload.driver_license = String::new();
    assert_matches!(
        core.services.workflow.driver_signoff(pre.id, payload).await,
        Err(CoreError::Validation(_))
    );
}

#[tokio::test]
async fn cancelled_shipments_accept_no_further_actions() {
    let core = setup().await;
    let part_id = Uuid::new_v4();
    seed_lot(&core, part_id, 100).await;

    let pre = core
        .services
        .allocation
        .create_preshipment(preshipment_request("PS-CXL", part_id, 10))
        .await
        .unwrap();

    core.services
        .workflow
        .attempt_transition(pre.id, WorkflowAction::Cancel, None)
        .await
        .unwrap();

    for action in [WorkflowAction::Advance, WorkflowAction::Hold, WorkflowAction::Cancel] {
        assert_matches!(
            core.services
                .workflow
                .attempt_transition(pre.id, action, None)
                .await,
            Err(CoreError::InvalidTransition { .. }),
            "{action:?} must be rejected after cancellation"
        );
    }
}

#[tokio::test]
async fn unknown_preshipment_reports_not_found() {
    let core = setup().await;
    let missing = Uuid::new_v4();

    assert_matches!(
        core.services
            .workflow
            .attempt_transition(missing, WorkflowAction::Advance, None)
            .await,
        Err(CoreError::NotFound(_))
    );
    assert_matches!(
        core.services.workflow.generate_label(missing).await,
        Err(CoreError::NotFound(_))
    );
}
