//! Lifecycle transition scenarios: idempotence, event emission, shadow
//! timestamp sync, audit history.

mod common;

use common::{fixtures, test_db};
use trellis::model::{DomainEventKind, NodeState, WorkItemKind};
use trellis::services::lifecycle::LifecycleService;
use trellis::services::{AllowAll, InMemoryBus};

#[test]
fn close_is_idempotent_and_emits_one_event() {
    let mut storage = test_db();
    storage.create_epic(&fixtures::epic("ep-1", None), "tester").unwrap();
    let mut bus = InMemoryBus::new();
    let mut service = LifecycleService::new(&AllowAll, &mut bus);

    let first = service.close(&mut storage, "tester", "ep-1").unwrap();
    assert!(first.changed());
    assert_eq!(first.epic().state, NodeState::Closed);

    let second = service.close(&mut storage, "tester", "ep-1").unwrap();
    assert!(!second.changed());
    assert_eq!(second.epic().state, NodeState::Closed);

    assert_eq!(bus.events().len(), 1);
    let event = &bus.events()[0];
    assert_eq!(event.kind, DomainEventKind::EpicClosed);
    assert_eq!(event.epic_id, "ep-1");
    assert_eq!(event.group_id, "grp-1");
}

#[test]
fn reopen_is_idempotent_too() {
    let mut storage = test_db();
    storage.create_epic(&fixtures::epic("ep-1", None), "tester").unwrap();
    let mut bus = InMemoryBus::new();

    // Reopening an already-open epic changes nothing and emits nothing.
    let outcome = LifecycleService::new(&AllowAll, &mut bus)
        .reopen(&mut storage, "tester", "ep-1")
        .unwrap();
    assert!(!outcome.changed());
    assert!(bus.events().is_empty());

    let mut service = LifecycleService::new(&AllowAll, &mut bus);
    service.close(&mut storage, "tester", "ep-1").unwrap();
    let outcome = service.reopen(&mut storage, "tester", "ep-1").unwrap();
    assert!(outcome.changed());
    assert_eq!(outcome.epic().state, NodeState::Opened);
    assert_eq!(outcome.epic().closed_at, None);
    assert_eq!(bus.events().len(), 2);
}

#[test]
fn both_representations_transition_together() {
    let mut storage = test_db();
    storage
        .create_work_item(&fixtures::work_item("wi-1", WorkItemKind::Epic), "tester")
        .unwrap();
    storage
        .create_epic(&fixtures::shadowed_epic("ep-1", None, "wi-1"), "tester")
        .unwrap();

    let mut bus = InMemoryBus::new();
    let mut service = LifecycleService::new(&AllowAll, &mut bus);
    service.close(&mut storage, "tester", "ep-1").unwrap();

    let legacy = storage.get_epic("ep-1").unwrap().unwrap();
    let shadow = storage.get_work_item("wi-1").unwrap().unwrap();
    assert_eq!(legacy.state, NodeState::Closed);
    assert_eq!(shadow.state, NodeState::Closed);
    assert_eq!(shadow.closed_at, legacy.closed_at);
    assert_eq!(shadow.updated_at, legacy.updated_at);
}

#[test]
fn redundant_close_records_no_audit_event() {
    let mut storage = test_db();
    storage.create_epic(&fixtures::epic("ep-1", None), "tester").unwrap();
    let mut bus = InMemoryBus::new();
    let mut service = LifecycleService::new(&AllowAll, &mut bus);

    service.close(&mut storage, "tester", "ep-1").unwrap();
    service.close(&mut storage, "tester", "ep-1").unwrap();

    let closes = storage
        .get_events("ep-1")
        .unwrap()
        .into_iter()
        .filter(|event| event.action.as_str() == "closed")
        .count();
    assert_eq!(closes, 1);
}
