//! Idempotent lifecycle transitions.
//!
//! `close` and `reopen` apply to the legacy record and its shadow
//! counterpart inside one transaction. A redundant request — closing an
//! already-closed item, reopening an open one — short-circuits to
//! [`TransitionOutcome::Unchanged`] before the shadow side is touched:
//! callers asking for a state the item is already in have not failed.

use crate::error::{Result, TrellisError};
use crate::model::{AuditAction, DomainEvent, DomainEventKind, Epic, NodeRef, NodeState};
use crate::services::sync;
use crate::services::{Ability, EventBus, PermissionOracle, PermissionTarget};
use crate::storage::sqlite;
use crate::storage::SqliteStorage;
use chrono::Utc;

/// Tagged result of a transition: a redundant request is a success with no
/// side effects, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Changed(Epic),
    Unchanged(Epic),
}

impl TransitionOutcome {
    #[must_use]
    pub const fn epic(&self) -> &Epic {
        match self {
            Self::Changed(epic) | Self::Unchanged(epic) => epic,
        }
    }

    #[must_use]
    pub const fn changed(&self) -> bool {
        matches!(self, Self::Changed(_))
    }
}

/// Applies close/reopen transitions to both representations.
pub struct LifecycleService<'a> {
    perms: &'a dyn PermissionOracle,
    bus: &'a mut dyn EventBus,
}

impl<'a> LifecycleService<'a> {
    #[must_use]
    pub fn new(perms: &'a dyn PermissionOracle, bus: &'a mut dyn EventBus) -> Self {
        Self { perms, bus }
    }

    /// Close an epic.
    ///
    /// # Errors
    ///
    /// Returns `EpicNotFound`, `LifecyclePermissionDenied`, or a `Sync`
    /// error when the shadow transition fails (the legacy change is rolled
    /// back with it).
    pub fn close(
        &mut self,
        storage: &mut SqliteStorage,
        actor: &str,
        epic_id: &str,
    ) -> Result<TransitionOutcome> {
        self.transition(storage, actor, epic_id, NodeState::Closed)
    }

    /// Reopen an epic.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::close`].
    pub fn reopen(
        &mut self,
        storage: &mut SqliteStorage,
        actor: &str,
        epic_id: &str,
    ) -> Result<TransitionOutcome> {
        self.transition(storage, actor, epic_id, NodeState::Opened)
    }

    fn transition(
        &mut self,
        storage: &mut SqliteStorage,
        actor: &str,
        epic_id: &str,
        target: NodeState,
    ) -> Result<TransitionOutcome> {
        let Some(epic) = storage.get_epic(epic_id)? else {
            return Err(TrellisError::EpicNotFound {
                id: epic_id.to_string(),
            });
        };

        if !self.perms.can(
            actor,
            Ability::UpdateLifecycle,
            &PermissionTarget::Epic(epic.id.clone()),
        ) {
            return Err(TrellisError::LifecyclePermissionDenied);
        }

        if epic.state == target {
            tracing::debug!(epic_id, state = %target, "transition is a no-op");
            return Ok(TransitionOutcome::Unchanged(epic));
        }

        let now = Utc::now();
        let closed_at = match target {
            NodeState::Closed => Some(now),
            NodeState::Opened => None,
        };
        let (op, action, event_kind) = match target {
            NodeState::Closed => ("close_epic", AuditAction::Closed, DomainEventKind::EpicClosed),
            NodeState::Opened => (
                "reopen_epic",
                AuditAction::Reopened,
                DomainEventKind::EpicReopened,
            ),
        };

        let work_item_id = epic.work_item_id.clone();
        let node_ref = NodeRef::Epic(epic.id.clone());
        storage.mutate(op, actor, |tx, ctx| {
            sqlite::set_epic_state(tx, epic_id, target, closed_at, now)?;
            if let Some(work_item_id) = &work_item_id {
                // The shadow record takes the legacy side's timestamps.
                sync::mirror_transition(tx, work_item_id, target, closed_at, now, &node_ref)?;
            }
            ctx.record_event(action, epic_id, None);
            Ok(())
        })?;

        tracing::info!(epic_id, state = %target, "epic transitioned");
        self.bus.publish(DomainEvent {
            kind: event_kind,
            epic_id: epic.id.clone(),
            group_id: epic.group_id.clone(),
        });

        let updated = storage
            .get_epic(epic_id)?
            .ok_or_else(|| TrellisError::EpicNotFound {
                id: epic_id.to_string(),
            })?;
        Ok(TransitionOutcome::Changed(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{WorkItem, WorkItemKind};
    use crate::services::{AllowAll, DenyAll, InMemoryBus};
    use chrono::TimeZone;

    fn epic(id: &str) -> Epic {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Epic {
            id: id.to_string(),
            group_id: "grp-1".to_string(),
            title: format!("Epic {id}"),
            parent_id: None,
            relative_position: 0,
            state: NodeState::Opened,
            created_at: now,
            updated_at: now,
            closed_at: None,
            start_date: None,
            due_date: None,
            start_date_is_fixed: false,
            start_date_fixed: None,
            due_date_is_fixed: false,
            due_date_fixed: None,
            start_date_sourcing_child_id: None,
            due_date_sourcing_child_id: None,
            work_item_id: None,
        }
    }

    #[test]
    fn close_then_close_again_is_unchanged() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage.create_epic(&epic("ep-1"), "tester").unwrap();
        let mut bus = InMemoryBus::new();
        let mut service = LifecycleService::new(&AllowAll, &mut bus);

        let first = service.close(&mut storage, "tester", "ep-1").unwrap();
        assert!(first.changed());
        assert_eq!(first.epic().state, NodeState::Closed);
        assert!(first.epic().closed_at.is_some());

        let second = service.close(&mut storage, "tester", "ep-1").unwrap();
        assert!(!second.changed());

        // One transition, one event.
        assert_eq!(bus.events().len(), 1);
        assert_eq!(bus.events()[0].kind, DomainEventKind::EpicClosed);
    }

    #[test]
    fn reopen_clears_closed_at_on_both_sides() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        storage
            .create_work_item(
                &WorkItem {
                    id: "wi-1".to_string(),
                    kind: WorkItemKind::Epic,
                    namespace_id: "grp-1".to_string(),
                    title: "shadow".to_string(),
                    state: NodeState::Opened,
                    created_at: now,
                    updated_at: now,
                    closed_at: None,
                },
                "tester",
            )
            .unwrap();
        let mut item = epic("ep-1");
        item.work_item_id = Some("wi-1".to_string());
        storage.create_epic(&item, "tester").unwrap();

        let mut bus = InMemoryBus::new();
        let mut service = LifecycleService::new(&AllowAll, &mut bus);
        service.close(&mut storage, "tester", "ep-1").unwrap();

        let shadow = storage.get_work_item("wi-1").unwrap().unwrap();
        let legacy = storage.get_epic("ep-1").unwrap().unwrap();
        assert_eq!(shadow.state, NodeState::Closed);
        assert_eq!(shadow.closed_at, legacy.closed_at);
        assert_eq!(shadow.updated_at, legacy.updated_at);

        service.reopen(&mut storage, "tester", "ep-1").unwrap();
        let shadow = storage.get_work_item("wi-1").unwrap().unwrap();
        let legacy = storage.get_epic("ep-1").unwrap().unwrap();
        assert_eq!(legacy.state, NodeState::Opened);
        assert_eq!(legacy.closed_at, None);
        assert_eq!(shadow.state, NodeState::Opened);
        assert_eq!(shadow.closed_at, None);
    }

    #[test]
    fn missing_shadow_record_rolls_the_close_back() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        let mut item = epic("ep-1");
        item.work_item_id = Some("wi-ghost".to_string());
        storage.create_epic(&item, "tester").unwrap();

        let mut bus = InMemoryBus::new();
        let mut service = LifecycleService::new(&AllowAll, &mut bus);
        let err = service.close(&mut storage, "tester", "ep-1").unwrap_err();
        assert!(matches!(err, TrellisError::Sync(_)));

        let legacy = storage.get_epic("ep-1").unwrap().unwrap();
        assert_eq!(legacy.state, NodeState::Opened);
        assert!(bus.events().is_empty());
    }

    #[test]
    fn lifecycle_permission_is_enforced() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        storage.create_epic(&epic("ep-1"), "tester").unwrap();
        let mut bus = InMemoryBus::new();
        let mut service = LifecycleService::new(&DenyAll, &mut bus);

        let err = service.close(&mut storage, "tester", "ep-1").unwrap_err();
        assert!(matches!(err, TrellisError::LifecyclePermissionDenied));
    }
}
