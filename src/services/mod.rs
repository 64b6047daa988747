//! Tree mutation and rollup services, plus the collaborator seams they
//! call into.
//!
//! The engine assumes permissions, job scheduling and event delivery are
//! provided by the embedding application; the traits here are those
//! contracts. Small in-memory implementations are included for embedders
//! that do not need anything richer, and for tests.

pub mod lifecycle;
pub mod links;
pub mod rollup;
pub mod shadow;
pub mod sync;
pub mod tree_reorder;

use crate::error::Result;
use crate::model::DomainEvent;
use crate::storage::SqliteStorage;
use std::collections::HashSet;
use std::path::Path;

/// Abilities the engine asks the permission oracle about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ability {
    /// Reorder/re-link children under a container.
    AdminRelation,
    /// Administer a container's whole subtree (required to move the
    /// container itself).
    AdminTree,
    /// Close or reopen an item.
    UpdateLifecycle,
}

/// What a permission check targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PermissionTarget {
    Epic(String),
    IssueLink(String),
    Group(String),
}

/// Permission oracle consulted before any mutation.
pub trait PermissionOracle {
    fn can(&self, actor: &str, ability: Ability, target: &PermissionTarget) -> bool;
}

/// Grants everything. For embedders that enforce permissions upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionOracle for AllowAll {
    fn can(&self, _actor: &str, _ability: Ability, _target: &PermissionTarget) -> bool {
        true
    }
}

/// Denies everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl PermissionOracle for DenyAll {
    fn can(&self, _actor: &str, _ability: Ability, _target: &PermissionTarget) -> bool {
        false
    }
}

/// Per-tree routing flag for date rollups: when a group has cut over, the
/// shadow-side service computes its dates and the legacy strategies must
/// not run for that tree.
pub trait CutoverFlags {
    fn shadow_rollup(&self, group_id: &str) -> bool;
}

/// No tree has cut over.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCutover;

impl CutoverFlags for NoCutover {
    fn shadow_rollup(&self, _group_id: &str) -> bool {
        false
    }
}

/// A fixed set of cut-over groups.
#[derive(Debug, Clone, Default)]
pub struct StaticCutover {
    groups: HashSet<String>,
}

impl StaticCutover {
    #[must_use]
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(groups: I) -> Self {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }
}

impl CutoverFlags for StaticCutover {
    fn shadow_rollup(&self, group_id: &str) -> bool {
        self.groups.contains(group_id)
    }
}

/// Producer side of the deferred-rollup queue. Each call hands over one
/// batch of ancestor epic ids for later recomputation; delivery is
/// at-least-once, which is safe because recomputation works from current
/// state.
pub trait RollupScheduler {
    fn schedule(&mut self, ancestor_ids: Vec<String>);
}

/// Collects scheduled batches in memory; drain and feed them back into the
/// coordinator, or assert on them in tests.
#[derive(Debug, Default)]
pub struct InMemoryScheduler {
    batches: Vec<Vec<String>>,
}

impl InMemoryScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<Vec<String>> {
        std::mem::take(&mut self.batches)
    }

    #[must_use]
    pub fn pending(&self) -> &[Vec<String>] {
        &self.batches
    }
}

impl RollupScheduler for InMemoryScheduler {
    fn schedule(&mut self, ancestor_ids: Vec<String>) {
        if !ancestor_ids.is_empty() {
            self.batches.push(ancestor_ids);
        }
    }
}

/// Domain event bus for lifecycle notifications.
pub trait EventBus {
    fn publish(&mut self, event: DomainEvent);
}

/// Buffers published events in memory.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    events: Vec<DomainEvent>,
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> &[DomainEvent] {
        &self.events
    }
}

impl EventBus for InMemoryBus {
    fn publish(&mut self, event: DomainEvent) {
        self.events.push(event);
    }
}

/// Tunables shared by the services.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Epics recomputed per rollup transaction; bounds lock scope.
    pub rollup_batch_size: usize,
    /// SQLite busy timeout handed to `open_with_timeout`.
    pub busy_timeout_ms: Option<u64>,
}

impl EngineConfig {
    /// Open a storage handle honoring this config's busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open_storage(&self, path: &Path) -> Result<SqliteStorage> {
        SqliteStorage::open_with_timeout(path, self.busy_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rollup_batch_size: 100,
            busy_timeout_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DomainEventKind;

    #[test]
    fn static_cutover_matches_listed_groups() {
        let flags = StaticCutover::new(["grp-1"]);
        assert!(flags.shadow_rollup("grp-1"));
        assert!(!flags.shadow_rollup("grp-2"));
    }

    #[test]
    fn scheduler_drops_empty_batches() {
        let mut scheduler = InMemoryScheduler::new();
        scheduler.schedule(vec![]);
        scheduler.schedule(vec!["ep-1".to_string()]);
        assert_eq!(scheduler.drain(), vec![vec!["ep-1".to_string()]]);
        assert!(scheduler.pending().is_empty());
    }

    #[test]
    fn bus_buffers_events() {
        let mut bus = InMemoryBus::new();
        bus.publish(DomainEvent {
            kind: DomainEventKind::EpicClosed,
            epic_id: "ep-1".to_string(),
            group_id: "grp-1".to_string(),
        });
        assert_eq!(bus.events().len(), 1);
    }

    #[test]
    fn default_config_uses_batch_of_100() {
        assert_eq!(EngineConfig::default().rollup_batch_size, 100);
    }

    #[test]
    fn config_opens_storage_with_its_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            busy_timeout_ms: Some(250),
            ..EngineConfig::default()
        };
        let storage = config.open_storage(&dir.path().join("trellis.db")).unwrap();
        assert!(storage.get_epic("ep-none").unwrap().is_none());
    }
}
