//! Date rollup coordination.
//!
//! The coordinator owns the routing decision: for every tree touched by a
//! recomputation request it reads the cutover flag once and sends the
//! whole tree either through the legacy strategies or through the
//! shadow-side service — never both, two writers would silently overwrite
//! each other. Legacy work runs in bounded batches, one transaction per
//! batch, and ancestors beyond the batch are handed to the scheduler
//! instead of recursing.

pub mod hierarchy;
pub mod strategy;

pub use strategy::InheritedDateStrategy;

use crate::error::Result;
use crate::services::{CutoverFlags, EngineConfig, RollupScheduler};
use crate::storage::sqlite;
use crate::storage::SqliteStorage;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};

/// What one `recompute` invocation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupSummary {
    /// Epics whose legacy dates changed.
    pub legacy_changed: Vec<String>,
    /// Work items whose shadow dates changed.
    pub shadow_changed: Vec<String>,
}

/// Routes and batches date recomputation.
pub struct RollupCoordinator<'a> {
    flags: &'a dyn CutoverFlags,
    batch_size: usize,
}

impl<'a> RollupCoordinator<'a> {
    #[must_use]
    pub fn new(flags: &'a dyn CutoverFlags) -> Self {
        Self::with_config(flags, &EngineConfig::default())
    }

    #[must_use]
    pub fn with_config(flags: &'a dyn CutoverFlags, config: &EngineConfig) -> Self {
        Self {
            flags,
            batch_size: config.rollup_batch_size.max(1),
        }
    }

    /// Recompute effective dates for the given epics and schedule their
    /// ancestors for deferred follow-up.
    ///
    /// Ids that no longer resolve are skipped; duplicates are collapsed.
    ///
    /// # Errors
    ///
    /// A failed batch transaction aborts the invocation; batches already
    /// committed stay committed, and the deferred queue will pick the
    /// remainder up on its next pass.
    pub fn recompute(
        &self,
        storage: &mut SqliteStorage,
        actor: &str,
        epic_ids: &[String],
        scheduler: &mut dyn RollupScheduler,
    ) -> Result<RollupSummary> {
        let mut affected = Vec::new();
        let mut affected_set = HashSet::new();
        for epic_id in epic_ids {
            if affected_set.insert(epic_id.clone()) {
                affected.push(epic_id.clone());
            }
        }

        // Read each tree's routing flag once, up front; re-checking
        // mid-batch could split writes across both sides.
        let mut group_cutover: HashMap<String, bool> = HashMap::new();
        let mut legacy_ids = Vec::new();
        let mut shadow_ids = Vec::new();
        for epic_id in &affected {
            let Some(epic) = storage.get_epic(epic_id)? else {
                tracing::debug!(epic_id, "skipping vanished epic in rollup request");
                continue;
            };
            let cutover = *group_cutover
                .entry(epic.group_id.clone())
                .or_insert_with(|| self.flags.shadow_rollup(&epic.group_id));
            if cutover {
                shadow_ids.push(epic_id.clone());
            } else {
                legacy_ids.push(epic_id.clone());
            }
        }

        tracing::debug!(
            legacy = legacy_ids.len(),
            shadow = shadow_ids.len(),
            "rollup routed"
        );

        let mut summary = RollupSummary::default();

        for chunk in legacy_ids.chunks(self.batch_size) {
            let chunk = chunk.to_vec();
            let scope = affected_set.clone();
            let (changed, ancestors) = storage.mutate("rollup_batch", actor, move |tx, _ctx| {
                let start = InheritedDateStrategy::start_date().apply(tx, &chunk)?;
                let due = InheritedDateStrategy::due_date().apply(tx, &chunk)?;
                let mut changed = start;
                for epic_id in due {
                    if !changed.contains(&epic_id) {
                        changed.push(epic_id);
                    }
                }
                let ancestors = ancestor_batch(tx, &chunk, &scope)?;
                Ok((changed, ancestors))
            })?;
            summary.legacy_changed.extend(changed);
            scheduler.schedule(ancestors);
        }

        if !shadow_ids.is_empty() {
            summary.shadow_changed =
                hierarchy::recompute(storage, actor, &shadow_ids, self.batch_size, scheduler)?;
        }

        Ok(summary)
    }
}

/// Parents of the batch that still need recomputation: not part of the
/// affected set themselves, and not sitting inside an affected subtree (a
/// parent that descends from an affected node means the hierarchy loops).
fn ancestor_batch(
    tx: &Connection,
    batch: &[String],
    affected: &HashSet<String>,
) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut ancestors = Vec::new();

    for epic_id in batch {
        let Some(epic) = sqlite::epic_by_id(tx, epic_id)? else {
            continue;
        };
        let Some(parent_id) = epic.parent_id else {
            continue;
        };
        if affected.contains(&parent_id) || !seen.insert(parent_id.clone()) {
            continue;
        }
        let chain = sqlite::ancestors_of(tx, &parent_id)?;
        if chain.iter().any(|ancestor| affected.contains(ancestor)) {
            tracing::debug!(
                epic_id = %parent_id,
                "not scheduling ancestor inside an affected subtree"
            );
            continue;
        }
        ancestors.push(parent_id);
    }

    Ok(ancestors)
}
