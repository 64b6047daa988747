//! Shadow-side date rollup.
//!
//! Used for trees that have cut over: the whole batch is computed on the
//! shadow tables (`dates_sources` aggregated over `parent_links`) and the
//! legacy strategies never run for those trees. Semantics match the legacy
//! side — fixed overrides, min/max over children, null children absent,
//! unchanged rows skipped — and ancestors are scheduled the same way,
//! mapped back to their epics.

use crate::error::Result;
use crate::model::DatesSource;
use crate::services::RollupScheduler;
use crate::storage::sqlite;
use crate::storage::SqliteStorage;
use chrono::NaiveDate;
use rusqlite::Connection;
use std::collections::HashSet;

/// Recompute shadow dates for the given epics' work items.
///
/// Epics without a shadow counterpart are skipped. Returns the work item
/// ids whose date rows changed.
///
/// # Errors
///
/// Returns an error if a batch transaction fails; earlier batches stay
/// committed.
pub fn recompute(
    storage: &mut SqliteStorage,
    actor: &str,
    epic_ids: &[String],
    batch_size: usize,
    scheduler: &mut dyn RollupScheduler,
) -> Result<Vec<String>> {
    let mut work_items = Vec::new();
    for epic_id in epic_ids {
        match storage.get_epic(epic_id)? {
            Some(epic) => match epic.work_item_id {
                Some(work_item_id) => work_items.push(work_item_id),
                None => {
                    tracing::debug!(epic_id, "cut-over epic has no shadow record, skipping");
                }
            },
            None => tracing::debug!(epic_id, "skipping vanished epic in shadow rollup"),
        }
    }

    let batch_scope: HashSet<String> = work_items.iter().cloned().collect();
    let mut all_changed = Vec::new();

    for chunk in work_items.chunks(batch_size.max(1)) {
        let chunk = chunk.to_vec();
        let scope = batch_scope.clone();
        let (changed, ancestors) =
            storage.mutate("shadow_rollup_batch", actor, move |tx, _ctx| {
                let changed = recompute_batch(tx, &chunk)?;
                let ancestors = ancestor_epics(tx, &chunk, &scope)?;
                Ok((changed, ancestors))
            })?;
        all_changed.extend(changed);
        scheduler.schedule(ancestors);
    }

    Ok(all_changed)
}

fn recompute_batch(tx: &Connection, work_item_ids: &[String]) -> Result<Vec<String>> {
    let mut changed = Vec::new();

    for work_item_id in work_item_ids {
        let current = sqlite::dates_source_of(tx, work_item_id)?.unwrap_or_else(|| DatesSource {
            work_item_id: work_item_id.clone(),
            ..DatesSource::default()
        });

        let contributions = sqlite::shadow_child_contributions(tx, work_item_id)?;

        let (start, start_source) = if current.start_date_is_fixed {
            (current.start_date_fixed, None)
        } else {
            pick(&contributions, true)
        };
        let (due, due_source) = if current.due_date_is_fixed {
            (current.due_date_fixed, None)
        } else {
            pick(&contributions, false)
        };

        let next = DatesSource {
            start_date: start,
            due_date: due,
            start_date_sourcing_work_item_id: start_source,
            due_date_sourcing_work_item_id: due_source,
            ..current.clone()
        };

        if next == current {
            continue;
        }
        sqlite::write_dates_source(tx, &next)?;
        changed.push(work_item_id.clone());
    }

    Ok(changed)
}

/// Min (start) or max (due) over the children's shadow dates.
fn pick(
    contributions: &[(String, Option<NaiveDate>, Option<NaiveDate>)],
    start: bool,
) -> (Option<NaiveDate>, Option<String>) {
    let mut winner: Option<(NaiveDate, &str)> = None;
    for (child_id, child_start, child_due) in contributions {
        let candidate = if start { child_start } else { child_due };
        let Some(candidate) = candidate else {
            continue;
        };
        let better = winner.is_none_or(|(best, _)| {
            if start {
                *candidate < best
            } else {
                *candidate > best
            }
        });
        if better {
            winner = Some((*candidate, child_id));
        }
    }
    match winner {
        Some((date, child_id)) => (Some(date), Some(child_id.to_string())),
        None => (None, None),
    }
}

/// Epics backing the batch items' parents, excluding parents already in
/// the batch and parents sitting inside an affected subtree (cycles).
fn ancestor_epics(
    tx: &Connection,
    work_item_ids: &[String],
    batch_scope: &HashSet<String>,
) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut ancestors = Vec::new();

    for work_item_id in work_item_ids {
        let Some(link) = sqlite::parent_link_of(tx, work_item_id)? else {
            continue;
        };
        let parent_id = link.parent_id;
        if batch_scope.contains(&parent_id) || !seen.insert(parent_id.clone()) {
            continue;
        }
        let chain = sqlite::shadow_ancestors_of(tx, &parent_id)?;
        if chain.iter().any(|ancestor| batch_scope.contains(ancestor)) {
            continue;
        }
        match sqlite::epic_id_by_work_item(tx, &parent_id)? {
            Some(epic_id) => ancestors.push(epic_id),
            None => tracing::debug!(
                work_item_id = %parent_id,
                "shadow parent has no epic to schedule"
            ),
        }
    }

    Ok(ancestors)
}
