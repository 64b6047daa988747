//! Shadow-side primitives.
//!
//! These operate purely on the shadow tables (`work_items`,
//! `parent_links`) and know nothing about the legacy records; the mirror
//! contract in [`crate::services::sync`] is their only caller inside the
//! engine.

use crate::error::{Result, TrellisError};
use crate::model::{NodeState, RelativePosition};
use crate::ordering;
use crate::storage::sqlite;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

/// Reorder a work item's edge relative to an adjacent sibling edge.
///
/// The `anchor` names the side the adjacent occupies relative to the
/// moving item's target slot: `Before` puts the adjacent ahead of the slot
/// (the moving item lands after it), `After` puts the adjacent past the
/// slot (the moving item lands before it).
///
/// Returns the new position key.
///
/// # Errors
///
/// Returns an error if either edge is missing under `parent_id`, or the
/// position gap is exhausted.
pub fn reorder_link(
    tx: &Connection,
    parent_id: &str,
    moving_id: &str,
    adjacent_id: &str,
    anchor: RelativePosition,
) -> Result<i64> {
    if link_position(tx, parent_id, moving_id)?.is_none() {
        return Err(TrellisError::WorkItemNotFound {
            id: moving_id.to_string(),
        });
    }
    let Some(adjacent) = link_position(tx, parent_id, adjacent_id)? else {
        return Err(TrellisError::WorkItemNotFound {
            id: adjacent_id.to_string(),
        });
    };

    let new_position = match anchor {
        RelativePosition::Before => {
            let upper = neighbor(tx, parent_id, adjacent, moving_id, false)?;
            ordering::position_between(Some(adjacent), upper)?
        }
        RelativePosition::After => {
            let lower = neighbor(tx, parent_id, adjacent, moving_id, true)?;
            ordering::position_between(lower, Some(adjacent))?
        }
    };

    sqlite::set_parent_link_position(tx, moving_id, new_position)?;
    Ok(new_position)
}

/// Apply a lifecycle state to a work item, copying the timestamps the
/// legacy side settled on.
///
/// # Errors
///
/// Returns an error if the work item does not exist.
pub fn transition_work_item(
    tx: &Connection,
    work_item_id: &str,
    state: NodeState,
    closed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
) -> Result<()> {
    sqlite::set_work_item_state(tx, work_item_id, state, closed_at, updated_at)?;
    let changed = tx.changes();
    if changed == 0 {
        return Err(TrellisError::WorkItemNotFound {
            id: work_item_id.to_string(),
        });
    }
    Ok(())
}

fn link_position(tx: &Connection, parent_id: &str, work_item_id: &str) -> Result<Option<i64>> {
    let position: Option<i64> = tx
        .query_row(
            "SELECT relative_position FROM parent_links
             WHERE work_item_id = ? AND parent_id = ?",
            rusqlite::params![work_item_id, parent_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(position)
}

fn neighbor(
    tx: &Connection,
    parent_id: &str,
    position: i64,
    exclude_id: &str,
    below: bool,
) -> Result<Option<i64>> {
    let sql = if below {
        "SELECT MAX(relative_position) FROM parent_links
         WHERE parent_id = ? AND relative_position < ? AND work_item_id <> ?"
    } else {
        "SELECT MIN(relative_position) FROM parent_links
         WHERE parent_id = ? AND relative_position > ? AND work_item_id <> ?"
    };
    let result: Option<i64> = tx.query_row(
        sql,
        rusqlite::params![parent_id, position, exclude_id],
        |row| row.get(0),
    )?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{WorkItem, WorkItemKind};
    use crate::storage::SqliteStorage;
    use chrono::TimeZone;

    fn work_item(id: &str, kind: WorkItemKind) -> WorkItem {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        WorkItem {
            id: id.to_string(),
            kind,
            namespace_id: "grp-1".to_string(),
            title: format!("WI {id}"),
            state: NodeState::Opened,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    fn seed(storage: &mut SqliteStorage) {
        storage
            .create_work_item(&work_item("wi-parent", WorkItemKind::Epic), "tester")
            .unwrap();
        for id in ["wi-a", "wi-b", "wi-c"] {
            storage
                .create_work_item(&work_item(id, WorkItemKind::Issue), "tester")
                .unwrap();
            storage.create_parent_link(id, "wi-parent", "tester").unwrap();
        }
    }

    fn order(storage: &SqliteStorage) -> Vec<String> {
        storage
            .shadow_children_of("wi-parent")
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    #[test]
    fn before_anchor_lands_after_the_adjacent() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        seed(&mut storage);

        storage
            .mutate("reorder", "tester", |tx, _ctx| {
                reorder_link(tx, "wi-parent", "wi-a", "wi-b", RelativePosition::Before)
            })
            .unwrap();

        assert_eq!(order(&storage), vec!["wi-b", "wi-a", "wi-c"]);
    }

    #[test]
    fn after_anchor_lands_before_the_adjacent() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        seed(&mut storage);

        storage
            .mutate("reorder", "tester", |tx, _ctx| {
                reorder_link(tx, "wi-parent", "wi-c", "wi-a", RelativePosition::After)
            })
            .unwrap();

        assert_eq!(order(&storage), vec!["wi-c", "wi-a", "wi-b"]);
    }

    #[test]
    fn missing_edge_is_an_error() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        seed(&mut storage);

        let result = storage.mutate("reorder", "tester", |tx, _ctx| {
            reorder_link(tx, "wi-parent", "wi-ghost", "wi-b", RelativePosition::Before)
        });
        assert!(matches!(
            result,
            Err(TrellisError::WorkItemNotFound { .. })
        ));
    }

    #[test]
    fn transition_copies_timestamps() {
        let mut storage = SqliteStorage::open_memory().unwrap();
        seed(&mut storage);

        let closed_at = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        storage
            .mutate("close", "tester", |tx, _ctx| {
                transition_work_item(tx, "wi-a", NodeState::Closed, Some(closed_at), closed_at)
            })
            .unwrap();

        let item = storage.get_work_item("wi-a").unwrap().unwrap();
        assert_eq!(item.state, NodeState::Closed);
        assert_eq!(item.closed_at, Some(closed_at));
        assert_eq!(item.updated_at, closed_at);
    }
}
