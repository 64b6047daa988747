#![allow(dead_code)]

//! Shared fixtures for the scenario tests. Everything runs against real
//! in-memory `SQLite`, no mocks.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::Once;
use trellis::model::{Epic, Issue, NodeState, WorkItem, WorkItemKind};
use trellis::storage::SqliteStorage;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

pub fn test_db() -> SqliteStorage {
    init_test_logging();
    SqliteStorage::open_memory().expect("in-memory database")
}

pub fn fixed_now() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub mod fixtures {
    use super::{fixed_now, Epic, Issue, NodeState, WorkItem, WorkItemKind};

    pub fn epic(id: &str, parent: Option<&str>) -> Epic {
        let now = fixed_now();
        Epic {
            id: id.to_string(),
            group_id: "grp-1".to_string(),
            title: format!("Epic {id}"),
            parent_id: parent.map(ToString::to_string),
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

    pub fn epic_in_group(id: &str, group_id: &str, parent: Option<&str>) -> Epic {
        let mut epic = epic(id, parent);
        epic.group_id = group_id.to_string();
        epic
    }

    pub fn shadowed_epic(id: &str, parent: Option<&str>, work_item_id: &str) -> Epic {
        let mut epic = epic(id, parent);
        epic.work_item_id = Some(work_item_id.to_string());
        epic
    }

    pub fn issue(id: &str) -> Issue {
        let now = fixed_now();
        Issue {
            id: id.to_string(),
            title: format!("Issue {id}"),
            state: NodeState::Opened,
            start_date: None,
            due_date: None,
            work_item_id: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    pub fn work_item(id: &str, kind: WorkItemKind) -> WorkItem {
        let now = fixed_now();
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
}

/// Ids of an epic's children in position order.
pub fn child_order(storage: &SqliteStorage, epic_id: &str) -> Vec<String> {
    storage
        .children_of(epic_id)
        .expect("children query")
        .into_iter()
        .map(|(node, _)| node.id().to_string())
        .collect()
}

/// Ids of a work item's shadow children in position order.
pub fn shadow_order(storage: &SqliteStorage, parent_id: &str) -> Vec<String> {
    storage
        .shadow_children_of(parent_id)
        .expect("shadow children query")
        .into_iter()
        .map(|(id, _)| id)
        .collect()
}
