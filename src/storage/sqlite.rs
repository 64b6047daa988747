//! `SQLite` storage implementation.

use crate::error::Result;
use crate::model::{
    AuditAction, AuditEvent, DatesSource, Epic, Issue, IssueLink, NodeRef, NodeState, ParentLink,
    WorkItem, WorkItemKind,
};
use crate::ordering;
use crate::storage::schema::apply_schema;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// SQLite-based storage backend.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
}

/// Context for a mutation operation, tracking side effects.
///
/// Audit events and rollup-dirty marks recorded here are flushed in the
/// same transaction as the mutation itself, so a rollback discards them
/// together with the data change.
pub struct MutationContext {
    pub op_name: String,
    pub actor: String,
    pub events: Vec<AuditEvent>,
    pub rollup_dirty: HashSet<String>,
}

impl MutationContext {
    #[must_use]
    pub fn new(op_name: &str, actor: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            actor: actor.to_string(),
            events: Vec::new(),
            rollup_dirty: HashSet::new(),
        }
    }

    pub fn record_event(&mut self, action: AuditAction, node_id: &str, detail: Option<String>) {
        self.events.push(AuditEvent {
            id: 0, // Placeholder, DB assigns auto-inc ID
            node_id: node_id.to_string(),
            action,
            actor: self.actor.clone(),
            detail,
            created_at: Utc::now(),
        });
    }

    /// Mark an epic's effective dates as needing recomputation.
    pub fn mark_rollup_dirty(&mut self, epic_id: &str) {
        self.rollup_dirty.insert(epic_id.to_string());
    }
}

/// Which sibling list a position query ranges over: the children of an
/// epic, or the root epics of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingScope<'a> {
    Epic(&'a str),
    Root(&'a str),
}

impl SqliteStorage {
    /// Open a new connection to the database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema
    /// application fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a new connection with an optional busy timeout (ms).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema
    /// application fails.
    pub fn open_with_timeout(path: &Path, lock_timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;
        if let Some(timeout) = lock_timeout_ms {
            conn.busy_timeout(Duration::from_millis(timeout))?;
        }
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Execute a mutation inside one IMMEDIATE transaction.
    ///
    /// The closure does the work; recorded audit events and rollup-dirty
    /// marks are written before commit. On error the transaction is rolled
    /// back and nothing — data, events, marks — survives.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails.
    pub fn mutate<F, R>(&mut self, op: &str, actor: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let mut ctx = MutationContext::new(op, actor);

        let result = f(&tx, &mut ctx)?;

        for event in ctx.events {
            tx.execute(
                "INSERT INTO events (node_id, action, actor, detail, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                rusqlite::params![
                    event.node_id,
                    event.action.as_str(),
                    event.actor,
                    event.detail,
                    event.created_at.to_rfc3339()
                ],
            )?;
        }

        for epic_id in ctx.rollup_dirty {
            tx.execute(
                "INSERT OR REPLACE INTO rollup_dirty (epic_id, marked_at) VALUES (?, ?)",
                rusqlite::params![epic_id, Utc::now().to_rfc3339()],
            )?;
        }

        tx.commit()?;

        Ok(result)
    }

    // === Creation ===

    /// Create an epic, appended after the last sibling under its parent.
    ///
    /// The `relative_position` on the input is ignored; the assigned key is
    /// returned on the stored record.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails (e.g. ID collision).
    pub fn create_epic(&mut self, epic: &Epic, actor: &str) -> Result<Epic> {
        let mut stored = epic.clone();
        self.mutate("create_epic", actor, |tx, ctx| {
            let scope = match &stored.parent_id {
                Some(parent) => SiblingScope::Epic(parent),
                None => SiblingScope::Root(&stored.group_id),
            };
            let last = max_sibling_position(tx, scope)?;
            stored.relative_position = ordering::position_between(last, None)?;

            tx.execute(
                "INSERT INTO epics (
                    id, group_id, title, parent_id, relative_position, state,
                    created_at, updated_at, closed_at, start_date, due_date,
                    start_date_is_fixed, start_date_fixed, due_date_is_fixed,
                    due_date_fixed, start_date_sourcing_child_id,
                    due_date_sourcing_child_id, work_item_id
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    stored.id,
                    stored.group_id,
                    stored.title,
                    stored.parent_id,
                    stored.relative_position,
                    stored.state.as_str(),
                    stored.created_at.to_rfc3339(),
                    stored.updated_at.to_rfc3339(),
                    stored.closed_at.map(|dt| dt.to_rfc3339()),
                    stored.start_date.map(|d| d.to_string()),
                    stored.due_date.map(|d| d.to_string()),
                    i32::from(stored.start_date_is_fixed),
                    stored.start_date_fixed.map(|d| d.to_string()),
                    i32::from(stored.due_date_is_fixed),
                    stored.due_date_fixed.map(|d| d.to_string()),
                    stored.start_date_sourcing_child_id,
                    stored.due_date_sourcing_child_id,
                    stored.work_item_id,
                ],
            )?;

            ctx.record_event(
                AuditAction::Created,
                &stored.id,
                Some(format!("Created epic: {}", stored.title)),
            );

            Ok(())
        })?;
        Ok(stored)
    }

    /// Create a leaf issue record.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn create_issue(&mut self, issue: &Issue, actor: &str) -> Result<()> {
        self.mutate("create_issue", actor, |tx, ctx| {
            tx.execute(
                "INSERT INTO issues (
                    id, title, state, start_date, due_date, work_item_id,
                    created_at, updated_at, closed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    issue.id,
                    issue.title,
                    issue.state.as_str(),
                    issue.start_date.map(|d| d.to_string()),
                    issue.due_date.map(|d| d.to_string()),
                    issue.work_item_id,
                    issue.created_at.to_rfc3339(),
                    issue.updated_at.to_rfc3339(),
                    issue.closed_at.map(|dt| dt.to_rfc3339()),
                ],
            )?;

            ctx.record_event(
                AuditAction::Created,
                &issue.id,
                Some(format!("Created issue: {}", issue.title)),
            );

            Ok(())
        })
    }

    /// Link an issue under an epic, appended after the last sibling.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn create_issue_link(
        &mut self,
        link_id: &str,
        issue_id: &str,
        epic_id: &str,
        actor: &str,
    ) -> Result<IssueLink> {
        let now = Utc::now();
        let link_id = link_id.to_string();
        let issue_id = issue_id.to_string();
        let epic_id = epic_id.to_string();
        self.mutate("create_issue_link", actor, move |tx, ctx| {
            let last = max_sibling_position(tx, SiblingScope::Epic(&epic_id))?;
            let position = ordering::position_between(last, None)?;

            tx.execute(
                "INSERT INTO issue_links (
                    id, issue_id, epic_id, relative_position, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    link_id,
                    issue_id,
                    epic_id,
                    position,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )?;

            ctx.record_event(
                AuditAction::Created,
                &link_id,
                Some(format!("Linked issue {issue_id} under epic {epic_id}")),
            );
            ctx.mark_rollup_dirty(&epic_id);

            Ok(IssueLink {
                id: link_id.clone(),
                issue_id: issue_id.clone(),
                epic_id: epic_id.clone(),
                relative_position: position,
                created_at: now,
                updated_at: now,
            })
        })
    }

    /// Create a shadow work item.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn create_work_item(&mut self, work_item: &WorkItem, actor: &str) -> Result<()> {
        self.mutate("create_work_item", actor, |tx, _ctx| {
            tx.execute(
                "INSERT INTO work_items (
                    id, kind, namespace_id, title, state, created_at, updated_at, closed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    work_item.id,
                    work_item.kind.as_str(),
                    work_item.namespace_id,
                    work_item.title,
                    work_item.state.as_str(),
                    work_item.created_at.to_rfc3339(),
                    work_item.updated_at.to_rfc3339(),
                    work_item.closed_at.map(|dt| dt.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    /// Create or replace the shadow edge for a work item, appended after
    /// the last sibling under the shadow parent.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn create_parent_link(
        &mut self,
        work_item_id: &str,
        parent_id: &str,
        actor: &str,
    ) -> Result<ParentLink> {
        self.mutate("create_parent_link", actor, |tx, _ctx| {
            upsert_parent_link(tx, work_item_id, parent_id)
        })
    }

    /// Create or update the shadow date row for a work item.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn upsert_dates_source(&mut self, source: &DatesSource, actor: &str) -> Result<()> {
        self.mutate("upsert_dates_source", actor, |tx, _ctx| {
            write_dates_source(tx, source)?;
            Ok(())
        })
    }

    // === Reads ===

    /// Fetch an epic by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_epic(&self, id: &str) -> Result<Option<Epic>> {
        epic_by_id(&self.conn, id)
    }

    /// Fetch an issue by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_issue(&self, id: &str) -> Result<Option<Issue>> {
        issue_by_id(&self.conn, id)
    }

    /// Fetch an issue link by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_issue_link(&self, id: &str) -> Result<Option<IssueLink>> {
        issue_link_by_id(&self.conn, id)
    }

    /// Fetch a work item by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_work_item(&self, id: &str) -> Result<Option<WorkItem>> {
        work_item_by_id(&self.conn, id)
    }

    /// Fetch the shadow edge of a work item.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_parent_link(&self, work_item_id: &str) -> Result<Option<ParentLink>> {
        parent_link_of(&self.conn, work_item_id)
    }

    /// Fetch the shadow date row of a work item.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_dates_source(&self, work_item_id: &str) -> Result<Option<DatesSource>> {
        dates_source_of(&self.conn, work_item_id)
    }

    /// List the children of an epic — child epics and issue links in one
    /// list — ordered by relative position.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn children_of(&self, epic_id: &str) -> Result<Vec<(NodeRef, i64)>> {
        children_in_order(&self.conn, epic_id)
    }

    /// List the shadow children of a work item, ordered by position.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn shadow_children_of(&self, parent_id: &str) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT work_item_id, relative_position FROM parent_links
             WHERE parent_id = ? ORDER BY relative_position",
        )?;
        let rows = stmt
            .query_map([parent_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Audit history for a node, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_events(&self, node_id: &str) -> Result<Vec<AuditEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, node_id, action, actor, detail, created_at
             FROM events WHERE node_id = ? ORDER BY id",
        )?;
        let rows = stmt
            .query_map([node_id], |row| {
                Ok(AuditEvent {
                    id: row.get(0)?,
                    node_id: row.get(1)?,
                    action: audit_action(&row.get::<_, String>(2)?),
                    actor: row.get(3)?,
                    detail: row.get(4)?,
                    created_at: ts(5, &row.get::<_, String>(5)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Drain the set of epics marked as needing date recomputation.
    ///
    /// # Errors
    ///
    /// Returns an error if the queries fail.
    pub fn take_rollup_dirty(&mut self) -> Result<Vec<String>> {
        let tx = self.conn.transaction()?;
        let ids = {
            let mut stmt =
                tx.prepare("SELECT epic_id FROM rollup_dirty ORDER BY marked_at, epic_id")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?
        };
        tx.execute("DELETE FROM rollup_dirty", [])?;
        tx.commit()?;
        Ok(ids)
    }

    /// Walk an epic's ancestor chain, nearest first. Stops if a cycle is
    /// detected rather than looping.
    ///
    /// # Errors
    ///
    /// Returns an error if the queries fail.
    pub fn ancestor_ids(&self, epic_id: &str) -> Result<Vec<String>> {
        ancestors_of(&self.conn, epic_id)
    }
}

// === Transaction-scoped helpers ===
//
// These take a `Connection` so services can call them both inside a
// `mutate` transaction and on a plain storage handle.

pub(crate) fn epic_by_id(conn: &Connection, id: &str) -> Result<Option<Epic>> {
    let mut stmt = conn.prepare(
        "SELECT id, group_id, title, parent_id, relative_position, state,
                created_at, updated_at, closed_at, start_date, due_date,
                start_date_is_fixed, start_date_fixed, due_date_is_fixed,
                due_date_fixed, start_date_sourcing_child_id,
                due_date_sourcing_child_id, work_item_id
         FROM epics WHERE id = ?",
    )?;
    let result = stmt.query_row([id], epic_from_row).optional()?;
    Ok(result)
}

pub(crate) fn issue_by_id(conn: &Connection, id: &str) -> Result<Option<Issue>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, state, start_date, due_date, work_item_id,
                created_at, updated_at, closed_at
         FROM issues WHERE id = ?",
    )?;
    let result = stmt
        .query_row([id], |row| {
            Ok(Issue {
                id: row.get(0)?,
                title: row.get(1)?,
                state: state(2, &row.get::<_, String>(2)?)?,
                start_date: date_opt(3, row.get(3)?)?,
                due_date: date_opt(4, row.get(4)?)?,
                work_item_id: row.get(5)?,
                created_at: ts(6, &row.get::<_, String>(6)?)?,
                updated_at: ts(7, &row.get::<_, String>(7)?)?,
                closed_at: ts_opt(8, row.get(8)?)?,
            })
        })
        .optional()?;
    Ok(result)
}

pub(crate) fn issue_link_by_id(conn: &Connection, id: &str) -> Result<Option<IssueLink>> {
    let mut stmt = conn.prepare(
        "SELECT id, issue_id, epic_id, relative_position, created_at, updated_at
         FROM issue_links WHERE id = ?",
    )?;
    let result = stmt.query_row([id], issue_link_from_row).optional()?;
    Ok(result)
}

pub(crate) fn work_item_by_id(conn: &Connection, id: &str) -> Result<Option<WorkItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, namespace_id, title, state, created_at, updated_at, closed_at
         FROM work_items WHERE id = ?",
    )?;
    let result = stmt
        .query_row([id], |row| {
            Ok(WorkItem {
                id: row.get(0)?,
                kind: WorkItemKind::from_str(&row.get::<_, String>(1)?).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
                })?,
                namespace_id: row.get(2)?,
                title: row.get(3)?,
                state: state(4, &row.get::<_, String>(4)?)?,
                created_at: ts(5, &row.get::<_, String>(5)?)?,
                updated_at: ts(6, &row.get::<_, String>(6)?)?,
                closed_at: ts_opt(7, row.get(7)?)?,
            })
        })
        .optional()?;
    Ok(result)
}

pub(crate) fn parent_link_of(conn: &Connection, work_item_id: &str) -> Result<Option<ParentLink>> {
    let mut stmt = conn.prepare(
        "SELECT work_item_id, parent_id, relative_position, created_at, updated_at
         FROM parent_links WHERE work_item_id = ?",
    )?;
    let result = stmt
        .query_row([work_item_id], |row| {
            Ok(ParentLink {
                work_item_id: row.get(0)?,
                parent_id: row.get(1)?,
                relative_position: row.get(2)?,
                created_at: ts(3, &row.get::<_, String>(3)?)?,
                updated_at: ts(4, &row.get::<_, String>(4)?)?,
            })
        })
        .optional()?;
    Ok(result)
}

pub(crate) fn dates_source_of(
    conn: &Connection,
    work_item_id: &str,
) -> Result<Option<DatesSource>> {
    let mut stmt = conn.prepare(
        "SELECT work_item_id, start_date, due_date, start_date_is_fixed,
                start_date_fixed, due_date_is_fixed, due_date_fixed,
                start_date_sourcing_work_item_id, due_date_sourcing_work_item_id
         FROM dates_sources WHERE work_item_id = ?",
    )?;
    let result = stmt
        .query_row([work_item_id], |row| {
            Ok(DatesSource {
                work_item_id: row.get(0)?,
                start_date: date_opt(1, row.get(1)?)?,
                due_date: date_opt(2, row.get(2)?)?,
                start_date_is_fixed: row.get::<_, i64>(3)? != 0,
                start_date_fixed: date_opt(4, row.get(4)?)?,
                due_date_is_fixed: row.get::<_, i64>(5)? != 0,
                due_date_fixed: date_opt(6, row.get(6)?)?,
                start_date_sourcing_work_item_id: row.get(7)?,
                due_date_sourcing_work_item_id: row.get(8)?,
            })
        })
        .optional()?;
    Ok(result)
}

pub(crate) fn write_dates_source(tx: &Connection, source: &DatesSource) -> Result<()> {
    tx.execute(
        "INSERT INTO dates_sources (
            work_item_id, start_date, due_date, start_date_is_fixed,
            start_date_fixed, due_date_is_fixed, due_date_fixed,
            start_date_sourcing_work_item_id, due_date_sourcing_work_item_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(work_item_id) DO UPDATE SET
            start_date = excluded.start_date,
            due_date = excluded.due_date,
            start_date_is_fixed = excluded.start_date_is_fixed,
            start_date_fixed = excluded.start_date_fixed,
            due_date_is_fixed = excluded.due_date_is_fixed,
            due_date_fixed = excluded.due_date_fixed,
            start_date_sourcing_work_item_id = excluded.start_date_sourcing_work_item_id,
            due_date_sourcing_work_item_id = excluded.due_date_sourcing_work_item_id",
        rusqlite::params![
            source.work_item_id,
            source.start_date.map(|d| d.to_string()),
            source.due_date.map(|d| d.to_string()),
            i32::from(source.start_date_is_fixed),
            source.start_date_fixed.map(|d| d.to_string()),
            i32::from(source.due_date_is_fixed),
            source.due_date_fixed.map(|d| d.to_string()),
            source.start_date_sourcing_work_item_id,
            source.due_date_sourcing_work_item_id,
        ],
    )?;
    Ok(())
}

pub(crate) fn upsert_parent_link(
    tx: &Connection,
    work_item_id: &str,
    parent_id: &str,
) -> Result<ParentLink> {
    let last: Option<i64> = tx.query_row(
        "SELECT MAX(relative_position) FROM parent_links
         WHERE parent_id = ? AND work_item_id <> ?",
        rusqlite::params![parent_id, work_item_id],
        |row| row.get(0),
    )?;
    let position = ordering::position_between(last, None)?;
    let now = Utc::now();
    tx.execute(
        "INSERT INTO parent_links (
            work_item_id, parent_id, relative_position, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(work_item_id) DO UPDATE SET
            parent_id = excluded.parent_id,
            relative_position = excluded.relative_position,
            updated_at = excluded.updated_at",
        rusqlite::params![
            work_item_id,
            parent_id,
            position,
            now.to_rfc3339(),
            now.to_rfc3339(),
        ],
    )?;
    Ok(ParentLink {
        work_item_id: work_item_id.to_string(),
        parent_id: parent_id.to_string(),
        relative_position: position,
        created_at: now,
        updated_at: now,
    })
}

/// The children of an epic, spanning child epics and issue links, ordered
/// by relative position.
pub(crate) fn children_in_order(conn: &Connection, epic_id: &str) -> Result<Vec<(NodeRef, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT 'epic' AS kind, id, relative_position FROM epics WHERE parent_id = ?1
         UNION ALL
         SELECT 'issue_link' AS kind, id, relative_position FROM issue_links WHERE epic_id = ?1
         ORDER BY relative_position",
    )?;
    let rows = stmt
        .query_map([epic_id], |row| {
            let kind: String = row.get(0)?;
            let id: String = row.get(1)?;
            let position: i64 = row.get(2)?;
            let node = if kind == "epic" {
                NodeRef::Epic(id)
            } else {
                NodeRef::IssueLink(id)
            };
            Ok((node, position))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn sibling_filter(scope: SiblingScope<'_>) -> (&'static str, &'static str, String) {
    match scope {
        SiblingScope::Epic(id) => (
            "parent_id = ?1",
            "epic_id = ?1",
            id.to_string(),
        ),
        SiblingScope::Root(group_id) => (
            "parent_id IS NULL AND group_id = ?1",
            // Issue links always hang off an epic; an impossible filter
            // keeps the UNION shape while matching nothing.
            "epic_id = ?1 AND 0",
            group_id.to_string(),
        ),
    }
}

/// Nearest sibling position strictly below `position`, excluding the
/// moving node itself.
pub(crate) fn sibling_position_before(
    conn: &Connection,
    scope: SiblingScope<'_>,
    position: i64,
    exclude: &NodeRef,
) -> Result<Option<i64>> {
    sibling_position_query(conn, scope, position, exclude, true)
}

/// Nearest sibling position strictly above `position`, excluding the
/// moving node itself.
pub(crate) fn sibling_position_after(
    conn: &Connection,
    scope: SiblingScope<'_>,
    position: i64,
    exclude: &NodeRef,
) -> Result<Option<i64>> {
    sibling_position_query(conn, scope, position, exclude, false)
}

fn sibling_position_query(
    conn: &Connection,
    scope: SiblingScope<'_>,
    position: i64,
    exclude: &NodeRef,
    below: bool,
) -> Result<Option<i64>> {
    let (epic_filter, link_filter, scope_param) = sibling_filter(scope);
    let (agg, cmp) = if below { ("MAX", "<") } else { ("MIN", ">") };
    let sql = format!(
        "SELECT {agg}(relative_position) FROM (
            SELECT relative_position FROM epics
            WHERE {epic_filter} AND relative_position {cmp} ?2
              AND NOT (?3 = 'epic' AND id = ?4)
            UNION ALL
            SELECT relative_position FROM issue_links
            WHERE {link_filter} AND relative_position {cmp} ?2
              AND NOT (?3 = 'issue_link' AND id = ?4)
        )"
    );
    let result: Option<i64> = conn.query_row(
        &sql,
        rusqlite::params![scope_param, position, exclude.kind(), exclude.id()],
        |row| row.get(0),
    )?;
    Ok(result)
}

/// Smallest sibling position in scope, excluding the moving node itself.
pub(crate) fn min_sibling_position(
    conn: &Connection,
    scope: SiblingScope<'_>,
    exclude: &NodeRef,
) -> Result<Option<i64>> {
    let (epic_filter, link_filter, scope_param) = sibling_filter(scope);
    let sql = format!(
        "SELECT MIN(relative_position) FROM (
            SELECT relative_position FROM epics
            WHERE {epic_filter} AND NOT (?2 = 'epic' AND id = ?3)
            UNION ALL
            SELECT relative_position FROM issue_links
            WHERE {link_filter} AND NOT (?2 = 'issue_link' AND id = ?3)
        )"
    );
    let result: Option<i64> = conn.query_row(
        &sql,
        rusqlite::params![scope_param, exclude.kind(), exclude.id()],
        |row| row.get(0),
    )?;
    Ok(result)
}

/// Largest sibling position in scope.
pub(crate) fn max_sibling_position(
    conn: &Connection,
    scope: SiblingScope<'_>,
) -> Result<Option<i64>> {
    let (epic_filter, link_filter, scope_param) = sibling_filter(scope);
    let sql = format!(
        "SELECT MAX(relative_position) FROM (
            SELECT relative_position FROM epics WHERE {epic_filter}
            UNION ALL
            SELECT relative_position FROM issue_links WHERE {link_filter}
        )"
    );
    let result: Option<i64> =
        conn.query_row(&sql, rusqlite::params![scope_param], |row| row.get(0))?;
    Ok(result)
}

pub(crate) fn set_epic_position(tx: &Connection, id: &str, position: i64) -> Result<()> {
    tx.execute(
        "UPDATE epics SET relative_position = ?, updated_at = ? WHERE id = ?",
        rusqlite::params![position, Utc::now().to_rfc3339(), id],
    )?;
    Ok(())
}

pub(crate) fn set_issue_link_position(tx: &Connection, id: &str, position: i64) -> Result<()> {
    tx.execute(
        "UPDATE issue_links SET relative_position = ?, updated_at = ? WHERE id = ?",
        rusqlite::params![position, Utc::now().to_rfc3339(), id],
    )?;
    Ok(())
}

pub(crate) fn set_epic_parent(
    tx: &Connection,
    id: &str,
    parent_id: Option<&str>,
    position: i64,
) -> Result<()> {
    tx.execute(
        "UPDATE epics SET parent_id = ?, relative_position = ?, updated_at = ? WHERE id = ?",
        rusqlite::params![parent_id, position, Utc::now().to_rfc3339(), id],
    )?;
    Ok(())
}

pub(crate) fn set_issue_link_epic(
    tx: &Connection,
    id: &str,
    epic_id: &str,
    position: i64,
) -> Result<()> {
    tx.execute(
        "UPDATE issue_links SET epic_id = ?, relative_position = ?, updated_at = ? WHERE id = ?",
        rusqlite::params![epic_id, position, Utc::now().to_rfc3339(), id],
    )?;
    Ok(())
}

pub(crate) fn set_parent_link_position(
    tx: &Connection,
    work_item_id: &str,
    position: i64,
) -> Result<()> {
    tx.execute(
        "UPDATE parent_links SET relative_position = ?, updated_at = ? WHERE work_item_id = ?",
        rusqlite::params![position, Utc::now().to_rfc3339(), work_item_id],
    )?;
    Ok(())
}

pub(crate) fn set_epic_state(
    tx: &Connection,
    id: &str,
    state: NodeState,
    closed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        "UPDATE epics SET state = ?, closed_at = ?, updated_at = ? WHERE id = ?",
        rusqlite::params![
            state.as_str(),
            closed_at.map(|dt| dt.to_rfc3339()),
            updated_at.to_rfc3339(),
            id
        ],
    )?;
    Ok(())
}

pub(crate) fn set_work_item_state(
    tx: &Connection,
    id: &str,
    state: NodeState,
    closed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        "UPDATE work_items SET state = ?, closed_at = ?, updated_at = ? WHERE id = ?",
        rusqlite::params![
            state.as_str(),
            closed_at.map(|dt| dt.to_rfc3339()),
            updated_at.to_rfc3339(),
            id
        ],
    )?;
    Ok(())
}

pub(crate) fn update_epic_dates(
    tx: &Connection,
    id: &str,
    field: crate::model::DateField,
    value: Option<NaiveDate>,
    sourcing_child_id: Option<&str>,
) -> Result<()> {
    let sql = match field {
        crate::model::DateField::Start => {
            "UPDATE epics SET start_date = ?, start_date_sourcing_child_id = ?, updated_at = ?
             WHERE id = ?"
        }
        crate::model::DateField::Due => {
            "UPDATE epics SET due_date = ?, due_date_sourcing_child_id = ?, updated_at = ?
             WHERE id = ?"
        }
    };
    tx.execute(
        sql,
        rusqlite::params![
            value.map(|d| d.to_string()),
            sourcing_child_id,
            Utc::now().to_rfc3339(),
            id
        ],
    )?;
    Ok(())
}

/// Date contribution of every child of an epic: (child id, start, due).
pub(crate) fn child_date_contributions(
    conn: &Connection,
    epic_id: &str,
) -> Result<Vec<(String, Option<NaiveDate>, Option<NaiveDate>)>> {
    let mut stmt = conn.prepare(
        "SELECT id, start_date, due_date FROM epics WHERE parent_id = ?1
         UNION ALL
         SELECT i.id, i.start_date, i.due_date
         FROM issues i JOIN issue_links l ON l.issue_id = i.id
         WHERE l.epic_id = ?1",
    )?;
    let rows = stmt
        .query_map([epic_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                date_opt(1, row.get(1)?)?,
                date_opt(2, row.get(2)?)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Shadow-side date contribution of every child of a work item.
pub(crate) fn shadow_child_contributions(
    conn: &Connection,
    parent_id: &str,
) -> Result<Vec<(String, Option<NaiveDate>, Option<NaiveDate>)>> {
    let mut stmt = conn.prepare(
        "SELECT pl.work_item_id, ds.start_date, ds.due_date
         FROM parent_links pl
         LEFT JOIN dates_sources ds ON ds.work_item_id = pl.work_item_id
         WHERE pl.parent_id = ?1",
    )?;
    let rows = stmt
        .query_map([parent_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                date_opt(1, row.get(1)?)?,
                date_opt(2, row.get(2)?)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// The epic backed by a given shadow work item, if any.
pub(crate) fn epic_id_by_work_item(conn: &Connection, work_item_id: &str) -> Result<Option<String>> {
    let result: Option<String> = conn
        .query_row(
            "SELECT id FROM epics WHERE work_item_id = ?",
            [work_item_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(result)
}

/// Shadow-side ancestor chain of a work item, nearest first, cycle-safe.
pub(crate) fn shadow_ancestors_of(conn: &Connection, work_item_id: &str) -> Result<Vec<String>> {
    let mut chain = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(work_item_id.to_string());

    let mut current = work_item_id.to_string();
    loop {
        let parent: Option<String> = conn
            .query_row(
                "SELECT parent_id FROM parent_links WHERE work_item_id = ?",
                [&current],
                |row| row.get(0),
            )
            .optional()?;
        match parent {
            Some(parent_id) => {
                if !visited.insert(parent_id.clone()) {
                    break; // cycle
                }
                chain.push(parent_id.clone());
                current = parent_id;
            }
            None => break,
        }
    }
    Ok(chain)
}

/// Ancestor chain of an epic, nearest first, cycle-safe.
pub(crate) fn ancestors_of(conn: &Connection, epic_id: &str) -> Result<Vec<String>> {
    let mut chain = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(epic_id.to_string());

    let mut current = epic_id.to_string();
    loop {
        let parent: Option<Option<String>> = conn
            .query_row(
                "SELECT parent_id FROM epics WHERE id = ?",
                [&current],
                |row| row.get(0),
            )
            .optional()?;
        match parent.flatten() {
            Some(parent_id) => {
                if !visited.insert(parent_id.clone()) {
                    break; // cycle
                }
                chain.push(parent_id.clone());
                current = parent_id;
            }
            None => break,
        }
    }
    Ok(chain)
}

// === Row mapping ===

fn epic_from_row(row: &Row<'_>) -> rusqlite::Result<Epic> {
    Ok(Epic {
        id: row.get(0)?,
        group_id: row.get(1)?,
        title: row.get(2)?,
        parent_id: row.get(3)?,
        relative_position: row.get(4)?,
        state: state(5, &row.get::<_, String>(5)?)?,
        created_at: ts(6, &row.get::<_, String>(6)?)?,
        updated_at: ts(7, &row.get::<_, String>(7)?)?,
        closed_at: ts_opt(8, row.get(8)?)?,
        start_date: date_opt(9, row.get(9)?)?,
        due_date: date_opt(10, row.get(10)?)?,
        start_date_is_fixed: row.get::<_, i64>(11)? != 0,
        start_date_fixed: date_opt(12, row.get(12)?)?,
        due_date_is_fixed: row.get::<_, i64>(13)? != 0,
        due_date_fixed: date_opt(14, row.get(14)?)?,
        start_date_sourcing_child_id: row.get(15)?,
        due_date_sourcing_child_id: row.get(16)?,
        work_item_id: row.get(17)?,
    })
}

fn issue_link_from_row(row: &Row<'_>) -> rusqlite::Result<IssueLink> {
    Ok(IssueLink {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        epic_id: row.get(2)?,
        relative_position: row.get(3)?,
        created_at: ts(4, &row.get::<_, String>(4)?)?,
        updated_at: ts(5, &row.get::<_, String>(5)?)?,
    })
}

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn ts_opt(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.as_deref().map(|v| ts(idx, v)).transpose()
}

fn date_opt(idx: usize, value: Option<String>) -> rusqlite::Result<Option<NaiveDate>> {
    value
        .as_deref()
        .map(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn state(idx: usize, value: &str) -> rusqlite::Result<NodeState> {
    NodeState::from_str(value).map_err(|e| conversion_err(idx, e))
}

fn audit_action(value: &str) -> AuditAction {
    match value {
        "created" => AuditAction::Created,
        "reordered" => AuditAction::Reordered,
        "reparented" => AuditAction::Reparented,
        "closed" => AuditAction::Closed,
        "reopened" => AuditAction::Reopened,
        "dates_recomputed" => AuditAction::DatesRecomputed,
        other => AuditAction::Custom(other.to_string()),
    }
}
