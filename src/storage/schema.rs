//! Database schema definitions.

use rusqlite::{Connection, Result};

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// The complete SQL schema for the trellis database.
pub const SCHEMA_SQL: &str = r"
    -- Legacy planning items
    CREATE TABLE IF NOT EXISTS epics (
        id TEXT PRIMARY KEY,
        group_id TEXT NOT NULL,
        title TEXT NOT NULL,
        parent_id TEXT,
        relative_position INTEGER NOT NULL,
        state TEXT NOT NULL DEFAULT 'opened',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        closed_at TEXT,
        start_date TEXT,
        due_date TEXT,
        start_date_is_fixed INTEGER NOT NULL DEFAULT 0,
        start_date_fixed TEXT,
        due_date_is_fixed INTEGER NOT NULL DEFAULT 0,
        due_date_fixed TEXT,
        start_date_sourcing_child_id TEXT,
        due_date_sourcing_child_id TEXT,
        work_item_id TEXT,
        CHECK (length(title) >= 1 AND length(title) <= 500),
        CHECK (state IN ('opened', 'closed'))
    );
    CREATE INDEX IF NOT EXISTS idx_epics_parent_position
        ON epics(parent_id, relative_position);
    CREATE INDEX IF NOT EXISTS idx_epics_group_id ON epics(group_id);
    CREATE INDEX IF NOT EXISTS idx_epics_work_item_id ON epics(work_item_id);

    -- Leaf planning items (dates maintained externally, read for rollup)
    CREATE TABLE IF NOT EXISTS issues (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'opened',
        start_date TEXT,
        due_date TEXT,
        work_item_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        closed_at TEXT,
        CHECK (state IN ('opened', 'closed'))
    );

    -- Link rows placing issues under epics, ordered within the epic's
    -- child list (positions interleave with child epics)
    CREATE TABLE IF NOT EXISTS issue_links (
        id TEXT PRIMARY KEY,
        issue_id TEXT NOT NULL UNIQUE,
        epic_id TEXT NOT NULL,
        relative_position INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (issue_id) REFERENCES issues(id),
        FOREIGN KEY (epic_id) REFERENCES epics(id)
    );
    CREATE INDEX IF NOT EXISTS idx_issue_links_epic_position
        ON issue_links(epic_id, relative_position);

    -- Shadow representation
    CREATE TABLE IF NOT EXISTS work_items (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        namespace_id TEXT NOT NULL,
        title TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'opened',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        closed_at TEXT,
        CHECK (kind IN ('epic', 'issue')),
        CHECK (state IN ('opened', 'closed'))
    );

    CREATE TABLE IF NOT EXISTS parent_links (
        work_item_id TEXT PRIMARY KEY,
        parent_id TEXT NOT NULL,
        relative_position INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (work_item_id) REFERENCES work_items(id),
        FOREIGN KEY (parent_id) REFERENCES work_items(id)
    );
    CREATE INDEX IF NOT EXISTS idx_parent_links_parent_position
        ON parent_links(parent_id, relative_position);

    CREATE TABLE IF NOT EXISTS dates_sources (
        work_item_id TEXT PRIMARY KEY,
        start_date TEXT,
        due_date TEXT,
        start_date_is_fixed INTEGER NOT NULL DEFAULT 0,
        start_date_fixed TEXT,
        due_date_is_fixed INTEGER NOT NULL DEFAULT 0,
        due_date_fixed TEXT,
        start_date_sourcing_work_item_id TEXT,
        due_date_sourcing_work_item_id TEXT,
        FOREIGN KEY (work_item_id) REFERENCES work_items(id)
    );

    -- Audit log
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY,
        node_id TEXT NOT NULL,
        action TEXT NOT NULL,
        actor TEXT NOT NULL,
        detail TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_node_id ON events(node_id);
    CREATE INDEX IF NOT EXISTS idx_events_action ON events(action);

    -- Epics whose effective dates need recomputation
    CREATE TABLE IF NOT EXISTS rollup_dirty (
        epic_id TEXT PRIMARY KEY,
        marked_at TEXT NOT NULL
    );

    -- Metadata
    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// Apply the schema to the database.
///
/// This uses `execute_batch` to run the entire DDL script.
/// It is idempotent because all statements use `IF NOT EXISTS`.
///
/// # Errors
///
/// Returns an error if the SQL execution fails or pragmas cannot be set.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO metadata (key, value) VALUES ('schema_version', ?)",
        [CURRENT_SCHEMA_VERSION.to_string()],
    )?;

    // Set journal mode to WAL for concurrency
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // Enable foreign keys
    conn.pragma_update(None, "foreign_keys", "ON")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_apply_schema() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).expect("Failed to apply schema");

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert!(tables.contains(&"epics".to_string()));
        assert!(tables.contains(&"issue_links".to_string()));
        assert!(tables.contains(&"parent_links".to_string()));
        assert!(tables.contains(&"dates_sources".to_string()));
        assert!(tables.contains(&"rollup_dirty".to_string()));

        let foreign_keys: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(foreign_keys, 1);

        let version: String = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_apply_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        apply_schema(&conn).expect("second apply should be a no-op");
    }
}
