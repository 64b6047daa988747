//! Persistence layer: `SQLite` schema and storage backend.

pub mod schema;
pub mod sqlite;

pub use sqlite::{MutationContext, SiblingScope, SqliteStorage};
