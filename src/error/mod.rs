//! Error types and handling for `trellis`.
//!
//! # Design
//!
//! - Uses `thiserror` for derive-based error types
//! - Supports `anyhow` integration for wrapped lower-level failures
//! - Validation failures are ordinary values with user-facing messages,
//!   never panics
//! - Shadow-side mirroring failures carry the failing node's id and kind
//!   so the boundary service can log them without leaking which
//!   representation failed to the caller

use thiserror::Error;

/// Primary error type for `trellis` operations.
#[derive(Error, Debug)]
pub enum TrellisError {
    // === Lookup Errors ===
    /// Epic with the specified ID was not found.
    #[error("Epic not found: {id}")]
    EpicNotFound { id: String },

    /// Issue link with the specified ID was not found.
    #[error("Issue link not found: {id}")]
    IssueLinkNotFound { id: String },

    /// Work item with the specified ID was not found.
    #[error("Work item not found: {id}")]
    WorkItemNotFound { id: String },

    /// The adjacent reference disappeared between lookup and move.
    #[error("Adjacent reference not found.")]
    AdjacentNotFound { id: String },

    // === Move Validation Errors ===
    /// The moving or adjacent node is of a kind the tree cannot reorder.
    #[error("Only epics and epic issues are supported.")]
    UnsupportedNodeType { kind: String },

    /// An adjacent reference was given without a usable relative position.
    #[error("Relative position is not valid.")]
    InvalidRelativePosition,

    /// The adjacent reference lives under a different parent than the move
    /// would produce.
    #[error("The sibling object's parent must match the {scope} parent epic.")]
    SiblingParentMismatch { scope: ParentScope },

    /// Assigning the requested parent would create a cycle.
    #[error("An item cannot become a child of itself or its own descendant.")]
    HierarchyCycle { id: String },

    /// The caller lacks a required ability on one of the involved nodes.
    #[error("You don't have permissions to move the objects.")]
    PermissionDenied,

    /// Lifecycle permission failure, kept distinct from move permission.
    #[error("You don't have permissions to update this item.")]
    LifecyclePermissionDenied,

    // === Ordering Errors ===
    /// No integer key remains strictly between the two neighbors.
    #[error("No space left between positions {before} and {after}")]
    GapExhausted { before: i64, after: i64 },

    // === Dual-Write Errors ===
    /// Shadow-side mirroring failed inside the legacy transaction.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Generic failure reported at the service boundary in place of a
    /// `Sync` error, so callers cannot tell which representation failed.
    #[error("Couldn't perform the operation due to an internal error.")]
    Internal,

    // === Infrastructure Errors ===
    /// `SQLite` database error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wrapped anyhow error for lower-level failures.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Which parent the sibling mismatch message names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentScope {
    New,
    Current,
}

impl std::fmt::Display for ParentScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Current => write!(f, "current"),
        }
    }
}

/// A failed mirror operation, with enough context for the boundary log line.
#[derive(Error, Debug)]
#[error("Failed to sync {node_kind} {node_id} to its shadow record: {reason}")]
pub struct SyncError {
    pub node_id: String,
    pub node_kind: String,
    pub reason: String,
}

impl SyncError {
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        node_kind: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_kind: node_kind.into(),
            reason: reason.into(),
        }
    }
}

impl TrellisError {
    /// Can the caller fix this by changing the request?
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EpicNotFound { .. }
                | Self::IssueLinkNotFound { .. }
                | Self::AdjacentNotFound { .. }
                | Self::UnsupportedNodeType { .. }
                | Self::InvalidRelativePosition
                | Self::SiblingParentMismatch { .. }
                | Self::HierarchyCycle { .. }
                | Self::PermissionDenied
                | Self::LifecyclePermissionDenied
        )
    }

    /// Human-friendly suggestion for fixing this error.
    #[must_use]
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::InvalidRelativePosition => {
                Some("Pass a relative position of 'before' or 'after'")
            }
            Self::SiblingParentMismatch { .. } => {
                Some("Pick an adjacent item under the same parent, or re-parent first")
            }
            Self::HierarchyCycle { .. } => Some("Choose a parent outside the item's own subtree"),
            Self::GapExhausted { .. } => Some("Rebalance the sibling list before inserting again"),
            _ => None,
        }
    }
}

/// Result type using `TrellisError`.
pub type Result<T> = std::result::Result<T, TrellisError>;
