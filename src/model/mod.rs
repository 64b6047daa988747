//! Core data types for `trellis`.
//!
//! This module defines the fundamental types used throughout the engine:
//! - `Epic` - The legacy planning-item record
//! - `Issue` / `IssueLink` - Leaf items and their link rows under an epic
//! - `WorkItem` / `ParentLink` / `DatesSource` - The shadow representation
//! - `NodeState` - Lifecycle states
//! - `NodeRef` / `RelativePosition` - Move operation inputs
//! - `AuditEvent` / `DomainEvent` - Audit log entries and bus notifications

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Planning-item lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Opened,
    Closed,
}

impl NodeState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = crate::error::TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "opened" | "open" => Ok(Self::Opened),
            "closed" => Ok(Self::Closed),
            other => Err(anyhow::anyhow!("invalid node state: {other}").into()),
        }
    }
}

/// Placement of a moved node relative to its adjacent reference, in
/// ascending position order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativePosition {
    Before,
    After,
}

impl RelativePosition {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }

    /// The placement the shadow reorder primitive receives for this one.
    ///
    /// The shadow primitive's anchor names the side the adjacent occupies
    /// relative to the moving node's target slot, so the parameter flips.
    #[must_use]
    pub const fn inverted(self) -> Self {
        match self {
            Self::Before => Self::After,
            Self::After => Self::Before,
        }
    }
}

impl fmt::Display for RelativePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RelativePosition {
    type Err = crate::error::TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "before" => Ok(Self::Before),
            "after" => Ok(Self::After),
            _ => Err(crate::error::TrellisError::InvalidRelativePosition),
        }
    }
}

/// A reference to a node in the tree, as supplied by callers.
///
/// `Epic` and `IssueLink` are reorderable; `Issue` identifies a bare leaf
/// item, which cannot be moved directly (only through its link row).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum NodeRef {
    Epic(String),
    IssueLink(String),
    Issue(String),
}

impl NodeRef {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Epic(id) | Self::IssueLink(id) | Self::Issue(id) => id,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Epic(_) => "epic",
            Self::IssueLink(_) => "issue_link",
            Self::Issue(_) => "issue",
        }
    }

    /// Whether the tree can reorder this kind of node.
    #[must_use]
    pub const fn is_reorderable(&self) -> bool {
        matches!(self, Self::Epic(_) | Self::IssueLink(_))
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// The legacy planning-item record.
///
/// `start_date` / `due_date` are the cached effective dates: the fixed
/// value when the matching `*_is_fixed` flag is set, otherwise the value
/// rolled up from descendants. A node with no contributing children and no
/// fixed date has no effective date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Epic {
    /// Unique ID (e.g., "ep-abc123").
    pub id: String,

    /// Owning group (the root of the tree this epic belongs to).
    pub group_id: String,

    /// Title (1-500 chars).
    pub title: String,

    /// Parent epic, if nested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Ordering key among siblings under `parent_id`.
    pub relative_position: i64,

    /// Lifecycle state.
    #[serde(default)]
    pub state: NodeState,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,

    /// Closure timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    /// Effective start date (fixed or inherited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,

    /// Effective due date (fixed or inherited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,

    /// Whether the start date is user-fixed rather than inherited.
    #[serde(default)]
    pub start_date_is_fixed: bool,

    /// User-supplied start date override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date_fixed: Option<NaiveDate>,

    /// Whether the due date is user-fixed rather than inherited.
    #[serde(default)]
    pub due_date_is_fixed: bool,

    /// User-supplied due date override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date_fixed: Option<NaiveDate>,

    /// Child that supplied the inherited start date, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date_sourcing_child_id: Option<String>,

    /// Child that supplied the inherited due date, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date_sourcing_child_id: Option<String>,

    /// Shadow counterpart, when this epic has been dual-written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item_id: Option<String>,
}

impl Epic {
    /// Effective date for one field, straight from the cached columns.
    #[must_use]
    pub const fn effective_date(&self, field: DateField) -> Option<NaiveDate> {
        match field {
            DateField::Start => self.start_date,
            DateField::Due => self.due_date,
        }
    }
}

/// Which of the two rollup date fields an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    Start,
    Due,
}

impl DateField {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start_date",
            Self::Due => "due_date",
        }
    }
}

/// A leaf planning item. Its dates are maintained elsewhere; the engine
/// only reads the two fields needed for rollup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

/// The link row placing an issue under an epic, carrying the issue's
/// ordering key within the epic's child list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueLink {
    pub id: String,
    pub issue_id: String,
    pub epic_id: String,
    pub relative_position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A loaded, reorderable tree node: either an epic or an issue link row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeNode {
    Epic(Epic),
    IssueLink(IssueLink),
}

impl TreeNode {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Epic(epic) => &epic.id,
            Self::IssueLink(link) => &link.id,
        }
    }

    #[must_use]
    pub fn node_ref(&self) -> NodeRef {
        match self {
            Self::Epic(epic) => NodeRef::Epic(epic.id.clone()),
            Self::IssueLink(link) => NodeRef::IssueLink(link.id.clone()),
        }
    }

    /// The epic this node currently sits under; `None` for a root epic.
    #[must_use]
    pub fn parent_epic_id(&self) -> Option<&str> {
        match self {
            Self::Epic(epic) => epic.parent_id.as_deref(),
            Self::IssueLink(link) => Some(&link.epic_id),
        }
    }

    #[must_use]
    pub const fn relative_position(&self) -> i64 {
        match self {
            Self::Epic(epic) => epic.relative_position,
            Self::IssueLink(link) => link.relative_position,
        }
    }
}

/// Shadow record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    Epic,
    Issue,
}

impl WorkItemKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Epic => "epic",
            Self::Issue => "issue",
        }
    }
}

impl FromStr for WorkItemKind {
    type Err = crate::error::TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "epic" => Ok(Self::Epic),
            "issue" => Ok(Self::Issue),
            other => Err(anyhow::anyhow!("invalid work item kind: {other}").into()),
        }
    }
}

/// The shadow representation of one planning item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub kind: WorkItemKind,
    pub namespace_id: String,
    pub title: String,
    #[serde(default)]
    pub state: NodeState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

/// Shadow-side tree edge with its own ordering key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParentLink {
    pub work_item_id: String,
    pub parent_id: String,
    pub relative_position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Shadow-side date fields, one row per work item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DatesSource {
    pub work_item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub start_date_is_fixed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date_fixed: Option<NaiveDate>,
    #[serde(default)]
    pub due_date_is_fixed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date_fixed: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date_sourcing_work_item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date_sourcing_work_item_id: Option<String>,
}

/// Audit action recorded for a node mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuditAction {
    Created,
    Reordered,
    Reparented,
    Closed,
    Reopened,
    DatesRecomputed,
    Custom(String),
}

impl AuditAction {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Reordered => "reordered",
            Self::Reparented => "reparented",
            Self::Closed => "closed",
            Self::Reopened => "reopened",
            Self::DatesRecomputed => "dates_recomputed",
            Self::Custom(value) => value,
        }
    }
}

impl Serialize for AuditAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuditAction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        let action = match value.as_str() {
            "created" => Self::Created,
            "reordered" => Self::Reordered,
            "reparented" => Self::Reparented,
            "closed" => Self::Closed,
            "reopened" => Self::Reopened,
            "dates_recomputed" => Self::DatesRecomputed,
            _ => Self::Custom(value),
        };
        Ok(action)
    }
}

/// An entry in a node's audit history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEvent {
    pub id: i64,
    pub node_id: String,
    pub action: AuditAction,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What a lifecycle domain event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainEventKind {
    EpicClosed,
    EpicReopened,
}

/// Notification emitted on successful lifecycle transitions, carrying the
/// node id and its container for downstream observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainEvent {
    pub kind: DomainEventKind,
    pub epic_id: String,
    pub group_id: String,
}
