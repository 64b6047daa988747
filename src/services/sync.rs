//! Dual-write mirror contract.
//!
//! One logical planning item is materialized as a legacy record plus an
//! optional shadow record. Whenever the legacy side moves or transitions,
//! the same change is replayed onto the shadow side inside the same
//! transaction through the relays here. A failed relay is a
//! [`SyncError`] carrying the legacy node's id and kind; it is not a
//! validation error and callers must not surface it as one.

use crate::error::{Result, SyncError, TrellisError};
use crate::model::{NodeRef, NodeState, RelativePosition};
use crate::services::shadow;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

/// Shadow-side ingredients of a mirrored move.
#[derive(Debug, Clone)]
pub struct MirrorMove {
    pub parent_work_item_id: String,
    pub moving_work_item_id: String,
    pub adjacent_work_item_id: String,
    /// Placement of the legacy move, in legacy terms (`Before` = moving
    /// node precedes the adjacent in ascending order).
    pub placement: RelativePosition,
}

/// Replay a legacy reorder onto the shadow edge list.
///
/// The shadow primitive anchors from the opposite end, so the legacy
/// placement is inverted before the relay: legacy `After` becomes a
/// `Before` anchor and vice versa. Losing this inversion makes the two
/// sibling orders visibly diverge.
///
/// Returns the shadow position key that was assigned.
///
/// # Errors
///
/// Any shadow-side failure is wrapped in [`TrellisError::Sync`] with the
/// legacy node's id and kind.
pub fn mirror_move(tx: &Connection, mirror: &MirrorMove, legacy_node: &NodeRef) -> Result<i64> {
    shadow::reorder_link(
        tx,
        &mirror.parent_work_item_id,
        &mirror.moving_work_item_id,
        &mirror.adjacent_work_item_id,
        mirror.placement.inverted(),
    )
    .map_err(|err| {
        TrellisError::Sync(SyncError::new(
            legacy_node.id(),
            legacy_node.kind(),
            err.to_string(),
        ))
    })
}

/// Replay a legacy lifecycle transition onto the shadow record, copying
/// the lifecycle timestamps the legacy side settled on.
///
/// # Errors
///
/// Any shadow-side failure is wrapped in [`TrellisError::Sync`] with the
/// legacy node's id and kind.
pub fn mirror_transition(
    tx: &Connection,
    work_item_id: &str,
    state: NodeState,
    closed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    legacy_node: &NodeRef,
) -> Result<()> {
    shadow::transition_work_item(tx, work_item_id, state, closed_at, updated_at).map_err(|err| {
        TrellisError::Sync(SyncError::new(
            legacy_node.id(),
            legacy_node.kind(),
            err.to_string(),
        ))
    })
}
