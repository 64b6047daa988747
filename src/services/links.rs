//! Parent edge assignment.
//!
//! Re-parenting is delegated here by the reorder service: the new edge is
//! validated (target exists, is a container, no self/descendant cycle),
//! the legacy row is re-linked appended at the end of the new sibling
//! list, and the edge is mirrored to the shadow side when both records
//! carry shadow counterparts. Old and new parents are marked for date
//! recomputation — a tree edge change is always date relevant.

use crate::error::{Result, TrellisError};
use crate::model::{AuditAction, Epic, TreeNode};
use crate::ordering;
use crate::storage::sqlite::{self, SiblingScope};
use crate::storage::MutationContext;
use rusqlite::Connection;

/// Re-link `node` under `new_parent_id`, returning the updated node.
///
/// # Errors
///
/// Returns `EpicNotFound` for a missing target, `HierarchyCycle` when the
/// target sits inside the node's own subtree, or a database error.
pub fn assign_parent(
    tx: &Connection,
    node: &TreeNode,
    new_parent_id: &str,
    ctx: &mut MutationContext,
) -> Result<TreeNode> {
    let Some(new_parent) = sqlite::epic_by_id(tx, new_parent_id)? else {
        return Err(TrellisError::EpicNotFound {
            id: new_parent_id.to_string(),
        });
    };

    if let TreeNode::Epic(epic) = node {
        reject_cycles(tx, epic, &new_parent)?;
    }

    let last = sqlite::max_sibling_position(tx, SiblingScope::Epic(new_parent_id))?;
    let position = ordering::position_between(last, None)?;

    let old_parent_id = node.parent_epic_id().map(ToString::to_string);
    match node {
        TreeNode::Epic(epic) => {
            sqlite::set_epic_parent(tx, &epic.id, Some(new_parent_id), position)?;
        }
        TreeNode::IssueLink(link) => {
            sqlite::set_issue_link_epic(tx, &link.id, new_parent_id, position)?;
        }
    }

    mirror_edge(tx, node, &new_parent)?;

    ctx.record_event(
        AuditAction::Reparented,
        node.id(),
        Some(format!(
            "Moved under epic {new_parent_id} (was {})",
            old_parent_id.as_deref().unwrap_or("root")
        )),
    );
    if let Some(old_parent) = old_parent_id {
        ctx.mark_rollup_dirty(&old_parent);
    }
    ctx.mark_rollup_dirty(new_parent_id);

    // Reload so the caller sees the assigned position and edge.
    reload(tx, node)
}

/// A container cannot move under itself or any of its descendants.
fn reject_cycles(tx: &Connection, epic: &Epic, new_parent: &Epic) -> Result<()> {
    if new_parent.id == epic.id {
        return Err(TrellisError::HierarchyCycle {
            id: epic.id.clone(),
        });
    }
    let ancestors = sqlite::ancestors_of(tx, &new_parent.id)?;
    if ancestors.iter().any(|ancestor| ancestor == &epic.id) {
        return Err(TrellisError::HierarchyCycle {
            id: epic.id.clone(),
        });
    }
    Ok(())
}

/// Mirror the new edge onto `parent_links` when both sides have shadow
/// records; silently keep the shadow edge stale otherwise.
fn mirror_edge(tx: &Connection, node: &TreeNode, new_parent: &Epic) -> Result<()> {
    let Some(parent_work_item) = new_parent.work_item_id.as_deref() else {
        tracing::debug!(parent = %new_parent.id, "new parent has no shadow record, edge not mirrored");
        return Ok(());
    };
    let Some(moving_work_item) = shadow_work_item_id(tx, node)? else {
        tracing::debug!(node = %node.node_ref(), "node has no shadow record, edge not mirrored");
        return Ok(());
    };
    sqlite::upsert_parent_link(tx, &moving_work_item, parent_work_item)?;
    Ok(())
}

/// The shadow record backing a tree node: the epic's own work item, or the
/// linked issue's work item for a link row.
pub(crate) fn shadow_work_item_id(tx: &Connection, node: &TreeNode) -> Result<Option<String>> {
    match node {
        TreeNode::Epic(epic) => Ok(epic.work_item_id.clone()),
        TreeNode::IssueLink(link) => {
            let issue = sqlite::issue_by_id(tx, &link.issue_id)?;
            Ok(issue.and_then(|issue| issue.work_item_id))
        }
    }
}

fn reload(tx: &Connection, node: &TreeNode) -> Result<TreeNode> {
    match node {
        TreeNode::Epic(epic) => sqlite::epic_by_id(tx, &epic.id)?
            .map(TreeNode::Epic)
            .ok_or_else(|| TrellisError::EpicNotFound {
                id: epic.id.clone(),
            }),
        TreeNode::IssueLink(link) => sqlite::issue_link_by_id(tx, &link.id)?
            .map(TreeNode::IssueLink)
            .ok_or_else(|| TrellisError::IssueLinkNotFound {
                id: link.id.clone(),
            }),
    }
}
