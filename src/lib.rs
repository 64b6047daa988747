//! Tree consistency and date rollup engine for hierarchical planning
//! items.
//!
//! Groups contain epics, epics contain child epics and linked issues, and
//! every node carries a sibling ordering key, an opened/closed state, and
//! a start/due date pair that is either user-fixed or rolled up from
//! descendants. During a migration window each legacy record may have a
//! shadow work-item counterpart that must stay consistent with it, so
//! moves and lifecycle transitions are dual-written inside one
//! transaction.
//!
//! Entry points:
//! - [`services::tree_reorder::TreeReorderService`] — validated moves
//! - [`services::lifecycle::LifecycleService`] — idempotent close/reopen
//! - [`services::rollup::RollupCoordinator`] — batched date rollups with
//!   per-tree routing between the legacy and shadow computations
//!
//! Permissions, deferred-job consumption and event delivery are supplied
//! by the embedder through the traits in [`services`].

pub mod error;
pub mod model;
pub mod ordering;
pub mod services;
pub mod storage;

pub use error::{Result, SyncError, TrellisError};
pub use storage::SqliteStorage;
