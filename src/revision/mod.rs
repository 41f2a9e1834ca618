//! Append-only revision history for tracked entities.
//!
//! Every create, modify and delete of an [`Entity`](crate::entity::Entity)
//! appends one immutable [`Snapshot`]. Any snapshot can later be used to
//! restore the entity (or delete it again); the revert is itself logged as a
//! [`SnapshotEvent::Rollback`] pointing back at the snapshot it restored.

mod ledger;
mod snapshot;

pub use ledger::{LedgerError, PageLimits, RevisionLedger};
pub(crate) use snapshot::SnapshotDraft;
pub use snapshot::{Snapshot, SnapshotEvent, SnapshotId, SnapshotRange, SortOrder};
