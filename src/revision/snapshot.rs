//! Snapshot records and the queries that page through them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Committer, CommitterType};

// =============================================================================
// Snapshot ID
// =============================================================================

/// Unique, time-ordered identifier of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(uuid::Uuid);

impl SnapshotId {
    /// Creates a `SnapshotId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Generates a new time-ordered identifier (UUID v7).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7())
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl std::str::FromStr for SnapshotId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(value).map(Self)
    }
}

// =============================================================================
// Snapshot Event
// =============================================================================

/// The lifecycle event a snapshot records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotEvent {
    /// The entity was created.
    Creation,
    /// The entity was modified; the snapshot holds the state before the change.
    Modification,
    /// The entity was deleted.
    Deletion,
    /// The entity was reverted to an earlier snapshot.
    Rollback,
}

impl SnapshotEvent {
    /// Returns the canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Creation => "creation",
            Self::Modification => "modification",
            Self::Deletion => "deletion",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for SnapshotEvent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// An immutable record of an entity's state at one lifecycle event.
///
/// `value` holds the full entity for creations, modifications and rollbacks
/// that restored a live state. It is absent for deletions and for rollbacks
/// that re-deleted the entity.
///
/// For modifications, `value` is the state *before* the change was applied,
/// so reverting to a modification snapshot undoes that modification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>"))]
pub struct Snapshot<T> {
    id: SnapshotId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    rollback_id: Option<SnapshotId>,
    time: DateTime<Utc>,
    committer_id: String,
    committer_type: CommitterType,
    entity_type: String,
    entity_id: String,
    event: SnapshotEvent,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    value: Option<T>,
}

/// Fields of a snapshot about to be recorded.
pub(crate) struct SnapshotDraft<T> {
    pub(crate) rollback_id: Option<SnapshotId>,
    pub(crate) time: DateTime<Utc>,
    pub(crate) committer: Committer,
    pub(crate) entity_type: &'static str,
    pub(crate) entity_id: String,
    pub(crate) event: SnapshotEvent,
    pub(crate) reason: Option<String>,
    pub(crate) value: Option<T>,
}

impl<T> Snapshot<T> {
    pub(crate) fn from_draft(draft: SnapshotDraft<T>) -> Self {
        Self {
            id: SnapshotId::generate(),
            rollback_id: draft.rollback_id,
            time: draft.time,
            committer_id: draft.committer.id,
            committer_type: draft.committer.kind,
            entity_type: draft.entity_type.to_string(),
            entity_id: draft.entity_id,
            event: draft.event,
            reason: draft.reason,
            value: draft.value,
        }
    }

    /// Identifier of this snapshot.
    #[must_use]
    pub const fn id(&self) -> SnapshotId {
        self.id
    }

    /// The snapshot this rollback restored, if this is a rollback.
    #[must_use]
    pub const fn rollback_id(&self) -> Option<SnapshotId> {
        self.rollback_id
    }

    /// Time the event was recorded.
    #[must_use]
    pub const fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Principal that caused the event.
    #[must_use]
    pub fn committer_id(&self) -> &str {
        &self.committer_id
    }

    /// Role the principal acted in.
    #[must_use]
    pub const fn committer_type(&self) -> CommitterType {
        self.committer_type
    }

    /// Type of the entity.
    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Identifier of the entity.
    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Event this snapshot records.
    #[must_use]
    pub const fn event(&self) -> SnapshotEvent {
        self.event
    }

    /// Reason given by the committer, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// The recorded entity state, absent for deletions.
    #[must_use]
    pub const fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Returns `true` if this snapshot belongs to entity `entity_id` of type `entity_type`.
    #[must_use]
    pub fn belongs_to(&self, entity_type: &str, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id == entity_id
    }
}

// =============================================================================
// Query Parameters
// =============================================================================

/// Order in which snapshots are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Oldest first.
    #[default]
    Ascending,
    /// Newest first.
    Descending,
}

/// A window over an entity's snapshots.
///
/// A missing `limit` means the ledger's default page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotRange {
    /// Number of snapshots to skip, counted in the requested order.
    pub offset: u64,
    /// Maximum number of snapshots to return.
    pub limit: Option<u32>,
}

impl SnapshotRange {
    /// A window of `limit` snapshots starting at `offset`.
    #[must_use]
    pub const fn new(offset: u64, limit: u32) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    /// The first `limit` snapshots.
    #[must_use]
    pub const fn first(limit: u32) -> Self {
        Self::new(0, limit)
    }
}
