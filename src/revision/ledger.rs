//! The revision ledger.
//!
//! Writes to the ledger require the entity's [`KeyedLockGuard`], so a
//! snapshot can only be recorded while the caller holds the entity's lock.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use crate::clock::Clock;
use crate::entity::{Committer, Entity, EntityKey};
use crate::store::{EntityRepository, StoreError};
use crate::sync::KeyedLockGuard;

use super::snapshot::{Snapshot, SnapshotDraft, SnapshotEvent, SnapshotId, SnapshotRange, SortOrder};

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by the revision ledger.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No snapshot with this id exists for the entity.
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(SnapshotId),

    /// The requested page is larger than the ledger allows.
    #[error("Page size {requested} exceeds the maximum of {maximum}")]
    PageTooLarge {
        /// Requested number of snapshots.
        requested: u32,
        /// Largest page the ledger serves.
        maximum: u32,
    },

    /// A page size of zero was requested.
    #[error("Page size must be greater than zero")]
    EmptyPage,

    /// The repository failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// Page Limits
// =============================================================================

/// Default and maximum number of snapshots returned by one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    /// Page size used when the caller does not ask for one.
    pub default_page_size: u32,
    /// Largest page size a caller may ask for.
    pub max_page_size: u32,
}

impl PageLimits {
    /// Resolves the caller's requested page size against these limits.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::EmptyPage`] for a limit of zero and
    /// [`LedgerError::PageTooLarge`] for a limit above the maximum.
    pub fn resolve(&self, requested: Option<u32>) -> Result<u32, LedgerError> {
        match requested {
            None => Ok(self.default_page_size),
            Some(0) => Err(LedgerError::EmptyPage),
            Some(requested) if requested > self.max_page_size => Err(LedgerError::PageTooLarge {
                requested,
                maximum: self.max_page_size,
            }),
            Some(requested) => Ok(requested),
        }
    }
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

// =============================================================================
// Revision Ledger
// =============================================================================

/// Records entity lifecycle events and reconstructs prior states.
///
/// Clones share the repository, the clock and the monotonic stamp, so every
/// clone hands out strictly increasing snapshot times.
///
/// # Example
///
/// ```rust,ignore
/// let guard = locks.acquire(book.key()).await;
/// ledger.record_created(&guard, &book, &committer).await?;
/// repository.put_entity(&book).await?;
/// ```
pub struct RevisionLedger<T, R> {
    repository: Arc<R>,
    clock: Arc<dyn Clock>,
    limits: PageLimits,
    last_stamp: Arc<Mutex<Option<DateTime<Utc>>>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T, R> Clone for RevisionLedger<T, R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            clock: Arc::clone(&self.clock),
            limits: self.limits,
            last_stamp: Arc::clone(&self.last_stamp),
            _entity: PhantomData,
        }
    }
}

impl<T, R> fmt::Debug for RevisionLedger<T, R> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RevisionLedger")
            .field("clock", &self.clock)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl<T, R> RevisionLedger<T, R>
where
    T: Entity,
    R: EntityRepository<T>,
{
    /// Creates a ledger over `repository`.
    pub fn new(repository: Arc<R>, clock: Arc<dyn Clock>, limits: PageLimits) -> Self {
        Self {
            repository,
            clock,
            limits,
            last_stamp: Arc::new(Mutex::new(None)),
            _entity: PhantomData,
        }
    }

    /// Returns the repository the ledger writes to.
    #[must_use]
    pub const fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    /// Page limits applied to snapshot listings.
    #[must_use]
    pub const fn limits(&self) -> PageLimits {
        self.limits
    }

    /// Returns the next snapshot time, strictly after every previous one.
    fn stamp(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let mut last = self.last_stamp.lock();
        let stamp = match *last {
            Some(previous) if now <= previous => previous + Duration::microseconds(1),
            _ => now,
        };
        *last = Some(stamp);
        stamp
    }

    async fn append(
        &self,
        guard: &KeyedLockGuard<EntityKey>,
        event: SnapshotEvent,
        committer: &Committer,
        reason: Option<String>,
        value: Option<T>,
        rollback_id: Option<SnapshotId>,
    ) -> Result<Snapshot<T>, LedgerError> {
        let snapshot = Snapshot::from_draft(SnapshotDraft {
            rollback_id,
            time: self.stamp(),
            committer: committer.clone(),
            entity_type: T::KIND,
            entity_id: guard.key().id().to_string(),
            event,
            reason,
            value,
        });
        self.repository.append_snapshot(&snapshot).await?;
        tracing::debug!(
            entity = %guard.key(),
            snapshot_id = %snapshot.id(),
            event = %event,
            "Snapshot recorded"
        );
        Ok(snapshot)
    }

    /// Records the creation of `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] if the snapshot could not be appended.
    ///
    /// # Panics
    ///
    /// Panics if `guard` does not hold the lock of `entity`.
    pub async fn record_created(
        &self,
        guard: &KeyedLockGuard<EntityKey>,
        entity: &T,
        committer: &Committer,
    ) -> Result<Snapshot<T>, LedgerError> {
        assert_guards::<T>(guard, entity.id());
        self.append(
            guard,
            SnapshotEvent::Creation,
            committer,
            None,
            Some(entity.clone()),
            None,
        )
        .await
    }

    /// Records that `current` is about to be modified.
    ///
    /// `current` must be the state *before* the modification is applied.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] if the snapshot could not be appended.
    ///
    /// # Panics
    ///
    /// Panics if `guard` does not hold the lock of `current`.
    pub async fn record_modified(
        &self,
        guard: &KeyedLockGuard<EntityKey>,
        current: &T,
        committer: &Committer,
        reason: Option<String>,
    ) -> Result<Snapshot<T>, LedgerError> {
        assert_guards::<T>(guard, current.id());
        self.append(
            guard,
            SnapshotEvent::Modification,
            committer,
            reason,
            Some(current.clone()),
            None,
        )
        .await
    }

    /// Records the deletion of `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] if the snapshot could not be appended.
    ///
    /// # Panics
    ///
    /// Panics if `guard` does not hold the lock of `entity`.
    pub async fn record_deleted(
        &self,
        guard: &KeyedLockGuard<EntityKey>,
        entity: &T,
        committer: &Committer,
        reason: Option<String>,
    ) -> Result<Snapshot<T>, LedgerError> {
        assert_guards::<T>(guard, entity.id());
        self.append(
            guard,
            SnapshotEvent::Deletion,
            committer,
            reason,
            None,
            None,
        )
        .await
    }

    /// Returns one page of `entity_id`'s snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::EmptyPage`] or [`LedgerError::PageTooLarge`] if
    /// `range.limit` is out of bounds, and [`LedgerError::Store`] if the
    /// query failed.
    pub async fn list_snapshots(
        &self,
        entity_id: &str,
        range: SnapshotRange,
        order: SortOrder,
    ) -> Result<Vec<Snapshot<T>>, LedgerError> {
        let limit = self.limits.resolve(range.limit)?;
        let range = SnapshotRange::new(range.offset, limit);
        Ok(self
            .repository
            .query_snapshots(entity_id, range, order)
            .await?)
    }

    /// Loads snapshot `id`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::SnapshotNotFound`] if no such snapshot exists.
    pub async fn snapshot(&self, id: SnapshotId) -> Result<Snapshot<T>, LedgerError> {
        self.repository
            .get_snapshot(id)
            .await?
            .filter(|snapshot| snapshot.entity_type() == T::KIND)
            .ok_or(LedgerError::SnapshotNotFound(id))
    }

    /// Makes `state` the live state of entity `id`, deleting it for `None`.
    async fn persist(&self, id: &str, state: Option<&T>) -> Result<(), StoreError> {
        match state {
            Some(entity) => {
                self.repository.put_entity(entity).await?;
            }
            None => {
                self.repository.delete_entity(id).await?;
            }
        }
        Ok(())
    }

    /// Restores the guarded entity to the state recorded by `snapshot_id`.
    ///
    /// If the snapshot carries a value, that value replaces the live entity.
    /// Otherwise the entity is deleted. Either way a rollback snapshot whose
    /// `rollback_id` is `snapshot_id` is appended after the live state was
    /// persisted. If that append fails, the prior live state is put back
    /// before the error is returned.
    ///
    /// Returns the restored entity, or `None` if the revert deleted it.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::SnapshotNotFound`] if the snapshot does not
    /// exist or belongs to a different entity, and [`LedgerError::Store`] if
    /// persisting failed.
    ///
    /// # Panics
    ///
    /// Panics if `guard` guards an entity of a different type.
    pub async fn revert(
        &self,
        guard: &KeyedLockGuard<EntityKey>,
        snapshot_id: SnapshotId,
        committer: &Committer,
        reason: Option<String>,
    ) -> Result<Option<T>, LedgerError> {
        let key = guard.key();
        assert_eq!(
            key.kind(),
            T::KIND,
            "revert of {key} through a ledger for {}",
            T::KIND
        );

        let target = self
            .repository
            .get_snapshot(snapshot_id)
            .await?
            .filter(|snapshot| snapshot.belongs_to(T::KIND, key.id()))
            .ok_or(LedgerError::SnapshotNotFound(snapshot_id))?;

        let prior = self.repository.get_entity(key.id()).await?;
        let restored = target.value().cloned();
        self.persist(key.id(), restored.as_ref()).await?;

        let appended = self
            .append(
                guard,
                SnapshotEvent::Rollback,
                committer,
                reason,
                restored.clone(),
                Some(target.id()),
            )
            .await;
        let rollback = match appended {
            Ok(rollback) => rollback,
            Err(error) => {
                if let Err(restore_error) = self.persist(key.id(), prior.as_ref()).await {
                    tracing::error!(
                        entity = %key,
                        %restore_error,
                        "Failed to restore live state after an unrecorded revert"
                    );
                }
                return Err(error);
            }
        };

        tracing::info!(
            entity = %key,
            restored_from = %target.id(),
            rollback = %rollback.id(),
            deleted = restored.is_none(),
            "Entity reverted"
        );
        Ok(restored)
    }
}

fn assert_guards<T: Entity>(guard: &KeyedLockGuard<EntityKey>, entity_id: &str) {
    let key = guard.key();
    assert!(
        key.kind() == T::KIND && key.id() == entity_id,
        "ledger write for {}/{entity_id} while holding the lock of {key}",
        T::KIND
    );
}
