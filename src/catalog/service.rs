//! Lock-ledger-persist orchestration for one entity type.
//!
//! Every mutating operation follows the same order: acquire the entity's
//! keyed lock, load the current state, append the snapshot, apply the change
//! to a fresh copy, persist, and release the lock when the guard drops.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::entity::{Committer, Entity, EntityKey};
use crate::revision::{RevisionLedger, Snapshot, SnapshotId, SnapshotRange, SortOrder};
use crate::store::{BlobStore, EntityRepository};
use crate::sync::{KeyedLock, KeyedLockGuard};

use super::CatalogError;

/// Mutations of one entity type, serialized per entity id.
pub struct EntityService<T, R, B> {
    locks: KeyedLock<EntityKey>,
    ledger: RevisionLedger<T, R>,
    blobs: Arc<B>,
}

impl<T, R, B> Clone for EntityService<T, R, B> {
    fn clone(&self) -> Self {
        Self {
            locks: self.locks.clone(),
            ledger: self.ledger.clone(),
            blobs: Arc::clone(&self.blobs),
        }
    }
}

impl<T, R, B> fmt::Debug for EntityService<T, R, B> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EntityService")
            .field("locks", &self.locks)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl<T, R, B> EntityService<T, R, B>
where
    T: Entity,
    R: EntityRepository<T>,
    B: BlobStore,
{
    /// Creates a service over the shared lock manager, a ledger and a blob store.
    #[must_use]
    pub const fn new(locks: KeyedLock<EntityKey>, ledger: RevisionLedger<T, R>, blobs: Arc<B>) -> Self {
        Self {
            locks,
            ledger,
            blobs,
        }
    }

    /// Revision ledger of this entity type.
    #[must_use]
    pub const fn ledger(&self) -> &RevisionLedger<T, R> {
        &self.ledger
    }

    /// Blob store holding the entities' files.
    #[must_use]
    pub const fn blobs(&self) -> &Arc<B> {
        &self.blobs
    }

    /// Waits for the lock of entity `id`.
    pub async fn lock(&self, id: &str) -> KeyedLockGuard<EntityKey> {
        let key = EntityKey::of::<T>(id);
        if let Some(guard) = self.locks.try_acquire(key.clone()) {
            return guard;
        }
        tracing::debug!(entity = %key, "Waiting for entity lock");
        self.locks.acquire(key).await
    }

    async fn load(&self, id: &str) -> Result<T, CatalogError> {
        self.ledger
            .repository()
            .get_entity(id)
            .await?
            .ok_or_else(|| CatalogError::not_found::<T>(id))
    }

    /// Loads entity `id` without taking its lock.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::EntityNotFound`] if it does not exist.
    pub async fn get(&self, id: &str) -> Result<T, CatalogError> {
        self.load(id).await
    }

    /// Records and stores a new entity while `guard` is held.
    pub(crate) async fn insert_locked(
        &self,
        guard: &KeyedLockGuard<EntityKey>,
        entity: &T,
        committer: &Committer,
    ) -> Result<Snapshot<T>, CatalogError> {
        if self
            .ledger
            .repository()
            .get_entity(entity.id())
            .await?
            .is_some()
        {
            return Err(CatalogError::AlreadyExists {
                kind: T::KIND,
                id: entity.id().to_string(),
            });
        }
        let snapshot = self.ledger.record_created(guard, entity, committer).await?;
        self.ledger.repository().put_entity(entity).await?;
        Ok(snapshot)
    }

    /// Applies `mutate` to the entity held by `guard`.
    pub(crate) async fn update_locked<F>(
        &self,
        guard: &KeyedLockGuard<EntityKey>,
        committer: &Committer,
        reason: Option<String>,
        mutate: F,
    ) -> Result<T, CatalogError>
    where
        F: FnOnce(&mut T) + Send,
    {
        let current = self.load(guard.key().id()).await?;
        self.ledger
            .record_modified(guard, &current, committer, reason)
            .await?;

        let mut next = current.clone();
        mutate(&mut next);
        assert_eq!(
            next.id(),
            current.id(),
            "update of {} changed the entity id",
            guard.key()
        );

        self.ledger.repository().put_entity(&next).await?;
        Ok(next)
    }

    /// Creates `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::AlreadyExists`] if an entity with the same id
    /// exists, or the storage error that interrupted the creation.
    pub async fn create(&self, entity: T, committer: &Committer) -> Result<T, CatalogError> {
        let guard = self.lock(entity.id()).await;
        self.insert_locked(&guard, &entity, committer).await?;
        tracing::info!(entity = %guard.key(), committer = %committer.id, "Entity created");
        Ok(entity)
    }

    /// Modifies entity `id` with `mutate` and returns the new state.
    ///
    /// The state before `mutate` runs is recorded as a modification snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::EntityNotFound`] if the entity does not exist,
    /// or the storage error that interrupted the update.
    ///
    /// # Panics
    ///
    /// Panics if `mutate` changes the entity's id.
    pub async fn update<F>(
        &self,
        id: &str,
        committer: &Committer,
        reason: Option<String>,
        mutate: F,
    ) -> Result<T, CatalogError>
    where
        F: FnOnce(&mut T) + Send,
    {
        let guard = self.lock(id).await;
        let updated = self
            .update_locked(&guard, committer, reason, mutate)
            .await?;
        tracing::info!(entity = %guard.key(), committer = %committer.id, "Entity modified");
        Ok(updated)
    }

    /// Deletes entity `id` and frees its blobs.
    ///
    /// A blob store failure after the deletion was recorded is logged and
    /// does not fail the call.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::EntityNotFound`] if the entity does not exist,
    /// or the storage error that interrupted the deletion.
    pub async fn delete(
        &self,
        id: &str,
        committer: &Committer,
        reason: Option<String>,
    ) -> Result<Snapshot<T>, CatalogError> {
        let guard = self.lock(id).await;
        let current = self.load(id).await?;

        let snapshot = self
            .ledger
            .record_deleted(&guard, &current, committer, reason)
            .await?;
        self.ledger.repository().delete_entity(id).await?;

        let blob_names = current.blob_names();
        if !blob_names.is_empty() {
            if let Err(error) = self.blobs.delete(&blob_names).await {
                tracing::warn!(
                    entity = %guard.key(),
                    %error,
                    blobs = ?blob_names,
                    "Entity deleted but its blobs could not be freed"
                );
            }
        }

        tracing::info!(
            entity = %guard.key(),
            committer = %committer.id,
            blobs = blob_names.len(),
            "Entity deleted"
        );
        Ok(snapshot)
    }

    /// Restores entity `id` to snapshot `snapshot_id`.
    ///
    /// Blobs referenced only by the current state are freed and blobs
    /// referenced only by the restored state are restored, so reverting into
    /// a deletion frees everything and reverting out of one restores it.
    ///
    /// Returns the restored entity, or `None` if the revert deleted it.
    /// Blob store failures after the revert was recorded are logged and do
    /// not fail the call.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Ledger`] with `SnapshotNotFound` if the
    /// snapshot does not belong to this entity, or the storage error that
    /// interrupted the revert. The entity is unchanged in both cases.
    pub async fn revert(
        &self,
        id: &str,
        snapshot_id: SnapshotId,
        committer: &Committer,
        reason: Option<String>,
    ) -> Result<Option<T>, CatalogError> {
        let guard = self.lock(id).await;
        let current = self.ledger.repository().get_entity(id).await?;

        let restored = self
            .ledger
            .revert(&guard, snapshot_id, committer, reason)
            .await?;

        let before = blob_set(current.as_ref());
        let after = blob_set(restored.as_ref());
        let to_free: Vec<String> = before.difference(&after).cloned().collect();
        let to_restore: Vec<String> = after.difference(&before).cloned().collect();

        if !to_restore.is_empty() {
            if !self.blobs.supports_undelete() {
                tracing::warn!(
                    entity = %guard.key(),
                    blobs = to_restore.len(),
                    "Blob store cannot undelete, restored entity references missing blobs"
                );
            } else if let Err(error) = self.blobs.undelete(&to_restore).await {
                tracing::warn!(
                    entity = %guard.key(),
                    %error,
                    blobs = ?to_restore,
                    "Entity reverted but its blobs could not be restored"
                );
            }
        }
        if !to_free.is_empty() {
            if let Err(error) = self.blobs.delete(&to_free).await {
                tracing::warn!(
                    entity = %guard.key(),
                    %error,
                    blobs = ?to_free,
                    "Entity reverted but its blobs could not be freed"
                );
            }
        }

        Ok(restored)
    }

    /// Returns one page of entity `id`'s history.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Ledger`] if the page size is out of bounds or
    /// the query failed.
    pub async fn history(
        &self,
        id: &str,
        range: SnapshotRange,
        order: SortOrder,
    ) -> Result<Vec<Snapshot<T>>, CatalogError> {
        Ok(self.ledger.list_snapshots(id, range, order).await?)
    }

    /// Loads snapshot `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Ledger`] if the snapshot does not exist.
    pub async fn snapshot(&self, id: SnapshotId) -> Result<Snapshot<T>, CatalogError> {
        Ok(self.ledger.snapshot(id).await?)
    }
}

fn blob_set<T: Entity>(entity: Option<&T>) -> HashSet<String> {
    entity
        .map(|entity| entity.blob_names().into_iter().collect())
        .unwrap_or_default()
}
