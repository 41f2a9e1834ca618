//! In-memory repository and blob store.
//!
//! Records are kept as JSON documents, the way the search index stores them,
//! so no caller can mutate a stored entity or snapshot through a shared
//! reference.
//!
//! # Features
//!
//! - Thread-safe with `Arc<RwLock<...>>`
//! - Soft-deleting blob store with undelete support
//! - Failure injection for exercising error paths

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;

use crate::entity::Entity;
use crate::revision::{Snapshot, SnapshotId, SnapshotRange, SortOrder};
use crate::store::{BlobError, BlobStore, EntityRepository, StoreError};

// =============================================================================
// In-Memory Repository
// =============================================================================

#[derive(Debug, Default)]
struct RepositoryState {
    entities: HashMap<String, serde_json::Value>,
    /// Snapshots per entity, in append order.
    snapshots: HashMap<String, Vec<serde_json::Value>>,
    /// Snapshot id to (entity id, position).
    snapshot_index: HashMap<SnapshotId, (String, usize)>,
}

#[derive(Debug, Default)]
struct FailureSwitches {
    puts: AtomicBool,
    appends: AtomicBool,
}

/// In-memory implementation of [`EntityRepository`].
///
/// # Example
///
/// ```ignore
/// let repository = InMemoryRepository::<Book>::new();
/// repository.put_entity(&book).await?;
/// let found = repository.get_entity(&book.id).await?;
/// ```
pub struct InMemoryRepository<T> {
    state: Arc<RwLock<RepositoryState>>,
    failures: Arc<FailureSwitches>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for InMemoryRepository<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            failures: Arc::clone(&self.failures),
            _entity: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for InMemoryRepository<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("InMemoryRepository")
            .finish_non_exhaustive()
    }
}

impl<T> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InMemoryRepository<T> {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RepositoryState::default())),
            failures: Arc::new(FailureSwitches::default()),
            _entity: PhantomData,
        }
    }

    /// Makes every subsequent `put_entity` fail until switched off.
    pub fn fail_puts(&self, enabled: bool) {
        self.failures.puts.store(enabled, Ordering::SeqCst);
    }

    /// Makes every subsequent `append_snapshot` fail until switched off.
    pub fn fail_appends(&self, enabled: bool) {
        self.failures.appends.store(enabled, Ordering::SeqCst);
    }

    /// Returns the number of live entities.
    pub async fn entity_count(&self) -> usize {
        self.state.read().await.entities.len()
    }

    /// Returns the number of snapshots recorded for `entity_id`.
    pub async fn snapshot_count(&self, entity_id: &str) -> usize {
        self.state
            .read()
            .await
            .snapshots
            .get(entity_id)
            .map_or(0, Vec::len)
    }
}

fn decode_snapshots<T: Entity>(
    documents: &[serde_json::Value],
) -> Result<Vec<Snapshot<T>>, StoreError> {
    documents
        .iter()
        .map(|document| serde_json::from_value(document.clone()).map_err(StoreError::from))
        .collect()
}

#[allow(clippy::significant_drop_tightening)]
impl<T: Entity> EntityRepository<T> for InMemoryRepository<T> {
    fn get_entity(&self, id: &str) -> impl Future<Output = Result<Option<T>, StoreError>> + Send {
        let state = Arc::clone(&self.state);
        let id = id.to_string();
        async move {
            let guard = state.read().await;
            guard
                .entities
                .get(&id)
                .map(|document| serde_json::from_value(document.clone()))
                .transpose()
                .map_err(StoreError::from)
        }
    }

    fn put_entity(&self, entity: &T) -> impl Future<Output = Result<String, StoreError>> + Send {
        let state = Arc::clone(&self.state);
        let failures = Arc::clone(&self.failures);
        let id = entity.id().to_string();
        let document = serde_json::to_value(entity);
        async move {
            if failures.puts.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("injected put failure".to_string()));
            }
            let document = document?;
            state.write().await.entities.insert(id.clone(), document);
            Ok(id)
        }
    }

    fn delete_entity(&self, id: &str) -> impl Future<Output = Result<bool, StoreError>> + Send {
        let state = Arc::clone(&self.state);
        let id = id.to_string();
        async move { Ok(state.write().await.entities.remove(&id).is_some()) }
    }

    fn append_snapshot(
        &self,
        snapshot: &Snapshot<T>,
    ) -> impl Future<Output = Result<SnapshotId, StoreError>> + Send {
        let state = Arc::clone(&self.state);
        let failures = Arc::clone(&self.failures);
        let id = snapshot.id();
        let entity_id = snapshot.entity_id().to_string();
        let document = serde_json::to_value(snapshot);
        async move {
            if failures.appends.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("injected append failure".to_string()));
            }
            let document = document?;
            let mut guard = state.write().await;
            let history = guard.snapshots.entry(entity_id.clone()).or_default();
            history.push(document);
            let position = history.len() - 1;
            guard.snapshot_index.insert(id, (entity_id, position));
            Ok(id)
        }
    }

    fn get_snapshot(
        &self,
        id: SnapshotId,
    ) -> impl Future<Output = Result<Option<Snapshot<T>>, StoreError>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            let guard = state.read().await;
            let Some((entity_id, position)) = guard.snapshot_index.get(&id) else {
                return Ok(None);
            };
            let document = guard
                .snapshots
                .get(entity_id)
                .and_then(|history| history.get(*position))
                .cloned();
            drop(guard);
            document
                .map(serde_json::from_value)
                .transpose()
                .map_err(StoreError::from)
        }
    }

    fn query_snapshots(
        &self,
        entity_id: &str,
        range: SnapshotRange,
        order: SortOrder,
    ) -> impl Future<Output = Result<Vec<Snapshot<T>>, StoreError>> + Send {
        let state = Arc::clone(&self.state);
        let entity_id = entity_id.to_string();
        async move {
            let documents = state
                .read()
                .await
                .snapshots
                .get(&entity_id)
                .cloned()
                .unwrap_or_default();

            let mut snapshots = decode_snapshots::<T>(&documents)?;
            snapshots.sort_by_key(|snapshot| (snapshot.time(), snapshot.id()));
            if order == SortOrder::Descending {
                snapshots.reverse();
            }

            let offset = usize::try_from(range.offset).unwrap_or(usize::MAX);
            let limit = range.limit.map_or(usize::MAX, |limit| limit as usize);
            Ok(snapshots.into_iter().skip(offset).take(limit).collect())
        }
    }
}

// =============================================================================
// In-Memory Blob Store
// =============================================================================

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    media_type: String,
    deleted: bool,
}

/// In-memory blob store with soft deletion.
///
/// Deleted blobs are hidden from [`read`](BlobStore::read) but kept until
/// overwritten, so [`undelete`](BlobStore::undelete) can restore them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, StoredBlob>>>,
    fail_deletes: Arc<AtomicBool>,
}

impl InMemoryBlobStore {
    /// Creates an empty blob store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `delete` fail until switched off.
    pub fn fail_deletes(&self, enabled: bool) {
        self.fail_deletes.store(enabled, Ordering::SeqCst);
    }

    /// Returns the media type of live blob `name`.
    pub async fn media_type(&self, name: &str) -> Option<String> {
        self.blobs
            .read()
            .await
            .get(name)
            .filter(|blob| !blob.deleted)
            .map(|blob| blob.media_type.clone())
    }

    /// Returns `true` if `name` exists and is soft-deleted.
    pub async fn is_deleted(&self, name: &str) -> bool {
        self.blobs
            .read()
            .await
            .get(name)
            .is_some_and(|blob| blob.deleted)
    }

    /// Returns the number of live blobs.
    pub async fn live_count(&self) -> usize {
        self.blobs
            .read()
            .await
            .values()
            .filter(|blob| !blob.deleted)
            .count()
    }
}

impl BlobStore for InMemoryBlobStore {
    fn write<R>(
        &self,
        name: &str,
        reader: R,
        media_type: &str,
    ) -> impl Future<Output = Result<bool, BlobError>> + Send
    where
        R: AsyncRead + Send + Unpin,
    {
        let blobs = Arc::clone(&self.blobs);
        let name = name.to_string();
        let media_type = media_type.to_string();
        async move {
            let mut reader = reader;
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await?;

            let previous = blobs.write().await.insert(
                name,
                StoredBlob {
                    data: Bytes::from(data),
                    media_type,
                    deleted: false,
                },
            );
            Ok(previous.is_none_or(|blob| blob.deleted))
        }
    }

    fn read(&self, name: &str) -> impl Future<Output = Result<Option<Bytes>, BlobError>> + Send {
        let blobs = Arc::clone(&self.blobs);
        let name = name.to_string();
        async move {
            Ok(blobs
                .read()
                .await
                .get(&name)
                .filter(|blob| !blob.deleted)
                .map(|blob| blob.data.clone()))
        }
    }

    fn delete(&self, names: &[String]) -> impl Future<Output = Result<(), BlobError>> + Send {
        let blobs = Arc::clone(&self.blobs);
        let failing = Arc::clone(&self.fail_deletes);
        let names = names.to_vec();
        async move {
            if failing.load(Ordering::SeqCst) {
                return Err(BlobError::Backend("injected delete failure".to_string()));
            }
            let mut guard = blobs.write().await;
            for name in &names {
                if let Some(blob) = guard.get_mut(name) {
                    blob.deleted = true;
                }
            }
            Ok(())
        }
    }

    fn supports_undelete(&self) -> bool {
        true
    }

    fn undelete(&self, names: &[String]) -> impl Future<Output = Result<(), BlobError>> + Send {
        let blobs = Arc::clone(&self.blobs);
        let names = names.to_vec();
        async move {
            let mut guard = blobs.write().await;
            for name in &names {
                if let Some(blob) = guard.get_mut(name) {
                    blob.deleted = false;
                }
            }
            Ok(())
        }
    }
}
