//! Persistence and blob storage collaborators.
//!
//! The core only talks to storage through the traits in this module. The
//! real service backs them with a search index and an object store; the
//! in-memory implementations in [`in_memory`] back the tests.
//!
//! # Contracts
//!
//! - `put_entity` durably replaces any prior state of the same entity.
//! - `append_snapshot` is durable once its future resolves.
//! - Blob deletion may be soft. Backends that can reverse it report
//!   [`BlobStore::supports_undelete`].

use std::future::Future;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::revision::{Snapshot, SnapshotId, SnapshotRange, SortOrder};

pub mod in_memory;

pub use in_memory::{InMemoryBlobStore, InMemoryRepository};

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by an entity/snapshot repository.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or rejected the operation.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Errors raised by a blob store.
#[derive(Debug, Error)]
pub enum BlobError {
    /// Reading the source stream or writing the blob failed.
    #[error("Blob I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend rejected the operation.
    #[error("Blob backend error: {0}")]
    Backend(String),

    /// The backend deletes permanently and cannot restore blobs.
    #[error("Blob backend does not support undelete")]
    UndeleteUnsupported,
}

// =============================================================================
// Entity Repository
// =============================================================================

/// Storage for live entities and their snapshot history.
pub trait EntityRepository<T>: Send + Sync {
    /// Loads the live state of entity `id`, or `None` if it does not exist.
    fn get_entity(&self, id: &str) -> impl Future<Output = Result<Option<T>, StoreError>> + Send;

    /// Stores `entity`, replacing any prior state, and returns its id.
    fn put_entity(&self, entity: &T) -> impl Future<Output = Result<String, StoreError>> + Send;

    /// Removes entity `id`. Returns `false` if it did not exist.
    fn delete_entity(&self, id: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Durably appends `snapshot` and returns its id.
    fn append_snapshot(
        &self,
        snapshot: &Snapshot<T>,
    ) -> impl Future<Output = Result<SnapshotId, StoreError>> + Send;

    /// Loads one snapshot by id.
    fn get_snapshot(
        &self,
        id: SnapshotId,
    ) -> impl Future<Output = Result<Option<Snapshot<T>>, StoreError>> + Send;

    /// Returns a window of `entity_id`'s snapshots ordered by time.
    ///
    /// `range.limit` is always set by the caller.
    fn query_snapshots(
        &self,
        entity_id: &str,
        range: SnapshotRange,
        order: SortOrder,
    ) -> impl Future<Output = Result<Vec<Snapshot<T>>, StoreError>> + Send;
}

// =============================================================================
// Blob Store
// =============================================================================

/// Permanent storage for uploaded files.
pub trait BlobStore: Send + Sync {
    /// Writes `reader` to blob `name`.
    ///
    /// Returns `true` if the blob was created and `false` if an existing blob
    /// of the same name was replaced.
    fn write<R>(
        &self,
        name: &str,
        reader: R,
        media_type: &str,
    ) -> impl Future<Output = Result<bool, BlobError>> + Send
    where
        R: AsyncRead + Send + Unpin;

    /// Reads blob `name`, or `None` if it does not exist or was deleted.
    fn read(&self, name: &str) -> impl Future<Output = Result<Option<Bytes>, BlobError>> + Send;

    /// Deletes every blob in `names`. Missing names are ignored.
    fn delete(&self, names: &[String]) -> impl Future<Output = Result<(), BlobError>> + Send;

    /// Returns `true` if [`undelete`](Self::undelete) can restore deleted blobs.
    fn supports_undelete(&self) -> bool {
        false
    }

    /// Restores previously deleted blobs.
    fn undelete(&self, names: &[String]) -> impl Future<Output = Result<(), BlobError>> + Send {
        let _ = names;
        std::future::ready(Err(BlobError::UndeleteUnsupported))
    }
}
