//! Catalog entities and the orchestration around them.
//!
//! [`Catalog`] wires one [`KeyedLock`] shared by every entity type, a
//! [`RevisionLedger`] and [`EntityService`] per entity type, the upload
//! registry, and the [`UploadCommitter`] that turns sessions into entities.
//!
//! # Example
//!
//! ```rust,ignore
//! let catalog = Catalog::in_memory(CatalogConfig::from_env()?, Arc::new(SystemClock));
//! let _sweeper = catalog.start_sweeper();
//!
//! let session = catalog.uploads().open("user-1", UploadIntent::NewBook(draft))?;
//! session.add_file(Some("p1.png".into()), stream, "image/png").await?;
//! let outcome = catalog.commit_upload(session.id(), "user-1").await?;
//! ```

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::clock::Clock;
use crate::config::CatalogConfig;
use crate::entity::{Entity, EntityKey};
use crate::revision::{LedgerError, RevisionLedger};
use crate::store::{BlobError, BlobStore, EntityRepository, InMemoryBlobStore, InMemoryRepository, StoreError};
use crate::sync::{KeyedLock, LockError};
use crate::upload::{SessionId, StagingArea, SweeperHandle, UploadError, UploadRegistry};

mod book;
mod commit;
mod image;
mod service;

pub use book::{Book, BookDraft, Page};
pub use commit::{CommitOutcome, UploadCommitter};
pub use image::{Image, ImageDraft};
pub use service::EntityService;

// =============================================================================
// Errors
// =============================================================================

/// Caller-facing classification of a [`CatalogError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation gave up waiting for a lock.
    Cancelled,
    /// The entity, snapshot or session does not exist.
    NotFound,
    /// A quota or size limit was hit.
    Rejected,
    /// The request itself is malformed.
    BadRequest,
    /// Storage or I/O failed.
    Internal,
}

/// Errors raised by catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The entity lock was not granted.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The entity does not exist.
    #[error("{kind} not found: {id}")]
    EntityNotFound {
        /// Entity type.
        kind: &'static str,
        /// Entity identifier.
        id: String,
    },

    /// An entity with the same id already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Entity type.
        kind: &'static str,
        /// Entity identifier.
        id: String,
    },

    /// The request cannot be carried out as given.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The revision ledger failed or rejected the request.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The entity repository failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The blob store failed.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// The upload subsystem failed or rejected the request.
    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl CatalogError {
    pub(crate) fn not_found<T: Entity>(id: &str) -> Self {
        Self::EntityNotFound {
            kind: T::KIND,
            id: id.to_string(),
        }
    }

    /// Classifies this error.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use catalog_core::catalog::{CatalogError, ErrorKind};
    /// use catalog_core::sync::LockError;
    ///
    /// assert_eq!(CatalogError::from(LockError::Cancelled).kind(), ErrorKind::Cancelled);
    /// ```
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Lock(_) => ErrorKind::Cancelled,
            Self::EntityNotFound { .. }
            | Self::Ledger(LedgerError::SnapshotNotFound(_))
            | Self::Upload(UploadError::SessionNotFound(_)) => ErrorKind::NotFound,
            Self::AlreadyExists { .. }
            | Self::Ledger(LedgerError::PageTooLarge { .. })
            | Self::Upload(UploadError::QuotaExceeded { .. } | UploadError::FileTooLarge { .. }) => {
                ErrorKind::Rejected
            }
            Self::BadRequest(_) | Self::Ledger(LedgerError::EmptyPage) => ErrorKind::BadRequest,
            Self::Ledger(LedgerError::Store(_))
            | Self::Store(_)
            | Self::Blob(_)
            | Self::Upload(UploadError::Io(_)) => ErrorKind::Internal,
        }
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// The catalog core: locks, ledgers, services and uploads wired together.
pub struct Catalog<R, I, B> {
    config: CatalogConfig,
    locks: KeyedLock<EntityKey>,
    books: EntityService<Book, R, B>,
    images: EntityService<Image, I, B>,
    uploads: Arc<UploadRegistry>,
    committer: UploadCommitter<R, I, B>,
}

/// A catalog backed entirely by in-memory collaborators.
pub type InMemoryCatalog =
    Catalog<InMemoryRepository<Book>, InMemoryRepository<Image>, InMemoryBlobStore>;

impl<R, I, B> Clone for Catalog<R, I, B> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            locks: self.locks.clone(),
            books: self.books.clone(),
            images: self.images.clone(),
            uploads: Arc::clone(&self.uploads),
            committer: self.committer.clone(),
        }
    }
}

impl<R, I, B> fmt::Debug for Catalog<R, I, B> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Catalog")
            .field("config", &self.config)
            .field("locks", &self.locks)
            .field("uploads", &self.uploads)
            .finish_non_exhaustive()
    }
}

impl<R, I, B> Catalog<R, I, B>
where
    R: EntityRepository<Book>,
    I: EntityRepository<Image>,
    B: BlobStore,
{
    /// Wires a catalog over the given collaborators.
    #[must_use]
    pub fn new(
        config: CatalogConfig,
        book_repository: Arc<R>,
        image_repository: Arc<I>,
        blobs: Arc<B>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = KeyedLock::with_pool_capacity(config.lock_pool_capacity);
        let limits = config.page_limits();

        let books = EntityService::new(
            locks.clone(),
            RevisionLedger::new(book_repository, Arc::clone(&clock), limits),
            Arc::clone(&blobs),
        );
        let images = EntityService::new(
            locks.clone(),
            RevisionLedger::new(image_repository, Arc::clone(&clock), limits),
            blobs,
        );

        let staging = StagingArea::new(config.staging_dir.clone(), config.max_file_bytes);
        let uploads = Arc::new(UploadRegistry::new(
            config.upload_limits(),
            staging,
            Arc::clone(&clock),
        ));
        let committer =
            UploadCommitter::new(Arc::clone(&uploads), books.clone(), images.clone(), clock);

        Self {
            config,
            locks,
            books,
            images,
            uploads,
            committer,
        }
    }

    /// Configuration the catalog was built from.
    #[must_use]
    pub const fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// The lock manager shared by every entity type.
    #[must_use]
    pub const fn locks(&self) -> &KeyedLock<EntityKey> {
        &self.locks
    }

    /// Operations on books.
    #[must_use]
    pub const fn books(&self) -> &EntityService<Book, R, B> {
        &self.books
    }

    /// Operations on images.
    #[must_use]
    pub const fn images(&self) -> &EntityService<Image, I, B> {
        &self.images
    }

    /// Registry of open upload sessions.
    #[must_use]
    pub const fn uploads(&self) -> &Arc<UploadRegistry> {
        &self.uploads
    }

    /// Commits upload session `session_id` on behalf of `owner_id`.
    ///
    /// # Errors
    ///
    /// See [`UploadCommitter::commit`].
    pub async fn commit_upload(
        &self,
        session_id: SessionId,
        owner_id: &str,
    ) -> Result<CommitOutcome, CatalogError> {
        self.committer.commit(session_id, owner_id).await
    }

    /// Aborts upload session `session_id` on behalf of `owner_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Upload`] if the session does not exist for
    /// this owner.
    pub fn abort_upload(&self, session_id: SessionId, owner_id: &str) -> Result<(), CatalogError> {
        Ok(self.uploads.abort(session_id, owner_id)?)
    }

    /// Starts the upload expiry sweeper on the current tokio runtime.
    #[must_use = "dropping the handle stops the sweeper"]
    pub fn start_sweeper(&self) -> SweeperHandle {
        self.uploads.spawn_sweeper()
    }
}

impl InMemoryCatalog {
    /// Creates a catalog over fresh in-memory repositories and blob store.
    #[must_use]
    pub fn in_memory(config: CatalogConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config,
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryBlobStore::new()),
            clock,
        )
    }
}
