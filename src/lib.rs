//! # catalog-core
//!
//! The concurrency and lifecycle core of a catalog/media service.
//!
//! ## Overview
//!
//! - **Keyed locking**: [`sync::KeyedLock`] serializes read-modify-write
//!   operations on the same entity while unrelated entities proceed
//!   concurrently.
//! - **Revision ledger**: [`revision::RevisionLedger`] records every create,
//!   modify and delete as an immutable [`revision::Snapshot`] and can revert
//!   an entity to any of them.
//! - **Upload sessions**: [`upload::UploadRegistry`] stages multi-file
//!   uploads across requests and reclaims idle sessions in the background.
//! - **Orchestration**: [`catalog::Catalog`] wires the above around books and
//!   images, always in the order lock, ledger, persistence.
//!
//! Storage is reached only through the traits in [`store`]; the in-memory
//! implementations there are complete enough to run the whole core.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use catalog_core::prelude::*;
//!
//! let catalog = Catalog::in_memory(CatalogConfig::from_env()?, Arc::new(SystemClock));
//! let committer = Committer::user("user-1");
//!
//! let book = catalog
//!     .books()
//!     .update("book-42", &committer, None, |book| book.title = "New title".into())
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// Note: Disabling redundant_closure_for_method_calls due to clippy 0.1.92 panic bug
#![allow(clippy::redundant_closure_for_method_calls)]

/// Prelude module for convenient imports.
///
/// # Usage
///
/// ```rust
/// use catalog_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::catalog::{
        Book, BookDraft, Catalog, CatalogError, CommitOutcome, EntityService, ErrorKind, Image,
        ImageDraft, InMemoryCatalog, Page,
    };
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::CatalogConfig;
    pub use crate::entity::{Committer, CommitterType, Entity, EntityKey};
    pub use crate::revision::{
        RevisionLedger, Snapshot, SnapshotEvent, SnapshotId, SnapshotRange, SortOrder,
    };
    pub use crate::store::{BlobStore, EntityRepository, InMemoryBlobStore, InMemoryRepository};
    pub use crate::sync::{KeyedLock, KeyedLockGuard, LockError};
    pub use crate::upload::{SessionId, UploadIntent, UploadRegistry, UploadSession};
}

pub mod catalog;
pub mod clock;
pub mod config;
pub mod entity;
pub mod revision;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod upload;
