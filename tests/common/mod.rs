//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use catalog_core::prelude::*;
use tempfile::TempDir;

/// A catalog over in-memory collaborators plus handles to inspect them.
pub struct Harness {
    pub catalog: InMemoryCatalog,
    pub clock: ManualClock,
    pub books: Arc<InMemoryRepository<Book>>,
    pub images: Arc<InMemoryRepository<Image>>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub staging: TempDir,
}

/// Configuration with a private staging directory and short upload timings.
pub fn config(staging: &TempDir) -> CatalogConfig {
    CatalogConfig {
        upload_max_sessions: 2,
        upload_session_timeout: Duration::from_secs(60),
        upload_sweep_interval: Duration::from_secs(10),
        max_file_bytes: 1024,
        staging_dir: staging.path().to_path_buf(),
        ..CatalogConfig::default()
    }
}

pub fn harness() -> Harness {
    let staging = tempfile::tempdir().expect("create staging directory");
    harness_with(config(&staging), staging)
}

pub fn harness_with(config: CatalogConfig, staging: TempDir) -> Harness {
    let clock = ManualClock::default();
    let books = Arc::new(InMemoryRepository::new());
    let images = Arc::new(InMemoryRepository::new());
    let blobs = Arc::new(InMemoryBlobStore::new());
    let catalog = Catalog::new(
        config,
        Arc::clone(&books),
        Arc::clone(&images),
        Arc::clone(&blobs),
        Arc::new(clock.clone()),
    );
    Harness {
        catalog,
        clock,
        books,
        images,
        blobs,
        staging,
    }
}

pub fn book(id: &str, title: &str) -> Book {
    Book::new(
        id,
        BookDraft::new(title),
        "uploader",
        chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
    )
}

/// A book whose pages reference blobs already present in `blobs`.
pub async fn book_with_pages(blobs: &InMemoryBlobStore, id: &str, pages: usize) -> Book {
    let mut book = book(id, "Illustrated");
    for index in 0..pages {
        let blob_name = Book::page_blob_name(id, index);
        blobs
            .write(&blob_name, &b"page"[..], "image/png")
            .await
            .expect("write page blob");
        book.pages.push(Page {
            blob_name,
            media_type: "image/png".to_string(),
            original_name: None,
        });
    }
    book
}

/// Number of entries left in the staging directory.
pub fn staged_entries(harness: &Harness) -> usize {
    std::fs::read_dir(harness.staging.path()).map_or(0, |entries| entries.count())
}
