//! End-to-end scenarios: upload sessions committed into catalog entities.

mod common;

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use catalog_core::prelude::*;
use catalog_core::store::BlobError;
use common::{book, harness, staged_entries};
use rstest::rstest;
use tokio::io::AsyncRead;
use tokio::sync::Notify;

/// Blob store whose writes wait for `release` after signalling `entered`.
struct GatedBlobStore {
    inner: InMemoryBlobStore,
    entered: Notify,
    release: Notify,
}

impl BlobStore for GatedBlobStore {
    fn write<R>(
        &self,
        name: &str,
        reader: R,
        media_type: &str,
    ) -> impl Future<Output = Result<bool, BlobError>> + Send
    where
        R: AsyncRead + Send + Unpin,
    {
        async move {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.write(name, reader, media_type).await
        }
    }

    fn read(&self, name: &str) -> impl Future<Output = Result<Option<Bytes>, BlobError>> + Send {
        self.inner.read(name)
    }

    fn delete(&self, names: &[String]) -> impl Future<Output = Result<(), BlobError>> + Send {
        self.inner.delete(names)
    }
}

type GatedCatalog = Catalog<InMemoryRepository<Book>, InMemoryRepository<Image>, GatedBlobStore>;

fn gated_catalog(staging: &tempfile::TempDir) -> (GatedCatalog, Arc<GatedBlobStore>) {
    let blobs = Arc::new(GatedBlobStore {
        inner: InMemoryBlobStore::new(),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let catalog = Catalog::new(
        common::config(staging),
        Arc::new(InMemoryRepository::new()),
        Arc::new(InMemoryRepository::new()),
        Arc::clone(&blobs),
        Arc::new(ManualClock::default()),
    );
    (catalog, blobs)
}

// =============================================================================
// Commit
// =============================================================================

#[rstest]
#[tokio::test]
async fn three_file_session_becomes_a_three_page_book() {
    let harness = harness();
    let session = harness
        .catalog
        .uploads()
        .open("U1", UploadIntent::NewBook(BookDraft::new("Atlas").with_author("Mercator")))
        .unwrap();
    for (name, content) in [("p1.png", "first"), ("p2.png", "second"), ("p3.png", "third")] {
        session
            .add_file(Some(name.into()), content.as_bytes(), "image/png")
            .await
            .unwrap();
    }

    let outcome = harness
        .catalog
        .commit_upload(session.id(), "U1")
        .await
        .unwrap();

    let CommitOutcome::Book(committed) = outcome else {
        panic!("expected a book");
    };
    assert_eq!(committed.pages.len(), 3);
    assert_eq!(committed.uploader_id, "U1");
    assert_eq!(committed.author.as_deref(), Some("Mercator"));

    let stored = harness.catalog.books().get(&committed.id).await.unwrap();
    assert_eq!(stored, committed);
    for (index, expected) in ["first", "second", "third"].into_iter().enumerate() {
        let blob_name = Book::page_blob_name(&committed.id, index);
        assert_eq!(stored.pages[index].blob_name, blob_name);
        assert_eq!(
            harness.blobs.read(&blob_name).await.unwrap(),
            Some(Bytes::from(expected))
        );
    }
    assert_eq!(stored.pages[1].original_name.as_deref(), Some("p2.png"));

    let history = harness
        .catalog
        .books()
        .history(&committed.id, SnapshotRange::default(), SortOrder::Ascending)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event(), SnapshotEvent::Creation);
    assert_eq!(history[0].committer_id(), "U1");

    assert!(harness.catalog.uploads().is_empty());
    assert!(session.is_finalized());
    assert_eq!(staged_entries(&harness), 0);
    assert_eq!(harness.catalog.locks().active_keys(), 0);
}

#[rstest]
#[tokio::test]
async fn append_session_extends_an_existing_book() {
    let harness = harness();
    let owner = Committer::user("U1");
    let mut existing = book("b1", "Journal");
    existing.pages.push(Page {
        blob_name: Book::page_blob_name("b1", 0),
        media_type: "image/png".to_string(),
        original_name: None,
    });
    harness.catalog.books().create(existing, &owner).await.unwrap();

    let session = harness
        .catalog
        .uploads()
        .open(
            "U1",
            UploadIntent::AppendPages {
                book_id: "b1".to_string(),
            },
        )
        .unwrap();
    session.add_file(None, &b"p2"[..], "image/jpeg").await.unwrap();
    session.add_file(None, &b"p3"[..], "image/jpeg").await.unwrap();

    harness
        .catalog
        .commit_upload(session.id(), "U1")
        .await
        .unwrap();

    let updated = harness.catalog.books().get("b1").await.unwrap();
    let names: Vec<_> = updated.pages.iter().map(|page| page.blob_name.as_str()).collect();
    assert_eq!(names, vec!["books/b1/0000", "books/b1/0001", "books/b1/0002"]);

    let latest = harness
        .catalog
        .books()
        .history("b1", SnapshotRange::first(1), SortOrder::Descending)
        .await
        .unwrap();
    assert_eq!(latest[0].event(), SnapshotEvent::Modification);
    assert_eq!(latest[0].value().map(|book| book.pages.len()), Some(1));
    assert_eq!(latest[0].reason(), Some("appended 2 pages"));
}

#[rstest]
#[tokio::test]
async fn image_session_takes_exactly_one_file() {
    let harness = harness();
    let uploads = harness.catalog.uploads();
    let session = uploads
        .open("U1", UploadIntent::NewImage(ImageDraft::new("Sunset")))
        .unwrap();
    session.add_file(None, &b"one"[..], "image/png").await.unwrap();
    session.add_file(None, &b"two"[..], "image/png").await.unwrap();

    let error = harness
        .catalog
        .commit_upload(session.id(), "U1")
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::BadRequest);
    assert!(uploads.get(session.id(), "U1").is_ok());

    harness.catalog.abort_upload(session.id(), "U1").unwrap();
    let single = uploads
        .open("U1", UploadIntent::NewImage(ImageDraft::new("Sunset")))
        .unwrap();
    single.add_file(None, &b"one"[..], "image/png").await.unwrap();

    let CommitOutcome::Image(image) = harness
        .catalog
        .commit_upload(single.id(), "U1")
        .await
        .unwrap()
    else {
        panic!("expected an image");
    };

    assert_eq!(image.blob_name, format!("images/{}", image.id));
    assert_eq!(harness.catalog.images().get(&image.id).await.unwrap(), image);
    assert_eq!(
        harness.blobs.read(&image.blob_name).await.unwrap(),
        Some(Bytes::from_static(b"one"))
    );
}

#[rstest]
#[tokio::test]
async fn commit_by_another_owner_is_not_found() {
    let harness = harness();
    let session = harness
        .catalog
        .uploads()
        .open("U1", UploadIntent::NewBook(BookDraft::new("Mine")))
        .unwrap();
    session.add_file(None, &b"page"[..], "image/png").await.unwrap();

    let error = harness
        .catalog
        .commit_upload(session.id(), "U2")
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert_eq!(session.file_count(), 1);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_finishing_during_commit_is_not_accepted() {
    let staging = tempfile::tempdir().unwrap();
    let (catalog, blobs) = gated_catalog(&staging);
    let session = catalog
        .uploads()
        .open("U1", UploadIntent::NewBook(BookDraft::new("Race")))
        .unwrap();
    session.add_file(None, &b"first"[..], "image/png").await.unwrap();

    let commit = tokio::spawn({
        let catalog = catalog.clone();
        let session_id = session.id();
        async move { catalog.commit_upload(session_id, "U1").await }
    });
    blobs.entered.notified().await;

    let accepted = session.add_file(None, &b"late"[..], "image/png").await.unwrap();
    blobs.release.notify_one();
    let outcome = commit.await.unwrap().unwrap();

    assert!(!accepted);
    let CommitOutcome::Book(committed) = outcome else {
        panic!("expected a book");
    };
    assert_eq!(committed.pages.len(), 1);
    assert_eq!(
        blobs.inner.read(&committed.pages[0].blob_name).await.unwrap(),
        Some(Bytes::from_static(b"first"))
    );
    assert!(session.is_finalized());
    assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn image_commit_keeps_its_single_file_against_late_uploads() {
    let staging = tempfile::tempdir().unwrap();
    let (catalog, blobs) = gated_catalog(&staging);
    let session = catalog
        .uploads()
        .open("U1", UploadIntent::NewImage(ImageDraft::new("Dawn")))
        .unwrap();
    session.add_file(None, &b"original"[..], "image/png").await.unwrap();

    let commit = tokio::spawn({
        let catalog = catalog.clone();
        let session_id = session.id();
        async move { catalog.commit_upload(session_id, "U1").await }
    });
    blobs.entered.notified().await;
    let accepted = session.add_file(None, &b"intruder"[..], "image/png").await.unwrap();
    blobs.release.notify_one();

    let CommitOutcome::Image(image) = commit.await.unwrap().unwrap() else {
        panic!("expected an image");
    };
    assert!(!accepted);
    assert_eq!(
        blobs.inner.read(&image.blob_name).await.unwrap(),
        Some(Bytes::from_static(b"original"))
    );
}

// =============================================================================
// Failure Cleanup
// =============================================================================

#[rstest]
#[tokio::test]
async fn failed_commit_deletes_written_blobs_and_staged_files() {
    let harness = harness();
    let session = harness
        .catalog
        .uploads()
        .open("U1", UploadIntent::NewBook(BookDraft::new("Doomed")))
        .unwrap();
    session.add_file(None, &b"a"[..], "image/png").await.unwrap();
    session.add_file(None, &b"b"[..], "image/png").await.unwrap();
    harness.books.fail_appends(true);

    let error = harness
        .catalog
        .commit_upload(session.id(), "U1")
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Internal);
    assert_eq!(harness.blobs.live_count().await, 0);
    assert_eq!(harness.books.entity_count().await, 0);
    assert!(harness.catalog.uploads().is_empty());
    assert_eq!(staged_entries(&harness), 0);
}

#[rstest]
#[tokio::test]
async fn appending_to_a_missing_book_is_not_found() {
    let harness = harness();
    let session = harness
        .catalog
        .uploads()
        .open(
            "U1",
            UploadIntent::AppendPages {
                book_id: "ghost".to_string(),
            },
        )
        .unwrap();
    session.add_file(None, &b"page"[..], "image/png").await.unwrap();

    let error = harness
        .catalog
        .commit_upload(session.id(), "U1")
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::NotFound);
    assert_eq!(harness.blobs.live_count().await, 0);
}

// =============================================================================
// Locking
// =============================================================================

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commit_and_edit_of_one_book_serialize() {
    let harness = harness();
    let owner = Committer::user("U1");
    harness
        .catalog
        .books()
        .create(book("book-42", "Draft"), &owner)
        .await
        .unwrap();
    let session = harness
        .catalog
        .uploads()
        .open(
            "U1",
            UploadIntent::AppendPages {
                book_id: "book-42".to_string(),
            },
        )
        .unwrap();
    session.add_file(None, &b"page"[..], "image/png").await.unwrap();

    let guard = harness.catalog.books().lock("book-42").await;
    let commit = tokio::spawn({
        let catalog = harness.catalog.clone();
        let session_id = session.id();
        async move { catalog.commit_upload(session_id, "U1").await.map(|_| ()) }
    });
    let edit = tokio::spawn({
        let catalog = harness.catalog.clone();
        async move {
            catalog
                .books()
                .update("book-42", &Committer::user("U1"), None, |book: &mut Book| {
                    book.title = "Final".to_string();
                })
                .await
                .map(|_| ())
        }
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(harness.books.snapshot_count("book-42").await, 1);
    drop(guard);

    commit.await.unwrap().unwrap();
    edit.await.unwrap().unwrap();

    let final_state = harness.catalog.books().get("book-42").await.unwrap();
    assert_eq!(final_state.title, "Final");
    assert_eq!(final_state.pages.len(), 1);
    assert_eq!(harness.books.snapshot_count("book-42").await, 3);
}
