//! Materializing upload sessions into catalog entities.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;

use crate::clock::Clock;
use crate::entity::{Committer, Entity};
use crate::store::{BlobStore, EntityRepository};
use crate::upload::{SessionId, UploadError, UploadIntent, UploadRegistry, UploadSession};

use super::CatalogError;
use super::book::{Book, BookDraft, Page};
use super::image::{Image, ImageDraft};
use super::service::EntityService;

/// The entity a committed session produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// A new book, or an existing book with appended pages.
    Book(Book),
    /// A new image.
    Image(Image),
}

impl CommitOutcome {
    /// Identifier of the committed entity.
    #[must_use]
    pub fn entity_id(&self) -> &str {
        match self {
            Self::Book(book) => book.id(),
            Self::Image(image) => image.id(),
        }
    }
}

/// A file copied from the session into permanent storage.
struct StoredFile {
    blob_name: String,
    media_type: String,
    original_name: Option<String>,
}

/// Commits upload sessions.
///
/// A commit detaches the session from the registry, copies every staged file
/// into the blob store under its permanent name, and records the resulting
/// entity through the owning [`EntityService`]. If any step fails, the blobs
/// written so far are deleted before the error is returned. The session is
/// disposed in both cases.
pub struct UploadCommitter<R, I, B> {
    registry: Arc<UploadRegistry>,
    books: EntityService<Book, R, B>,
    images: EntityService<Image, I, B>,
    clock: Arc<dyn Clock>,
}

impl<R, I, B> Clone for UploadCommitter<R, I, B> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            books: self.books.clone(),
            images: self.images.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<R, I, B> fmt::Debug for UploadCommitter<R, I, B> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("UploadCommitter")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<R, I, B> UploadCommitter<R, I, B>
where
    R: EntityRepository<Book>,
    I: EntityRepository<Image>,
    B: BlobStore,
{
    /// Creates a committer over the given registry and services.
    #[must_use]
    pub fn new(
        registry: Arc<UploadRegistry>,
        books: EntityService<Book, R, B>,
        images: EntityService<Image, I, B>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            books,
            images,
            clock,
        }
    }

    /// Commits session `session_id` on behalf of `owner_id`.
    ///
    /// The session is sealed first: uploads finishing after that point are
    /// discarded and reported to their caller as not accepted. A session
    /// without files, or a new-image session with more than one file, is
    /// rejected and unsealed before it is detached, so the caller can still
    /// add files or abort it.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::BadRequest`] for the cases above or if another
    /// commit of the same session is in progress, [`CatalogError::Upload`] if
    /// the session does not exist for this owner, and otherwise the error
    /// that interrupted the commit.
    pub async fn commit(
        &self,
        session_id: SessionId,
        owner_id: &str,
    ) -> Result<CommitOutcome, CatalogError> {
        let session = self.registry.get(session_id, owner_id)?;
        let Some(files) = session.seal() else {
            if session.is_finalized() {
                return Err(UploadError::SessionNotFound(session_id).into());
            }
            return Err(CatalogError::BadRequest(
                "upload session is already being committed".to_string(),
            ));
        };
        if let Err(error) = check_file_count(session.intent(), files) {
            session.unseal();
            return Err(error);
        }

        let session = self.registry.remove(session_id, owner_id)?;
        let committer = Committer::user(owner_id);
        let result = match session.intent().clone() {
            UploadIntent::NewBook(draft) => self.commit_new_book(&session, draft, &committer).await,
            UploadIntent::AppendPages { book_id } => {
                self.commit_pages(&session, &book_id, &committer).await
            }
            UploadIntent::NewImage(draft) => {
                self.commit_new_image(&session, draft, &committer).await
            }
        };

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    session_id = %session_id,
                    owner_id,
                    entity_id = outcome.entity_id(),
                    files,
                    "Upload session committed"
                );
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    owner_id,
                    intent = session.intent().name(),
                    staged = ?session.staged_paths(),
                    %error,
                    "Upload commit failed"
                );
            }
        }
        session.dispose();
        result
    }

    async fn commit_new_book(
        &self,
        session: &UploadSession,
        draft: BookDraft,
        committer: &Committer,
    ) -> Result<CommitOutcome, CatalogError> {
        let book_id = uuid::Uuid::now_v7().to_string();
        let guard = self.books.lock(&book_id).await;

        let stored = self
            .store_files(session, |index| Book::page_blob_name(&book_id, index))
            .await?;
        let mut book = Book::new(book_id.clone(), draft, &committer.id, self.clock.now());
        book.pages = pages(&stored);

        if let Err(error) = self.books.insert_locked(&guard, &book, committer).await {
            self.discard(&stored).await;
            return Err(error);
        }
        Ok(CommitOutcome::Book(book))
    }

    async fn commit_pages(
        &self,
        session: &UploadSession,
        book_id: &str,
        committer: &Committer,
    ) -> Result<CommitOutcome, CatalogError> {
        let guard = self.books.lock(book_id).await;
        let first_index = self.books.get(book_id).await?.pages.len();

        let stored = self
            .store_files(session, |index| {
                Book::page_blob_name(book_id, first_index + index)
            })
            .await?;
        let appended = pages(&stored);

        let updated = self
            .books
            .update_locked(
                &guard,
                committer,
                Some(format!("appended {} pages", appended.len())),
                move |book| book.pages.extend(appended),
            )
            .await;
        match updated {
            Ok(book) => Ok(CommitOutcome::Book(book)),
            Err(error) => {
                self.discard(&stored).await;
                Err(error)
            }
        }
    }

    async fn commit_new_image(
        &self,
        session: &UploadSession,
        draft: ImageDraft,
        committer: &Committer,
    ) -> Result<CommitOutcome, CatalogError> {
        let image_id = uuid::Uuid::now_v7().to_string();
        let guard = self.images.lock(&image_id).await;

        let stored = self
            .store_files(session, |_| Image::blob_name_for(&image_id))
            .await?;
        let Some(file) = stored.first() else {
            return Err(CatalogError::BadRequest(
                "image upload session lost its file".to_string(),
            ));
        };
        let image = Image {
            id: image_id.clone(),
            title: draft.title,
            description: draft.description,
            uploader_id: committer.id.clone(),
            blob_name: file.blob_name.clone(),
            media_type: file.media_type.clone(),
            created_at: self.clock.now(),
        };

        if let Err(error) = self.images.insert_locked(&guard, &image, committer).await {
            self.discard(&stored).await;
            return Err(error);
        }
        Ok(CommitOutcome::Image(image))
    }

    /// Copies every staged file to the blob store, deleting what was written
    /// if any copy fails.
    async fn store_files<N>(
        &self,
        session: &UploadSession,
        blob_name: N,
    ) -> Result<Vec<StoredFile>, CatalogError>
    where
        N: Fn(usize) -> String + Send + Sync,
    {
        let mut stored = Vec::new();
        if let Err(error) = self.copy_files(session, &blob_name, &mut stored).await {
            self.discard(&stored).await;
            return Err(error);
        }
        Ok(stored)
    }

    async fn copy_files<N>(
        &self,
        session: &UploadSession,
        blob_name: &N,
        stored: &mut Vec<StoredFile>,
    ) -> Result<(), CatalogError>
    where
        N: Fn(usize) -> String + Send + Sync,
    {
        let files = session.files();
        futures::pin_mut!(files);

        while let Some(file) = files.next().await {
            let file = file.map_err(UploadError::from)?;
            let media_type = file.media_type().to_string();
            stored.push(StoredFile {
                blob_name: blob_name(stored.len()),
                media_type: media_type.clone(),
                original_name: file.name().map(str::to_string),
            });
            let name = &stored[stored.len() - 1].blob_name;
            self.books.blobs().write(name, file, &media_type).await?;
        }
        Ok(())
    }

    async fn discard(&self, stored: &[StoredFile]) {
        let names: Vec<String> = stored.iter().map(|file| file.blob_name.clone()).collect();
        if names.is_empty() {
            return;
        }
        if let Err(error) = self.books.blobs().delete(&names).await {
            tracing::warn!(%error, blobs = ?names, "Failed to delete blobs of a failed commit");
        }
    }
}

fn check_file_count(intent: &UploadIntent, files: usize) -> Result<(), CatalogError> {
    if files == 0 {
        return Err(CatalogError::BadRequest(
            "cannot commit an upload session without files".to_string(),
        ));
    }
    if matches!(intent, UploadIntent::NewImage(_)) && files != 1 {
        return Err(CatalogError::BadRequest(format!(
            "an image upload takes exactly one file, got {files}"
        )));
    }
    Ok(())
}

fn pages(stored: &[StoredFile]) -> Vec<Page> {
    stored
        .iter()
        .map(|file| Page {
            blob_name: file.blob_name.clone(),
            media_type: file.media_type.clone(),
            original_name: file.original_name.clone(),
        })
        .collect()
}
