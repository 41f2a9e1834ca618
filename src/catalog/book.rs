//! Books and their pages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;

/// One page of a book, stored as a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Permanent blob name.
    pub blob_name: String,
    /// Media type of the page image.
    pub media_type: String,
    /// File name supplied by the uploader.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_name: Option<String>,
}

/// Caller-supplied fields of a book created from an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDraft {
    /// Title of the book.
    pub title: String,
    /// Author, if known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub author: Option<String>,
}

impl BookDraft {
    /// Creates a draft with `title` and no author.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: None,
        }
    }

    /// Sets the author.
    #[must_use]
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }
}

/// A book in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    /// Identifier of the book.
    pub id: String,
    /// Title of the book.
    pub title: String,
    /// Author, if known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub author: Option<String>,
    /// Account that uploaded the book.
    pub uploader_id: String,
    /// Pages in reading order.
    pub pages: Vec<Page>,
    /// Time the book was created.
    pub created_at: DateTime<Utc>,
}

impl Book {
    /// Creates a book without pages.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        draft: BookDraft,
        uploader_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            title: draft.title,
            author: draft.author,
            uploader_id: uploader_id.into(),
            pages: Vec::new(),
            created_at,
        }
    }

    /// Permanent blob name of page `index` of book `book_id`.
    #[must_use]
    pub fn page_blob_name(book_id: &str, index: usize) -> String {
        format!("books/{book_id}/{index:04}")
    }
}

impl Entity for Book {
    const KIND: &'static str = "book";

    fn id(&self) -> &str {
        &self.id
    }

    fn blob_names(&self) -> Vec<String> {
        self.pages.iter().map(|page| page.blob_name.clone()).collect()
    }
}
