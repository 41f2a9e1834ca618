//! Standalone images.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;

/// Caller-supplied fields of an image created from an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDraft {
    /// Title of the image.
    pub title: String,
    /// Free-form description.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
}

impl ImageDraft {
    /// Creates a draft with `title` and no description.
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
        }
    }
}

/// An image in the catalog, backed by exactly one blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Identifier of the image.
    pub id: String,
    /// Title of the image.
    pub title: String,
    /// Free-form description.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    /// Account that uploaded the image.
    pub uploader_id: String,
    /// Blob holding the image data.
    pub blob_name: String,
    /// Media type of the image data.
    pub media_type: String,
    /// Time the image was created.
    pub created_at: DateTime<Utc>,
}

impl Image {
    /// Permanent blob name of image `image_id`.
    #[must_use]
    pub fn blob_name_for(image_id: &str) -> String {
        format!("images/{image_id}")
    }
}

impl Entity for Image {
    const KIND: &'static str = "image";

    fn id(&self) -> &str {
        &self.id
    }

    fn blob_names(&self) -> Vec<String> {
        vec![self.blob_name.clone()]
    }
}
