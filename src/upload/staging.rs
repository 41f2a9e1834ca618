//! Temporary storage for files that belong to an open session.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};

use super::UploadError;

// =============================================================================
// Staging Area
// =============================================================================

/// Directory that receives staged upload files.
#[derive(Debug, Clone)]
pub struct StagingArea {
    directory: PathBuf,
    max_file_bytes: u64,
}

impl StagingArea {
    /// Creates a staging area under `directory`.
    ///
    /// The directory is created on first use.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, max_file_bytes: u64) -> Self {
        Self {
            directory: directory.into(),
            max_file_bytes,
        }
    }

    /// Directory the staged files live in.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Largest accepted file size in bytes.
    #[must_use]
    pub const fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    /// Copies `stream` into a new temporary file.
    ///
    /// On any failure, and if the returned future is dropped before it
    /// completes, the partial temporary file is removed.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::FileTooLarge`] if the stream is longer than the
    /// configured limit and [`UploadError::Io`] if copying failed.
    pub async fn stage<S>(
        &self,
        name: Option<String>,
        stream: S,
        media_type: &str,
    ) -> Result<StagedFile, UploadError>
    where
        S: AsyncRead + Send + Unpin,
    {
        tokio::fs::create_dir_all(&self.directory).await?;
        let (file, path) = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(&self.directory)?
            .into_parts();

        let mut file = tokio::fs::File::from_std(file);
        let mut limited = stream.take(self.max_file_bytes.saturating_add(1));
        let size = tokio::io::copy(&mut limited, &mut file).await?;
        file.flush().await?;
        drop(file);

        if size > self.max_file_bytes {
            tracing::debug!(
                path = %path.display(),
                limit = self.max_file_bytes,
                "Discarding oversized upload"
            );
            return Err(UploadError::FileTooLarge {
                limit: self.max_file_bytes,
            });
        }

        tracing::debug!(path = %path.display(), size, media_type, "File staged");
        Ok(StagedFile {
            name,
            media_type: media_type.to_string(),
            size,
            path,
        })
    }
}

// =============================================================================
// Staged File
// =============================================================================

/// A file copied into the staging area.
///
/// The temporary file is deleted when this value is disposed or dropped.
#[derive(Debug)]
pub struct StagedFile {
    name: Option<String>,
    media_type: String,
    size: u64,
    path: TempPath,
}

impl StagedFile {
    /// The client-supplied file name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Media type given by the client.
    #[must_use]
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Size of the staged content in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Location of the temporary file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a fresh read handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the file could not be opened.
    pub async fn open(&self) -> io::Result<OpenedFile> {
        self.reference().open().await
    }

    pub(crate) fn reference(&self) -> StagedFileRef {
        StagedFileRef {
            name: self.name.clone(),
            media_type: self.media_type.clone(),
            size: self.size,
            path: self.path.to_path_buf(),
        }
    }

    /// Deletes the temporary file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file could not be removed.
    pub fn dispose(self) -> io::Result<()> {
        self.path.close()
    }
}

/// Detached description of a staged file, used to open it later.
#[derive(Debug, Clone)]
pub(crate) struct StagedFileRef {
    name: Option<String>,
    media_type: String,
    size: u64,
    path: PathBuf,
}

impl StagedFileRef {
    pub(crate) async fn open(self) -> io::Result<OpenedFile> {
        let reader = tokio::fs::File::open(&self.path).await?;
        Ok(OpenedFile {
            name: self.name,
            media_type: self.media_type,
            size: self.size,
            reader,
        })
    }
}

// =============================================================================
// Opened File
// =============================================================================

/// A read handle over a staged file.
#[derive(Debug)]
pub struct OpenedFile {
    name: Option<String>,
    media_type: String,
    size: u64,
    reader: tokio::fs::File,
}

impl OpenedFile {
    /// The client-supplied file name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Media type given by the client.
    #[must_use]
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Size of the staged content in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

impl AsyncRead for OpenedFile {
    fn poll_read(
        self: Pin<&mut Self>,
        context: &mut Context<'_>,
        buffer: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(context, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn area(directory: &tempfile::TempDir, limit: u64) -> StagingArea {
        StagingArea::new(directory.path().join("staging"), limit)
    }

    #[rstest]
    #[tokio::test]
    async fn stage_copies_stream_into_temp_file() {
        let directory = tempfile::tempdir().unwrap();
        let staging = area(&directory, 1024);

        let staged = staging
            .stage(Some("cover.png".into()), &b"png-bytes"[..], "image/png")
            .await
            .unwrap();

        assert_eq!(staged.size(), 9);
        assert_eq!(staged.name(), Some("cover.png"));
        assert!(staged.path().starts_with(staging.directory()));

        let mut opened = staged.open().await.unwrap();
        let mut content = Vec::new();
        opened.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"png-bytes");
        assert_eq!(opened.media_type(), "image/png");
    }

    #[rstest]
    #[tokio::test]
    async fn oversized_stream_is_rejected_and_removed() {
        let directory = tempfile::tempdir().unwrap();
        let staging = area(&directory, 4);

        let result = staging.stage(None, &b"12345"[..], "text/plain").await;

        assert!(matches!(result, Err(UploadError::FileTooLarge { limit: 4 })));
        let mut entries = std::fs::read_dir(staging.directory()).unwrap();
        assert!(entries.next().is_none());
    }

    #[rstest]
    #[tokio::test]
    async fn stream_at_the_limit_is_accepted() {
        let directory = tempfile::tempdir().unwrap();
        let staging = area(&directory, 4);

        let staged = staging.stage(None, &b"1234"[..], "text/plain").await.unwrap();

        assert_eq!(staged.size(), 4);
    }

    #[rstest]
    #[tokio::test]
    async fn dispose_and_drop_delete_the_file() {
        let directory = tempfile::tempdir().unwrap();
        let staging = area(&directory, 1024);
        let disposed = staging.stage(None, &b"a"[..], "text/plain").await.unwrap();
        let dropped = staging.stage(None, &b"b"[..], "text/plain").await.unwrap();
        let disposed_path = disposed.path().to_path_buf();
        let dropped_path = dropped.path().to_path_buf();

        disposed.dispose().unwrap();
        drop(dropped);

        assert!(!disposed_path.exists());
        assert!(!dropped_path.exists());
    }

    #[rstest]
    #[tokio::test]
    async fn dropped_stage_removes_partial_file() {
        let directory = tempfile::tempdir().unwrap();
        let staging = area(&directory, 1024);
        let entries = || std::fs::read_dir(staging.directory()).map_or(0, |entries| entries.count());
        let (mut client, body) = tokio::io::duplex(64);
        client.write_all(b"partial").await.unwrap();

        let mut pending = Box::pin(staging.stage(None, body, "text/plain"));
        tokio::select! {
            result = &mut pending => panic!("stage finished with an open stream: {result:?}"),
            () = async {
                while entries() == 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
            } => {}
        }
        assert_eq!(entries(), 1);

        drop(pending);

        assert_eq!(entries(), 0);
        drop(client);
    }
}
