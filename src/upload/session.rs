//! A single upload session and its staged files.

use std::fmt;
use std::io;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::catalog::{BookDraft, ImageDraft};
use crate::clock::Clock;

use super::UploadError;
use super::staging::{OpenedFile, StagedFile, StagingArea};

// =============================================================================
// Session ID
// =============================================================================

/// Identifier of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Generates a new random identifier (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(value).map(Self)
    }
}

// =============================================================================
// Upload Intent
// =============================================================================

/// What the caller intends to create when the session is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadIntent {
    /// Create a new book whose pages are the uploaded files.
    NewBook(BookDraft),
    /// Append the uploaded files as pages of an existing book.
    AppendPages {
        /// Book receiving the pages.
        book_id: String,
    },
    /// Create a new image from exactly one uploaded file.
    NewImage(ImageDraft),
}

impl UploadIntent {
    /// Returns the snake-case name used on the wire and in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NewBook(_) => "new_book",
            Self::AppendPages { .. } => "append_pages",
            Self::NewImage(_) => "new_image",
        }
    }
}

// =============================================================================
// Upload Session
// =============================================================================

#[derive(Debug)]
struct SessionState {
    last_update: DateTime<Utc>,
    sealed: bool,
    finalized: bool,
    files: Vec<StagedFile>,
}

impl SessionState {
    const fn accepts_uploads(&self) -> bool {
        !self.sealed && !self.finalized
    }
}

/// Server-side staging of files across requests before one commit.
///
/// Staging is guarded by a per-session lock: files are only ever appended,
/// and readers see a snapshot of the list taken when they start.
#[derive(Debug)]
pub struct UploadSession {
    id: SessionId,
    owner_id: String,
    start_time: DateTime<Utc>,
    intent: UploadIntent,
    clock: Arc<dyn Clock>,
    staging: Arc<StagingArea>,
    state: Mutex<SessionState>,
}

impl UploadSession {
    pub(crate) fn new(
        owner_id: String,
        intent: UploadIntent,
        clock: Arc<dyn Clock>,
        staging: Arc<StagingArea>,
    ) -> Self {
        let now = clock.now();
        Self {
            id: SessionId::generate(),
            owner_id,
            start_time: now,
            intent,
            clock,
            staging,
            state: Mutex::new(SessionState {
                last_update: now,
                sealed: false,
                finalized: false,
                files: Vec::new(),
            }),
        }
    }

    /// Identifier of this session.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Account that opened the session.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Time the session was opened.
    #[must_use]
    pub const fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// What the session will create when committed.
    #[must_use]
    pub const fn intent(&self) -> &UploadIntent {
        &self.intent
    }

    /// Time of the last add, count or enumeration.
    #[must_use]
    pub fn last_update_time(&self) -> DateTime<Utc> {
        self.state.lock().last_update
    }

    /// Returns `true` once the session has been disposed.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }

    /// Returns `true` while a commit holds the session closed to uploads.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    /// Returns `true` if the session has been idle for longer than `timeout`
    /// at `now`. A sealed session never expires.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: TimeDelta) -> bool {
        let state = self.state.lock();
        !state.sealed && now - state.last_update > timeout
    }

    /// Closes the session to new uploads and returns the number of staged
    /// files, which stays fixed until [`unseal`](Self::unseal) or disposal.
    ///
    /// Returns `None` if the session is already sealed or finalized.
    pub(crate) fn seal(&self) -> Option<usize> {
        let mut state = self.state.lock();
        if !state.accepts_uploads() {
            return None;
        }
        state.sealed = true;
        self.touch(&mut state);
        Some(state.files.len())
    }

    /// Reopens a sealed session to uploads.
    pub(crate) fn unseal(&self) {
        let mut state = self.state.lock();
        state.sealed = false;
        self.touch(&mut state);
    }

    fn touch(&self, state: &mut SessionState) {
        let now = self.clock.now();
        if now > state.last_update {
            state.last_update = now;
        }
    }

    /// Copies `stream` into a new staged file and appends it.
    ///
    /// Returns `false` if the session was sealed for a commit or finalized
    /// before the file could be appended; the file is then discarded.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::FileTooLarge`] or [`UploadError::Io`] if
    /// staging failed. The partial file has been removed by then.
    pub async fn add_file<S>(
        &self,
        name: Option<String>,
        stream: S,
        media_type: &str,
    ) -> Result<bool, UploadError>
    where
        S: AsyncRead + Send + Unpin,
    {
        {
            let mut state = self.state.lock();
            if !state.accepts_uploads() {
                tracing::warn!(session_id = %self.id, "Upload into closed session ignored");
                return Ok(false);
            }
            self.touch(&mut state);
        }

        let staged = self.staging.stage(name, stream, media_type).await?;

        let rejected = {
            let mut state = self.state.lock();
            if !state.accepts_uploads() {
                Some(staged)
            } else {
                self.touch(&mut state);
                state.files.push(staged);
                None
            }
        };

        match rejected {
            None => Ok(true),
            Some(staged) => {
                tracing::warn!(
                    session_id = %self.id,
                    path = %staged.path().display(),
                    "Session closed during upload, discarding file"
                );
                discard(staged);
                Ok(false)
            }
        }
    }

    /// Returns the number of staged files.
    pub fn file_count(&self) -> usize {
        let mut state = self.state.lock();
        self.touch(&mut state);
        state.files.len()
    }

    /// Paths of the staged temporary files. Does not touch the session.
    #[must_use]
    pub fn staged_paths(&self) -> Vec<std::path::PathBuf> {
        self.state
            .lock()
            .files
            .iter()
            .map(|staged| staged.path().to_path_buf())
            .collect()
    }

    /// Enumerates the staged files in upload order.
    ///
    /// The list is captured when this method is called. Every element opens
    /// a fresh read handle, so the files can be enumerated repeatedly.
    pub fn files(&self) -> impl Stream<Item = io::Result<OpenedFile>> + Send + use<> {
        let references: Vec<_> = {
            let mut state = self.state.lock();
            self.touch(&mut state);
            state.files.iter().map(StagedFile::reference).collect()
        };
        stream::iter(references).then(|reference| reference.open())
    }

    /// Finalizes the session and deletes every staged file.
    ///
    /// Returns the number of files deleted. Calling this again is a no-op.
    pub fn dispose(&self) -> usize {
        let files = {
            let mut state = self.state.lock();
            state.finalized = true;
            std::mem::take(&mut state.files)
        };
        let count = files.len();
        for staged in files {
            discard(staged);
        }
        if count > 0 {
            tracing::debug!(session_id = %self.id, files = count, "Session disposed");
        }
        count
    }
}

fn discard(staged: StagedFile) {
    let path = staged.path().to_path_buf();
    if let Err(error) = staged.dispose() {
        tracing::warn!(path = %path.display(), %error, "Failed to delete staged file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures::TryStreamExt;
    use rstest::rstest;
    use tokio::io::AsyncReadExt;

    fn session(directory: &tempfile::TempDir, clock: &ManualClock) -> UploadSession {
        UploadSession::new(
            "u1".to_string(),
            UploadIntent::AppendPages {
                book_id: "b1".to_string(),
            },
            Arc::new(clock.clone()),
            Arc::new(StagingArea::new(directory.path(), 1024)),
        )
    }

    async fn read_all(mut file: OpenedFile) -> Vec<u8> {
        let mut content = Vec::new();
        file.read_to_end(&mut content).await.unwrap();
        content
    }

    #[rstest]
    #[tokio::test]
    async fn files_are_enumerated_in_upload_order_repeatedly() {
        let directory = tempfile::tempdir().unwrap();
        let session = session(&directory, &ManualClock::default());
        for content in [&b"one"[..], &b"two"[..]] {
            assert!(session.add_file(None, content, "text/plain").await.unwrap());
        }

        for _ in 0..2 {
            let opened: Vec<OpenedFile> = session.files().try_collect().await.unwrap();
            let mut contents = Vec::new();
            for file in opened {
                contents.push(read_all(file).await);
            }
            assert_eq!(contents, vec![b"one".to_vec(), b"two".to_vec()]);
        }
    }

    #[rstest]
    #[tokio::test]
    async fn reads_and_adds_touch_last_update() {
        let directory = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let session = session(&directory, &clock);

        clock.advance(TimeDelta::seconds(10));
        assert_eq!(session.file_count(), 0);
        assert_eq!(session.last_update_time(), clock.now());

        clock.advance(TimeDelta::seconds(10));
        session.add_file(None, &b"x"[..], "text/plain").await.unwrap();
        assert_eq!(session.last_update_time(), clock.now());
        assert_eq!(session.start_time(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[rstest]
    #[tokio::test]
    async fn expiry_is_measured_from_last_update() {
        let directory = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let session = session(&directory, &clock);
        let timeout = TimeDelta::seconds(60);

        clock.advance(TimeDelta::seconds(60));
        assert!(!session.is_expired(clock.now(), timeout));

        clock.advance(TimeDelta::seconds(1));
        assert!(session.is_expired(clock.now(), timeout));
    }

    #[rstest]
    #[tokio::test]
    async fn dispose_deletes_files_and_rejects_late_uploads() {
        let directory = tempfile::tempdir().unwrap();
        let session = session(&directory, &ManualClock::default());
        session.add_file(None, &b"x"[..], "text/plain").await.unwrap();
        session.add_file(None, &b"y"[..], "text/plain").await.unwrap();

        assert_eq!(session.dispose(), 2);
        assert_eq!(session.dispose(), 0);

        let accepted = session.add_file(None, &b"z"[..], "text/plain").await.unwrap();
        assert!(!accepted);
        assert!(session.is_finalized());
        assert_eq!(session.file_count(), 0);
        assert_eq!(std::fs::read_dir(directory.path()).unwrap().count(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn sealed_session_keeps_its_files_and_rejects_uploads() {
        let directory = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let session = session(&directory, &clock);
        session.add_file(None, &b"kept"[..], "text/plain").await.unwrap();

        assert_eq!(session.seal(), Some(1));
        assert_eq!(session.seal(), None);

        let accepted = session.add_file(None, &b"late"[..], "text/plain").await.unwrap();
        assert!(!accepted);
        assert!(session.is_sealed());
        assert_eq!(session.file_count(), 1);
        assert_eq!(std::fs::read_dir(directory.path()).unwrap().count(), 1);

        let opened: Vec<OpenedFile> = session.files().try_collect().await.unwrap();
        assert_eq!(opened.len(), 1);
        assert_eq!(read_all(opened.into_iter().next().unwrap()).await, b"kept".to_vec());

        clock.advance(TimeDelta::hours(2));
        assert!(!session.is_expired(clock.now(), TimeDelta::seconds(60)));

        session.unseal();
        assert!(session.add_file(None, &b"again"[..], "text/plain").await.unwrap());
        assert_eq!(session.file_count(), 2);
    }

    #[rstest]
    fn upload_intent_is_tagged() {
        let intent = UploadIntent::AppendPages {
            book_id: "b1".to_string(),
        };
        let json = serde_json::to_value(&intent).unwrap();

        assert_eq!(json["type"], "append_pages");
        assert_eq!(json["book_id"], "b1");
        assert_eq!(intent.name(), "append_pages");
    }
}
