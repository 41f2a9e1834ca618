//! Staged multi-file upload sessions.
//!
//! A client opens an [`UploadSession`] through the [`UploadRegistry`],
//! streams files into temporary storage over several requests and finally
//! commits or aborts. Sessions left idle past the configured timeout are
//! reclaimed by the registry's background sweeper.
//!
//! # Ownership
//!
//! The registry owns every session until it is removed. Each session owns
//! its staged temporary files; they are deleted when the session is
//! disposed or dropped.

use thiserror::Error;

mod registry;
mod session;
mod staging;

pub use registry::{MIN_SWEEP_INTERVAL, SweeperHandle, UploadLimits, UploadRegistry};
pub use session::{SessionId, UploadIntent, UploadSession};
pub use staging::{OpenedFile, StagedFile, StagingArea};

/// Errors raised by upload sessions.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The owner already has the maximum number of open sessions.
    #[error("Owner {owner_id} already has {limit} open upload sessions")]
    QuotaExceeded {
        /// Owner whose quota is exhausted.
        owner_id: String,
        /// Maximum concurrent sessions per owner.
        limit: usize,
    },

    /// No session with this id exists for the caller.
    #[error("Upload session not found: {0}")]
    SessionNotFound(SessionId),

    /// A staged file exceeded the per-file size limit.
    #[error("Uploaded file exceeds the limit of {limit} bytes")]
    FileTooLarge {
        /// Largest accepted file size in bytes.
        limit: u64,
    },

    /// Copying into temporary storage failed.
    #[error("Staging I/O error: {0}")]
    Io(#[from] std::io::Error),
}
