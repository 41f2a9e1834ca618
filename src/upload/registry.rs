//! Process-wide registry of open upload sessions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::TimeDelta;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;

use super::UploadError;
use super::session::{SessionId, UploadIntent, UploadSession};
use super::staging::StagingArea;

// =============================================================================
// Limits
// =============================================================================

/// Shortest period the background sweep runs at.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Quotas and timings applied by an [`UploadRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    /// Maximum number of concurrently open sessions per owner.
    pub max_sessions_per_owner: usize,
    /// Idle time after which a session is reclaimed.
    pub session_timeout: Duration,
    /// Period of the background expiry sweep, raised to
    /// [`MIN_SWEEP_INTERVAL`] if shorter.
    pub sweep_interval: Duration,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_sessions_per_owner: 4,
            session_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Upload Registry
// =============================================================================

/// Map of session id to session, guarded by one critical section.
///
/// Registration, removal and the per-owner quota check all happen under the
/// same lock, so a session is removed (and therefore disposed) by exactly
/// one path: commit, abort or expiry.
///
/// # Example
///
/// ```rust,ignore
/// let registry = Arc::new(UploadRegistry::new(limits, staging, clock));
/// let _sweeper = registry.spawn_sweeper();
///
/// let session = registry.open("user-1", UploadIntent::NewBook(draft))?;
/// session.add_file(Some("p1.png".into()), stream, "image/png").await?;
/// ```
#[derive(Debug)]
pub struct UploadRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<UploadSession>>>,
    limits: UploadLimits,
    session_timeout: TimeDelta,
    staging: Arc<StagingArea>,
    clock: Arc<dyn Clock>,
}

impl UploadRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(limits: UploadLimits, staging: StagingArea, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            limits,
            session_timeout: TimeDelta::from_std(limits.session_timeout)
                .unwrap_or(TimeDelta::MAX),
            staging: Arc::new(staging),
            clock,
        }
    }

    /// Quotas and timings this registry enforces.
    #[must_use]
    pub const fn limits(&self) -> UploadLimits {
        self.limits
    }

    /// Staging area shared by every session.
    #[must_use]
    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Opens a new session for `owner_id`.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::QuotaExceeded`] if the owner already has the
    /// maximum number of open sessions.
    pub fn open(
        &self,
        owner_id: &str,
        intent: UploadIntent,
    ) -> Result<Arc<UploadSession>, UploadError> {
        let session = {
            let mut sessions = self.sessions.lock();
            let open = sessions
                .values()
                .filter(|session| session.owner_id() == owner_id)
                .count();
            if open >= self.limits.max_sessions_per_owner {
                return Err(UploadError::QuotaExceeded {
                    owner_id: owner_id.to_string(),
                    limit: self.limits.max_sessions_per_owner,
                });
            }

            let session = Arc::new(UploadSession::new(
                owner_id.to_string(),
                intent,
                Arc::clone(&self.clock),
                Arc::clone(&self.staging),
            ));
            sessions.insert(session.id(), Arc::clone(&session));
            session
        };

        tracing::info!(
            session_id = %session.id(),
            owner_id,
            intent = session.intent().name(),
            "Upload session opened"
        );
        Ok(session)
    }

    /// Returns session `id` if it is owned by `owner_id`.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::SessionNotFound`] if the session does not exist
    /// or belongs to someone else.
    pub fn get(&self, id: SessionId, owner_id: &str) -> Result<Arc<UploadSession>, UploadError> {
        self.sessions
            .lock()
            .get(&id)
            .filter(|session| session.owner_id() == owner_id)
            .cloned()
            .ok_or(UploadError::SessionNotFound(id))
    }

    /// Detaches session `id` without disposing it.
    ///
    /// The caller becomes the sole owner of the session and must dispose it
    /// once it has finished with the staged files.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::SessionNotFound`] if the session does not exist,
    /// belongs to someone else, or was already removed.
    pub fn remove(&self, id: SessionId, owner_id: &str) -> Result<Arc<UploadSession>, UploadError> {
        let mut sessions = self.sessions.lock();
        match sessions.get(&id) {
            Some(session) if session.owner_id() == owner_id => {}
            _ => return Err(UploadError::SessionNotFound(id)),
        }
        sessions.remove(&id).ok_or(UploadError::SessionNotFound(id))
    }

    /// Removes session `id` and deletes its staged files.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::SessionNotFound`] under the same conditions as
    /// [`remove`](Self::remove).
    pub fn abort(&self, id: SessionId, owner_id: &str) -> Result<(), UploadError> {
        let session = self.remove(id, owner_id)?;
        let files = session.dispose();
        tracing::info!(session_id = %id, owner_id, files, "Upload session aborted");
        Ok(())
    }

    /// Removes and disposes every session idle for longer than the timeout.
    ///
    /// Returns the number of sessions reclaimed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<Arc<UploadSession>> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<SessionId> = sessions
                .values()
                .filter(|session| session.is_expired(now, self.session_timeout))
                .map(|session| session.id())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &expired {
            let files = session.dispose();
            tracing::info!(
                session_id = %session.id(),
                owner_id = session.owner_id(),
                files,
                "Upload session expired"
            );
        }
        expired.len()
    }

    /// Number of open sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns `true` if no session is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Number of open sessions owned by `owner_id`.
    #[must_use]
    pub fn sessions_for(&self, owner_id: &str) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|session| session.owner_id() == owner_id)
            .count()
    }

    /// Starts the background expiry sweep on the current tokio runtime.
    ///
    /// The task only holds a weak reference to the registry and stops on its
    /// own once the registry is dropped.
    #[must_use = "dropping the handle stops the sweeper"]
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let registry = Arc::downgrade(self);
        let period = self.limits.sweep_interval.max(MIN_SWEEP_INTERVAL);
        if period != self.limits.sweep_interval {
            tracing::warn!(
                configured = ?self.limits.sweep_interval,
                interval = ?period,
                "Upload sweep interval too short, using the minimum"
            );
        }
        let task = tokio::spawn(run_sweeper(registry, period));
        tracing::debug!(interval = ?period, "Upload sweeper started");
        SweeperHandle { task }
    }
}

async fn run_sweeper(registry: Weak<UploadRegistry>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        let reclaimed = registry.sweep_expired();
        if reclaimed > 0 {
            tracing::debug!(reclaimed, "Upload sweep finished");
        }
    }
}

// =============================================================================
// Sweeper Handle
// =============================================================================

/// Handle of the background sweep task. Dropping it stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stops the sweeper and waits until it has exited.
    pub async fn shutdown(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }

    /// Returns `true` if the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
