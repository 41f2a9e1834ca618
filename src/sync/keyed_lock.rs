//! Keyed asynchronous mutual exclusion.
//!
//! This module provides `KeyedLock`, a lock manager that grants at most one
//! concurrent holder per key while letting unrelated keys proceed in
//! parallel. Entries are created on first use and removed as soon as no
//! holder or waiter remains, so the table never grows with the number of
//! distinct keys ever seen.
//!
//! # Design
//!
//! - A single short critical section (`parking_lot::Mutex`) guards the key
//!   table. It is never held across an `.await`.
//! - Each entry owns a `tokio::sync::Mutex<()>`, which queues waiters in FIFO
//!   order. Waiting on it is the only place a caller suspends.
//! - Each entry carries a reference count of holders plus waiters. A caller
//!   that registered always releases exactly once, either through the guard
//!   or when its pending acquisition is dropped.
//! - Released mutexes are recycled through a bounded pool to avoid repeated
//!   allocation under high key churn.
//!
//! # Cancellation
//!
//! Dropping the future returned by [`KeyedLock::acquire`] cancels the wait.
//! [`KeyedLock::acquire_timeout`] and [`KeyedLock::acquire_until`] report the
//! cancellation as a [`LockError`]. In every case the reference taken at
//! registration is returned.
//!
//! # Reentrancy
//!
//! Acquiring a key that the same task already holds deadlocks.
//!
//! # Examples
//!
//! ```rust,ignore
//! use catalog_core::sync::KeyedLock;
//!
//! let locks = KeyedLock::<String>::new();
//! let guard = locks.acquire("book-42".to_string()).await;
//! // read-modify-write book-42
//! drop(guard);
//! assert_eq!(locks.active_keys(), 0);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Default number of idle mutexes kept for reuse.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

// =============================================================================
// Error Types
// =============================================================================

/// Errors reported by bounded or cancellable lock acquisition.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The cancellation signal fired before the lock was granted.
    #[error("lock acquisition was cancelled")]
    Cancelled,

    /// The lock was not granted within the given duration.
    #[error("lock acquisition timed out after {0:?}")]
    TimedOut(Duration),
}

// =============================================================================
// Lock Table
// =============================================================================

type SharedMutex = Arc<AsyncMutex<()>>;

struct LockEntry {
    mutex: SharedMutex,
    /// Holders plus waiters. Never zero while the entry is in the table.
    references: usize,
}

struct LockTable<K> {
    entries: HashMap<K, LockEntry>,
    pool: Vec<SharedMutex>,
    pool_capacity: usize,
}

impl<K: Eq + Hash + Clone> LockTable<K> {
    fn new(pool_capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            pool: Vec::with_capacity(pool_capacity.min(DEFAULT_POOL_CAPACITY)),
            pool_capacity,
        }
    }

    /// Takes one reference on `key`, creating the entry when absent.
    fn register(&mut self, key: &K) -> SharedMutex {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.references += 1;
            return Arc::clone(&entry.mutex);
        }

        let mutex = self
            .pool
            .pop()
            .unwrap_or_else(|| Arc::new(AsyncMutex::new(())));
        self.entries.insert(
            key.clone(),
            LockEntry {
                mutex: Arc::clone(&mutex),
                references: 1,
            },
        );
        mutex
    }

    /// Returns one reference on `key`, reclaiming the entry at zero.
    ///
    /// # Panics
    ///
    /// Panics if `key` has no entry or its count is already zero. Both mean a
    /// release without a matching registration.
    fn release(&mut self, key: &K) {
        let Some(entry) = self.entries.get_mut(key) else {
            panic!("keyed lock released a key that has no entry");
        };
        assert!(
            entry.references > 0,
            "keyed lock reference count underflow"
        );
        entry.references -= 1;
        if entry.references > 0 {
            return;
        }

        let Some(entry) = self.entries.remove(key) else {
            panic!("keyed lock entry vanished during release");
        };
        // Only recycle a mutex nobody else still points at.
        if self.pool.len() < self.pool_capacity && Arc::strong_count(&entry.mutex) == 1 {
            self.pool.push(entry.mutex);
        }
    }
}

/// One registered reference on a key. Dropping it releases the reference.
struct Registration<K: Eq + Hash + Clone> {
    table: Arc<Mutex<LockTable<K>>>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for Registration<K> {
    fn drop(&mut self) {
        self.table.lock().release(&self.key);
    }
}

// =============================================================================
// KeyedLockGuard
// =============================================================================

/// Proof of exclusive access to one key.
///
/// The lock is released when the guard is dropped, on every exit path.
pub struct KeyedLockGuard<K: Eq + Hash + Clone> {
    // Field order matters: the mutex is unlocked before the reference is
    // returned, so a recycled mutex is never handed out while locked.
    permit: OwnedMutexGuard<()>,
    registration: Registration<K>,
}

impl<K: Eq + Hash + Clone> KeyedLockGuard<K> {
    /// Returns the key this guard holds.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.registration.key
    }
}

impl<K: Eq + Hash + Clone + fmt::Debug> fmt::Debug for KeyedLockGuard<K> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("KeyedLockGuard")
            .field("key", &self.registration.key)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// KeyedLock
// =============================================================================

/// A lock manager granting at most one holder per key.
///
/// Cloning is cheap and yields a handle to the same table, so one instance
/// can be constructed at startup and passed to every consumer.
pub struct KeyedLock<K> {
    table: Arc<Mutex<LockTable<K>>>,
}

impl<K> Clone for KeyedLock<K> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<K: Eq + Hash + Clone> fmt::Debug for KeyedLock<K> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        formatter
            .debug_struct("KeyedLock")
            .field("active_keys", &table.entries.len())
            .field("pooled", &table.pool.len())
            .field("pool_capacity", &table.pool_capacity)
            .finish()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    /// Creates a lock manager with [`DEFAULT_POOL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_pool_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Creates a lock manager keeping at most `pool_capacity` idle mutexes.
    ///
    /// A capacity of zero disables recycling.
    #[must_use]
    pub fn with_pool_capacity(pool_capacity: usize) -> Self {
        Self {
            table: Arc::new(Mutex::new(LockTable::new(pool_capacity))),
        }
    }

    fn register(&self, key: K) -> (SharedMutex, Registration<K>) {
        let mutex = self.table.lock().register(&key);
        let registration = Registration {
            table: Arc::clone(&self.table),
            key,
        };
        (mutex, registration)
    }

    /// Waits until `key` is free and returns a guard holding it.
    ///
    /// Waiters on the same key are served in FIFO order. Dropping the
    /// returned future before it completes cancels the wait without leaking
    /// a table entry.
    pub async fn acquire(&self, key: K) -> KeyedLockGuard<K> {
        let (mutex, registration) = self.register(key);
        let permit = mutex.lock_owned().await;
        KeyedLockGuard {
            permit,
            registration,
        }
    }

    /// Like [`acquire`](Self::acquire), giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::TimedOut`] if the key was not granted in time.
    pub async fn acquire_timeout(
        &self,
        key: K,
        timeout: Duration,
    ) -> Result<KeyedLockGuard<K>, LockError> {
        tokio::time::timeout(timeout, self.acquire(key))
            .await
            .map_err(|_| LockError::TimedOut(timeout))
    }

    /// Like [`acquire`](Self::acquire), giving up when `cancel` completes.
    ///
    /// If both are ready at the same time the lock wins, so a granted lock is
    /// never thrown away.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Cancelled`] if `cancel` resolved first.
    pub async fn acquire_until<C>(&self, key: K, cancel: C) -> Result<KeyedLockGuard<K>, LockError>
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            guard = self.acquire(key) => Ok(guard),
            () = cancel => Err(LockError::Cancelled),
        }
    }

    /// Takes `key` only if it is free right now.
    #[must_use]
    pub fn try_acquire(&self, key: K) -> Option<KeyedLockGuard<K>> {
        let (mutex, registration) = self.register(key);
        mutex.try_lock_owned().ok().map(|permit| KeyedLockGuard {
            permit,
            registration,
        })
    }

    /// Returns the number of keys with at least one holder or waiter.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Returns the number of idle mutexes waiting for reuse.
    #[must_use]
    pub fn pooled(&self) -> usize {
        self.table.lock().pool.len()
    }

    /// Returns the maximum number of idle mutexes kept for reuse.
    #[must_use]
    pub fn pool_capacity(&self) -> usize {
        self.table.lock().pool_capacity
    }
}

static_assertions::assert_impl_all!(KeyedLock<String>: Send, Sync, Clone);
static_assertions::assert_impl_all!(KeyedLockGuard<String>: Send, Sync);
