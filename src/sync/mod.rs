//! Synchronization primitives shared by every mutating operation.
//!
//! - [`KeyedLock`]: one holder per key, FIFO per key, no per-key allocation
//!   outliving its last user.

mod keyed_lock;

pub use keyed_lock::{DEFAULT_POOL_CAPACITY, KeyedLock, KeyedLockGuard, LockError};
