//! In-process mutual exclusion.
//!
//! - [`KeyLock`]: a blocking lock with a non-blocking `try_acquire`.
//! - [`LockGuard`]: releases its lock on drop.
//! - [`KeyLocks`]: hands out one `KeyLock` per key, lazily.
//!
//! These only serialize work inside one process. Cross-process exclusion
//! comes from the storage contract (`insert_if_absent`, `compare_and_swap`).

mod error;
mod key_lock;
mod manager;

pub use error::LockError;
pub use key_lock::{KeyLock, LockGuard};
pub use manager::KeyLocks;
