//! Key-value store interface and implementations.
//!
//! Provides a trait-based KV store interface with an in-memory implementation
//! for testing and a redb-based implementation for persistence.
//!
//! Every write goes through a conditional batch: a [`Batch`] carries
//! per-key expectations that are checked and applied in one atomic step.
//! Callers use them for optimistic concurrency control.

pub mod batch;
pub mod memory;
pub mod redb;

use std::fmt;
use thiserror::Error;

pub use batch::{Batch, Expect, Op};

/// Errors that can occur in KV store operations.
#[derive(Error, Debug)]
pub enum KVError {
    #[error("kv: storage error: {0}")]
    Storage(String),

    /// The backend could not be reached right now (I/O failure, database
    /// held by another process). Safe to retry outside a transaction.
    #[error("kv: storage unavailable: {0}")]
    Unavailable(String),

    /// A batch expectation did not hold; nothing was written.
    #[error("kv: precondition failed on key {0:?}")]
    Conflict(String),
}

impl KVError {
    /// Reports whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, KVError::Unavailable(_))
    }
}

/// Result type for KV operations.
pub type KVResult<T> = Result<T, KVError>;

/// Key-value store trait.
///
/// String keys, byte values. Reads see committed state; writes happen only
/// through [`KVStore::commit`].
pub trait KVStore: Send + Sync {
    /// Get a value by key.
    fn get(&self, key: &str) -> KVResult<Option<Vec<u8>>>;

    /// Scan for keys with a given prefix, in ascending key order.
    fn scan(&self, prefix: &str) -> KVResult<Vec<(String, Vec<u8>)>>;

    /// Visit every entry under `prefix` in ascending key order without
    /// collecting them. The visitor returns `false` to stop early.
    fn for_each(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, &[u8]) -> bool,
    ) -> KVResult<()>;

    /// Check every expectation of `batch` and, if all hold, apply its
    /// operations. Both happen atomically with respect to other writers.
    /// Returns [`KVError::Conflict`] naming the first failing key otherwise.
    fn commit(&self, batch: &Batch) -> KVResult<()>;
}

impl fmt::Debug for dyn KVStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KVStore {{ ... }}")
    }
}

// Re-export the implementations
pub use memory::MemoryStore;
pub use redb::RedbStore;
