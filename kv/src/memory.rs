//! In-memory key-value store implementation for testing.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Batch, KVError, KVResult, KVStore, Op};

/// An in-memory key-value store backed by an ordered map.
///
/// Clones share the same underlying data.
#[derive(Clone)]
pub struct MemoryStore {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KVStore for MemoryStore {
    fn get(&self, key: &str) -> KVResult<Option<Vec<u8>>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn scan(&self, prefix: &str) -> KVResult<Vec<(String, Vec<u8>)>> {
        let data = self.data.lock();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Copies every entry under `prefix` before visiting, so the visitor may
    /// call back into the store. Unlike [`crate::RedbStore`], memory use is
    /// proportional to the prefix.
    fn for_each(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, &[u8]) -> bool,
    ) -> KVResult<()> {
        for (k, v) in self.scan(prefix)? {
            if !visit(&k, &v) {
                break;
            }
        }
        Ok(())
    }

    fn commit(&self, batch: &Batch) -> KVResult<()> {
        let mut data = self.data.lock();
        for (key, expect) in batch.checks() {
            if !expect.holds(data.get(key).map(|v| v.as_slice())) {
                return Err(KVError::Conflict(key.clone()));
            }
        }
        for op in batch.ops() {
            match op {
                Op::Put(k, v) => {
                    data.insert(k.clone(), v.clone());
                }
                Op::Delete(k) => {
                    data.remove(k);
                }
            }
        }
        Ok(())
    }
}
