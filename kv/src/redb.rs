//! Redb-based persistent key-value store implementation.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use crate::{Batch, KVError, KVResult, KVStore, Op};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Maps any redb error into a [`KVError`], keeping I/O failures and lock
/// contention retryable.
fn map_err<E: Into<redb::Error>>(e: E) -> KVError {
    match e.into() {
        redb::Error::Io(io) => KVError::Unavailable(io.to_string()),
        redb::Error::DatabaseAlreadyOpen => {
            KVError::Unavailable("database already open".to_string())
        }
        other => KVError::Storage(other.to_string()),
    }
}

/// A persistent key-value store backed by redb.
///
/// redb serializes write transactions, so [`KVStore::commit`] checks its
/// expectations inside the same write transaction that applies the batch.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a redb store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> KVResult<Self> {
        let db = Database::create(path).map_err(map_err)?;

        // Create the table if it doesn't exist
        let tx = db.begin_write().map_err(map_err)?;
        {
            let _ = tx.open_table(TABLE).map_err(map_err)?;
        }
        tx.commit().map_err(map_err)?;

        Ok(Self { db })
    }
}

impl KVStore for RedbStore {
    fn get(&self, key: &str) -> KVResult<Option<Vec<u8>>> {
        let tx = self.db.begin_read().map_err(map_err)?;
        let table = tx.open_table(TABLE).map_err(map_err)?;

        match table.get(key).map_err(map_err)? {
            Some(value) => Ok(Some(value.value().to_vec())),
            None => Ok(None),
        }
    }

    fn scan(&self, prefix: &str) -> KVResult<Vec<(String, Vec<u8>)>> {
        let mut results = Vec::new();
        self.for_each(prefix, &mut |k, v| {
            results.push((k.to_string(), v.to_vec()));
            true
        })?;
        Ok(results)
    }

    fn for_each(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, &[u8]) -> bool,
    ) -> KVResult<()> {
        let tx = self.db.begin_read().map_err(map_err)?;
        let table = tx.open_table(TABLE).map_err(map_err)?;

        for item in table.range(prefix..).map_err(map_err)? {
            let (key, value) = item.map_err(map_err)?;
            let key_str = key.value();
            if !key_str.starts_with(prefix) {
                break;
            }
            if !visit(key_str, value.value()) {
                break;
            }
        }
        Ok(())
    }

    fn commit(&self, batch: &Batch) -> KVResult<()> {
        let tx = self.db.begin_write().map_err(map_err)?;
        {
            let mut table = tx.open_table(TABLE).map_err(map_err)?;
            for (key, expect) in batch.checks() {
                let current = table.get(key.as_str()).map_err(map_err)?;
                let holds = expect.holds(current.as_ref().map(|v| v.value()));
                if !holds {
                    // Dropping the transaction aborts it.
                    return Err(KVError::Conflict(key.clone()));
                }
            }
            for op in batch.ops() {
                match op {
                    Op::Put(k, v) => {
                        table.insert(k.as_str(), v.as_slice()).map_err(map_err)?;
                    }
                    Op::Delete(k) => {
                        table.remove(k.as_str()).map_err(map_err)?;
                    }
                }
            }
        }
        tx.commit().map_err(map_err)?;
        Ok(())
    }
}
