//! Versioned key-value contract and its redb implementation.
//!
//! Every record carries a version. Versions come from a store-wide revision
//! counter, so a key that is deleted and recreated never reuses an old
//! version and a stale compare-and-swap cannot succeed against it.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::Versioned;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Precondition attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Unconditional.
    Any,
    /// The key must not exist.
    Absent,
    /// The key must exist at exactly this version.
    Version(u64),
}

impl From<Option<u64>> for Expect {
    fn from(version: Option<u64>) -> Self {
        match version {
            Some(v) => Expect::Version(v),
            None => Expect::Absent,
        }
    }
}

/// A single write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        key: String,
        value: Vec<u8>,
        expect: Expect,
    },
    Delete {
        key: String,
        expect: Expect,
    },
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key, .. } => key,
        }
    }

    fn expect(&self) -> Expect {
        match self {
            WriteOp::Put { expect, .. } | WriteOp::Delete { expect, .. } => *expect,
        }
    }
}

/// The durable store contract every reconciliation loop goes through.
///
/// `commit` is the primitive: all ops apply or none do, and any failed
/// precondition aborts the batch with [`StateError::VersionConflict`].
/// The single-key operations are conveniences over it.
pub trait KvStore: Send + Sync {
    /// Read one record.
    fn get(&self, key: &str) -> StateResult<Option<Versioned<Vec<u8>>>>;

    /// All records whose key starts with `prefix`, in key order.
    fn list(&self, prefix: &str) -> StateResult<Vec<(String, Versioned<Vec<u8>>)>>;

    /// Apply a batch atomically.
    ///
    /// Returns one entry per op: the new version for a put, the removed
    /// version (0 if absent) for a delete.
    fn commit(&self, ops: &[WriteOp]) -> StateResult<Vec<u64>>;

    /// Unconditional write. Returns the new version.
    fn put(&self, key: &str, value: &[u8]) -> StateResult<u64> {
        let versions = self.commit(&[WriteOp::Put {
            key: key.to_string(),
            value: value.to_vec(),
            expect: Expect::Any,
        }])?;
        Ok(versions[0])
    }

    /// Unconditional delete. Returns true if the key existed.
    fn delete(&self, key: &str) -> StateResult<bool> {
        let versions = self.commit(&[WriteOp::Delete {
            key: key.to_string(),
            expect: Expect::Any,
        }])?;
        Ok(versions[0] != 0)
    }

    /// Write `value` only if the record is at `expected` (`None` = absent).
    fn compare_and_swap(&self, key: &str, expected: Option<u64>, value: &[u8]) -> StateResult<u64> {
        let versions = self.commit(&[WriteOp::Put {
            key: key.to_string(),
            value: value.to_vec(),
            expect: expected.into(),
        }])?;
        Ok(versions[0])
    }
}

/// Thread-safe [`KvStore`] backed by redb.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RECORDS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn apply(txn: &redb::WriteTransaction, ops: &[WriteOp]) -> StateResult<Vec<u64>> {
        let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
        let mut table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        let mut revision = meta
            .get(REVISION_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);

        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let current = table
                .get(op.key())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().0);
            check_precondition(op.key(), op.expect(), current)?;

            match op {
                WriteOp::Put { key, value, .. } => {
                    revision += 1;
                    table
                        .insert(key.as_str(), (revision, value.as_slice()))
                        .map_err(map_err!(Write))?;
                    results.push(revision);
                }
                WriteOp::Delete { key, .. } => {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                    results.push(current.unwrap_or(0));
                }
            }
        }

        meta.insert(REVISION_KEY, revision).map_err(map_err!(Write))?;
        Ok(results)
    }
}

fn check_precondition(key: &str, expect: Expect, actual: Option<u64>) -> StateResult<()> {
    let ok = match expect {
        Expect::Any => true,
        Expect::Absent => actual.is_none(),
        Expect::Version(v) => actual == Some(v),
    };
    if ok {
        return Ok(());
    }
    Err(StateError::VersionConflict {
        key: key.to_string(),
        expected: match expect {
            Expect::Version(v) => Some(v),
            _ => None,
        },
        actual,
    })
}

impl KvStore for RedbStore {
    fn get(&self, key: &str) -> StateResult<Option<Versioned<Vec<u8>>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let (version, bytes) = guard.value();
                Ok(Some(Versioned {
                    version,
                    value: bytes.to_vec(),
                }))
            }
            None => Ok(None),
        }
    }

    fn list(&self, prefix: &str) -> StateResult<Vec<(String, Versioned<Vec<u8>>)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RECORDS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            let (version, bytes) = value.value();
            results.push((
                key.to_string(),
                Versioned {
                    version,
                    value: bytes.to_vec(),
                },
            ));
        }
        Ok(results)
    }

    fn commit(&self, ops: &[WriteOp]) -> StateResult<Vec<u64>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match Self::apply(&txn, ops) {
            Ok(results) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(results)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }
}
