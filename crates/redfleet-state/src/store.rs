//! StateStore — typed access to RedFleet records.
//!
//! Wraps a [`KvStore`] and provides typed reads over instance specs,
//! statuses, task records and the pending work queue. Writes are staged
//! in a [`Batch`] and committed atomically; every write of an existing
//! record is guarded by the version it was read at.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::kv::{Expect, KvStore, RedbStore, WriteOp};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Typed, cloneable handle to the durable store.
#[derive(Clone)]
pub struct StateStore {
    kv: Arc<dyn KvStore>,
}

impl StateStore {
    /// Open (or create) a persistent redb-backed store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        Ok(Self::from_kv(Arc::new(RedbStore::open(path)?)))
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        Ok(Self::from_kv(Arc::new(RedbStore::open_in_memory()?)))
    }

    /// Wrap an arbitrary backend.
    pub fn from_kv(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// The raw key-value contract underneath.
    pub fn kv(&self) -> &dyn KvStore {
        self.kv.as_ref()
    }

    // ── Specs ──────────────────────────────────────────────────────

    pub fn get_spec(&self, name: &str) -> StateResult<Option<Versioned<InstanceSpec>>> {
        self.get_typed(&spec_key(name))
    }

    pub fn list_specs(&self) -> StateResult<Vec<Versioned<InstanceSpec>>> {
        self.list_typed(SPEC_PREFIX)
    }

    // ── Statuses ───────────────────────────────────────────────────

    pub fn get_status(&self, name: &str) -> StateResult<Option<Versioned<InstanceStatus>>> {
        self.get_typed(&status_key(name))
    }

    pub fn list_statuses(&self) -> StateResult<Vec<Versioned<InstanceStatus>>> {
        self.list_typed(STATUS_PREFIX)
    }

    /// Statuses in any of the given phases.
    pub fn list_statuses_in(
        &self,
        phases: &[InstancePhase],
    ) -> StateResult<Vec<Versioned<InstanceStatus>>> {
        Ok(self
            .list_statuses()?
            .into_iter()
            .filter(|s| phases.contains(&s.value.phase))
            .collect())
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn get_task(&self, task_id: &str) -> StateResult<Option<Versioned<TaskRecord>>> {
        self.get_typed(&task_key(task_id))
    }

    pub fn list_tasks(&self) -> StateResult<Vec<Versioned<TaskRecord>>> {
        self.list_typed(TASK_PREFIX)
    }

    /// All task records whose back-reference points at `name`.
    pub fn list_tasks_for_instance(&self, name: &str) -> StateResult<Vec<Versioned<TaskRecord>>> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| t.value.instance_name == name)
            .collect())
    }

    // ── Work queue ─────────────────────────────────────────────────

    /// The pending queue, oldest first.
    pub fn list_work_items(&self) -> StateResult<Vec<Versioned<WorkItem>>> {
        self.list_typed(QUEUE_PREFIX)
    }

    pub fn list_work_items_for_instance(
        &self,
        name: &str,
    ) -> StateResult<Vec<Versioned<WorkItem>>> {
        Ok(self
            .list_work_items()?
            .into_iter()
            .filter(|w| w.value.instance_name == name)
            .collect())
    }

    /// Current queue tail, needed to enqueue inside a batch.
    pub fn queue_cursor(&self) -> StateResult<QueueCursor> {
        match self.get_typed::<u64>(QUEUE_SEQ_KEY)? {
            Some(v) => Ok(QueueCursor {
                last: v.value,
                version: Some(v.version),
                dirty: false,
            }),
            None => Ok(QueueCursor {
                last: 0,
                version: None,
                dirty: false,
            }),
        }
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Start an empty batch.
    pub fn batch(&self) -> Batch {
        Batch::default()
    }

    /// Apply a batch atomically.
    pub fn commit(&self, batch: Batch) -> StateResult<()> {
        let ops = batch.into_ops()?;
        let count = ops.len();
        self.kv.commit(&ops)?;
        debug!(ops = count, "batch committed");
        Ok(())
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn get_typed<T: DeserializeOwned>(&self, key: &str) -> StateResult<Option<Versioned<T>>> {
        match self.kv.get(key)? {
            Some(raw) => Ok(Some(Versioned {
                version: raw.version,
                value: serde_json::from_slice(&raw.value).map_err(map_err!(Deserialize))?,
            })),
            None => Ok(None),
        }
    }

    fn list_typed<T: DeserializeOwned>(&self, prefix: &str) -> StateResult<Vec<Versioned<T>>> {
        self.kv
            .list(prefix)?
            .into_iter()
            .map(|(_, raw)| {
                Ok(Versioned {
                    version: raw.version,
                    value: serde_json::from_slice(&raw.value).map_err(map_err!(Deserialize))?,
                })
            })
            .collect()
    }
}

/// Position of the queue tail as read from the store.
///
/// Enqueueing through a cursor advances it and makes the batch update
/// `meta/queue_seq` guarded by the version read here, so two concurrent
/// enqueuers cannot hand out the same sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueCursor {
    last: u64,
    version: Option<u64>,
    dirty: bool,
}

impl QueueCursor {
    /// Sequence number of the newest queued item (0 when never used).
    pub fn last(&self) -> u64 {
        self.last
    }
}

/// Pending writes, applied all-or-nothing by [`StateStore::commit`].
///
/// Cloning a batch lets a caller retry the same writes after a transient
/// store failure.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    ops: Vec<PendingOp>,
    cursor: Option<QueueCursor>,
}

#[derive(Debug, Clone)]
enum PendingOp {
    Put {
        key: String,
        value: Result<Vec<u8>, String>,
        expect: Expect,
    },
    Delete {
        key: String,
        expect: Expect,
    },
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && !self.cursor.as_ref().is_some_and(|c| c.dirty)
    }

    /// Create a spec; fails at commit if one already exists.
    pub fn create_spec(&mut self, spec: &InstanceSpec) -> &mut Self {
        self.put(spec_key(&spec.name), spec, Expect::Absent)
    }

    pub fn delete_spec(&mut self, name: &str) -> &mut Self {
        self.delete(spec_key(name), Expect::Any)
    }

    /// Write a status; `expected` is the version it was read at (`None` = new).
    pub fn put_status(&mut self, status: &InstanceStatus, expected: Option<u64>) -> &mut Self {
        self.put(status_key(&status.name), status, expected.into())
    }

    pub fn delete_status(&mut self, name: &str, expected: Option<u64>) -> &mut Self {
        let expect = expected.map_or(Expect::Any, Expect::Version);
        self.delete(status_key(name), expect)
    }

    /// Write a task record; `expected` is the version it was read at (`None` = new).
    pub fn put_task(&mut self, task: &TaskRecord, expected: Option<u64>) -> &mut Self {
        self.put(task_key(&task.task_id), task, expected.into())
    }

    pub fn delete_task(&mut self, task_id: &str, expected: Option<u64>) -> &mut Self {
        let expect = expected.map_or(Expect::Any, Expect::Version);
        self.delete(task_key(task_id), expect)
    }

    /// Append a new work item at the queue tail.
    ///
    /// The first enqueue adopts `cursor`; later enqueues in the same batch
    /// continue from the batch's own copy.
    pub fn enqueue(
        &mut self,
        cursor: &QueueCursor,
        instance_name: &str,
        role: TaskRole,
        now_ms: u64,
    ) -> &mut Self {
        let cursor = self.cursor.get_or_insert_with(|| cursor.clone());
        cursor.last += 1;
        cursor.dirty = true;
        let item = WorkItem {
            seq: cursor.last,
            instance_name: instance_name.to_string(),
            role,
            attempts: 0,
            last_error: None,
            enqueued_at_ms: now_ms,
        };
        self.put(queue_key(item.seq), &item, Expect::Absent)
    }

    /// Rewrite an item in place, keeping its queue position.
    pub fn update_work_item(&mut self, item: &WorkItem, expected: u64) -> &mut Self {
        self.put(queue_key(item.seq), item, Expect::Version(expected))
    }

    pub fn remove_work_item(&mut self, seq: u64, expected: Option<u64>) -> &mut Self {
        let expect = expected.map_or(Expect::Any, Expect::Version);
        self.delete(queue_key(seq), expect)
    }

    fn put<T: Serialize>(&mut self, key: String, value: &T, expect: Expect) -> &mut Self {
        let value = serde_json::to_vec(value).map_err(|e| e.to_string());
        self.ops.push(PendingOp::Put { key, value, expect });
        self
    }

    fn delete(&mut self, key: String, expect: Expect) -> &mut Self {
        self.ops.push(PendingOp::Delete { key, expect });
        self
    }

    fn into_ops(self) -> StateResult<Vec<WriteOp>> {
        let mut ops = Vec::with_capacity(self.ops.len() + 1);
        for op in self.ops {
            ops.push(match op {
                PendingOp::Put { key, value, expect } => WriteOp::Put {
                    key,
                    value: value.map_err(StateError::Serialize)?,
                    expect,
                },
                PendingOp::Delete { key, expect } => WriteOp::Delete { key, expect },
            });
        }
        if let Some(cursor) = self.cursor.filter(|c| c.dirty) {
            let value = serde_json::to_vec(&cursor.last).map_err(map_err!(Serialize))?;
            ops.push(WriteOp::Put {
                key: QUEUE_SEQ_KEY.to_string(),
                value,
                expect: cursor.version.into(),
            });
        }
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec(name: &str) -> InstanceSpec {
        InstanceSpec::clamped(name, 256, 2, "redis:3.0-alpine", 1000)
    }

    fn test_task(id: &str, instance: &str, role: TaskRole) -> TaskRecord {
        TaskRecord {
            task_id: id.to_string(),
            instance_name: instance.to_string(),
            role,
            node_id: "node-1".to_string(),
            offer_id: "offer-1".to_string(),
            memory_mb: 256,
            status: TaskStatus::Staging,
            created_at_ms: 1000,
            last_status_update_ms: 1000,
            kill_requested_at_ms: None,
            kill_attempts: 0,
        }
    }

    fn create(store: &StateStore, name: &str) {
        let cursor = store.queue_cursor().unwrap();
        let mut batch = store.batch();
        batch
            .create_spec(&test_spec(name))
            .put_status(&InstanceStatus::pending(name, 1000), None)
            .enqueue(&cursor, name, TaskRole::Master, 1000)
            .enqueue(&cursor, name, TaskRole::Slave, 1000);
        store.commit(batch).unwrap();
    }

    #[test]
    fn spec_and_status_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        create(&store, "cache1");

        let spec = store.get_spec("cache1").unwrap().unwrap();
        assert_eq!(spec.value, test_spec("cache1"));

        let status = store.get_status("cache1").unwrap().unwrap();
        assert_eq!(status.value.phase, InstancePhase::Pending);
    }

    #[test]
    fn duplicate_spec_is_rejected_atomically() {
        let store = StateStore::open_in_memory().unwrap();
        create(&store, "cache1");

        let cursor = store.queue_cursor().unwrap();
        let mut batch = store.batch();
        batch
            .create_spec(&test_spec("cache1"))
            .enqueue(&cursor, "cache1", TaskRole::Master, 2000);
        assert!(store.commit(batch).unwrap_err().is_conflict());

        // The failed batch did not add queue items.
        assert_eq!(store.list_work_items().unwrap().len(), 2);
    }

    #[test]
    fn queue_is_fifo_across_batches() {
        let store = StateStore::open_in_memory().unwrap();
        create(&store, "a");
        create(&store, "b");

        let items = store.list_work_items().unwrap();
        let order: Vec<(String, TaskRole)> = items
            .iter()
            .map(|w| (w.value.instance_name.clone(), w.value.role))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), TaskRole::Master),
                ("a".to_string(), TaskRole::Slave),
                ("b".to_string(), TaskRole::Master),
                ("b".to_string(), TaskRole::Slave),
            ]
        );
        let seqs: Vec<u64> = items.iter().map(|w| w.value.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(store.queue_cursor().unwrap().last(), 4);
    }

    #[test]
    fn stale_cursor_cannot_reuse_sequence_numbers() {
        let store = StateStore::open_in_memory().unwrap();
        let stale = store.queue_cursor().unwrap();
        create(&store, "a");

        let mut batch = store.batch();
        batch.enqueue(&stale, "a", TaskRole::Slave, 3000);
        assert!(store.commit(batch).unwrap_err().is_conflict());
    }

    #[test]
    fn work_item_update_keeps_position() {
        let store = StateStore::open_in_memory().unwrap();
        create(&store, "a");

        let first = store.list_work_items().unwrap().remove(0);
        let mut item = first.value.clone();
        item.attempts = 1;
        item.last_error = Some("launch refused".into());
        let mut batch = store.batch();
        batch.update_work_item(&item, first.version);
        store.commit(batch).unwrap();

        let head = store.list_work_items().unwrap().remove(0);
        assert_eq!(head.value.seq, first.value.seq);
        assert_eq!(head.value.attempts, 1);
    }

    #[test]
    fn tasks_filtered_by_instance() {
        let store = StateStore::open_in_memory().unwrap();
        let mut batch = store.batch();
        batch
            .put_task(&test_task("t1", "a", TaskRole::Master), None)
            .put_task(&test_task("t2", "a", TaskRole::Slave), None)
            .put_task(&test_task("t3", "b", TaskRole::Master), None);
        store.commit(batch).unwrap();

        assert_eq!(store.list_tasks_for_instance("a").unwrap().len(), 2);
        assert_eq!(store.list_tasks_for_instance("b").unwrap().len(), 1);
        assert_eq!(store.list_tasks().unwrap().len(), 3);
    }

    #[test]
    fn stale_status_write_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        create(&store, "a");
        let read = store.get_status("a").unwrap().unwrap();

        let mut first = read.value.clone();
        first.phase = InstancePhase::Starting;
        let mut batch = store.batch();
        batch.put_status(&first, Some(read.version));
        store.commit(batch).unwrap();

        let mut second = read.value.clone();
        second.phase = InstancePhase::DeleteRequested;
        let mut batch = store.batch();
        batch.put_status(&second, Some(read.version));
        assert!(store.commit(batch).unwrap_err().is_conflict());

        let now = store.get_status("a").unwrap().unwrap();
        assert_eq!(now.value.phase, InstancePhase::Starting);
    }

    #[test]
    fn list_statuses_in_phase() {
        let store = StateStore::open_in_memory().unwrap();
        create(&store, "a");
        create(&store, "b");

        let read = store.get_status("b").unwrap().unwrap();
        let mut status = read.value.clone();
        status.phase = InstancePhase::Running;
        let mut batch = store.batch();
        batch.put_status(&status, Some(read.version));
        store.commit(batch).unwrap();

        let pending = store.list_statuses_in(&[InstancePhase::Pending]).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].value.name, "a");
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_specs().unwrap().is_empty());
        assert!(store.list_statuses().unwrap().is_empty());
        assert!(store.list_tasks().unwrap().is_empty());
        assert!(store.list_work_items().unwrap().is_empty());
        assert!(store.get_spec("nope").unwrap().is_none());
        assert_eq!(store.queue_cursor().unwrap().last(), 0);
        assert!(store.batch().is_empty());
    }
}
