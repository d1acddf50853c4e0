//! redb table definitions and key layout for the RedFleet state store.
//!
//! All records live in one table keyed by a typed prefix so that a prefix
//! scan returns every record of one kind in key order:
//!
//! | Prefix | Value |
//! |---|---|
//! | `spec/{name}` | `InstanceSpec` |
//! | `status/{name}` | `InstanceStatus` |
//! | `task/{task_id}` | `TaskRecord` |
//! | `queue/{seq:020}` | `WorkItem` |
//! | `meta/queue_seq` | last issued queue sequence |

use redb::TableDefinition;

/// Versioned records: key → (version, JSON bytes).
pub const RECORDS: TableDefinition<&str, (u64, &[u8])> = TableDefinition::new("records");

/// Store-wide bookkeeping (the revision counter).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the last assigned revision.
pub const REVISION_KEY: &str = "revision";

pub const SPEC_PREFIX: &str = "spec/";
pub const STATUS_PREFIX: &str = "status/";
pub const TASK_PREFIX: &str = "task/";
pub const QUEUE_PREFIX: &str = "queue/";
pub const QUEUE_SEQ_KEY: &str = "meta/queue_seq";

pub fn spec_key(name: &str) -> String {
    format!("{SPEC_PREFIX}{name}")
}

pub fn status_key(name: &str) -> String {
    format!("{STATUS_PREFIX}{name}")
}

pub fn task_key(task_id: &str) -> String {
    format!("{TASK_PREFIX}{task_id}")
}

/// Queue keys are zero-padded so lexical order equals insertion order.
pub fn queue_key(seq: u64) -> String {
    format!("{QUEUE_PREFIX}{seq:020}")
}
