//! redfleet-state — durable state for the RedFleet control plane.
//!
//! Backed by [redb](https://docs.rs/redb). Every record is versioned and
//! every reconciliation write is a compare-and-swap against the version it
//! was read at, so loops racing on the same instance cannot lose updates.
//!
//! # Architecture
//!
//! ```text
//! StateStore (typed: specs, statuses, tasks, work queue)
//!   └── KvStore (put / get / list / delete / compare_and_swap / commit)
//!         └── RedbStore (on-disk or in-memory redb)
//! ```
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<dyn KvStore>`)
//! and is the only state shared between the reconciliation loops.

pub mod error;
pub mod kv;
pub mod retry;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use kv::{Expect, KvStore, RedbStore, WriteOp};
pub use retry::{Backoff, retry_transient, retry_with};
pub use store::{Batch, QueueCursor, StateStore};
pub use types::*;

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
