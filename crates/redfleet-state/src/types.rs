//! Domain types for the RedFleet state store.
//!
//! Desired state (`InstanceSpec`) is written by the gateway; observed state
//! (`InstanceStatus`, `TaskRecord`) and the pending queue (`WorkItem`) are
//! owned by the reconciliation loops. All types are JSON-serialized into
//! the versioned record table.

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Operator-chosen, immutable instance name.
pub type InstanceName = String;

/// Cluster-scheduler task identifier, assigned at launch.
pub type TaskId = String;

/// Identifier of a node offering resources.
pub type NodeId = String;

/// Lower bound for `memory_mb`; smaller requests are raised to it.
pub const MIN_MEMORY_MB: u64 = 100;

/// Upper bound for `slave_count`; out-of-range requests become 0.
pub const MAX_SLAVES: u32 = 100;

/// Maximum length of an instance name.
pub const MAX_NAME_LEN: usize = 64;

/// A record together with the version it was read at.
///
/// Writers hand the version back as a compare-and-swap precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

// ── Desired state ──────────────────────────────────────────────────

/// Desired state of one managed Redis instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: InstanceName,
    pub memory_mb: u64,
    pub slave_count: u32,
    pub redis_image: String,
    /// Unix timestamp (milliseconds) when the spec was accepted.
    pub created_at_ms: u64,
}

impl InstanceSpec {
    /// Build a spec, coercing out-of-range sizes instead of rejecting them.
    ///
    /// `memory_mb` below [`MIN_MEMORY_MB`] is raised to it; a `slave_count`
    /// outside `[0, MAX_SLAVES]` becomes 0.
    pub fn clamped(
        name: &str,
        memory_mb: i64,
        slave_count: i64,
        redis_image: &str,
        created_at_ms: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            memory_mb: clamp_memory(memory_mb),
            slave_count: clamp_slaves(slave_count),
            redis_image: redis_image.to_string(),
            created_at_ms,
        }
    }
}

pub fn clamp_memory(memory_mb: i64) -> u64 {
    if memory_mb < MIN_MEMORY_MB as i64 {
        MIN_MEMORY_MB
    } else {
        memory_mb as u64
    }
}

pub fn clamp_slaves(slave_count: i64) -> u32 {
    if (0..=MAX_SLAVES as i64).contains(&slave_count) {
        slave_count as u32
    } else {
        0
    }
}

/// Names are key segments, so they are restricted to `[A-Za-z0-9_-]`.
pub fn validate_name(name: &str) -> StateResult<()> {
    if name.is_empty() {
        return Err(StateError::InvalidName("name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StateError::InvalidName(format!(
            "name longer than {MAX_NAME_LEN} characters"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(StateError::InvalidName(format!(
            "{name:?} contains unsupported character {c:?}"
        )));
    }
    Ok(())
}

// ── Observed state ─────────────────────────────────────────────────

/// Lifecycle phase of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    /// Accepted, waiting for offers.
    Pending,
    /// Every task has been launched; not all report running yet.
    Starting,
    /// Master and all slaves report running.
    Running,
    /// Reconciliation gave up (launch retries exhausted or master lost).
    /// See `InstanceStatus::error`.
    Failed,
    /// Operator asked for deletion; the destroy loop owns the instance.
    DeleteRequested,
    /// Terminal.
    Deleted,
}

impl InstancePhase {
    pub fn is_terminal(self) -> bool {
        self == InstancePhase::Deleted
    }

    /// Phases whose tasks the maintain loop watches.
    ///
    /// A `Pending` instance only qualifies once its master is launched;
    /// see [`InstanceStatus::is_maintained`].
    pub fn is_active(self) -> bool {
        matches!(self, InstancePhase::Starting | InstancePhase::Running)
    }

    pub const ALL: [InstancePhase; 6] = [
        InstancePhase::Pending,
        InstancePhase::Starting,
        InstancePhase::Running,
        InstancePhase::Failed,
        InstancePhase::DeleteRequested,
        InstancePhase::Deleted,
    ];
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstancePhase::Pending => "pending",
            InstancePhase::Starting => "starting",
            InstancePhase::Running => "running",
            InstancePhase::Failed => "failed",
            InstancePhase::DeleteRequested => "delete_requested",
            InstancePhase::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Observed state of an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceStatus {
    pub name: InstanceName,
    pub phase: InstancePhase,
    pub master_task_id: Option<TaskId>,
    /// Launched slave tasks in launch order.
    pub slave_task_ids: Vec<TaskId>,
    /// Operator-visible annotation for persistent failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Kill rounds issued by the destroy loop.
    #[serde(default)]
    pub kill_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_kill_at_ms: Option<u64>,
    /// Set when a forced deletion leaves this status behind as a tombstone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at_ms: Option<u64>,
    pub last_updated_ms: u64,
}

impl InstanceStatus {
    /// Fresh status for a newly accepted instance.
    pub fn pending(name: &str, now_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            phase: InstancePhase::Pending,
            master_task_id: None,
            slave_task_ids: Vec::new(),
            error: None,
            kill_attempts: 0,
            last_kill_at_ms: None,
            deleted_at_ms: None,
            last_updated_ms: now_ms,
        }
    }

    /// Whether `task_id` is one of this instance's tracked tasks.
    pub fn tracks(&self, task_id: &str) -> bool {
        self.master_task_id.as_deref() == Some(task_id)
            || self.slave_task_ids.iter().any(|id| id == task_id)
    }

    /// Whether the maintain loop evaluates this instance: it is active, or
    /// still pending with tasks already launched.
    pub fn is_maintained(&self) -> bool {
        self.phase.is_active()
            || (self.phase == InstancePhase::Pending && self.master_task_id.is_some())
    }

    /// Whether this status is a forced-deletion tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.phase == InstancePhase::Deleted
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

/// Role a task plays within its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRole {
    Master,
    Slave,
}

impl std::fmt::Display for TaskRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskRole::Master => f.write_str("master"),
            TaskRole::Slave => f.write_str("slave"),
        }
    }
}

/// Task status as reported by the cluster scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Staging,
    Running,
    Finished,
    Failed,
    Killed,
    /// The scheduler lost track of the task; handled like `Failed`.
    Lost,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Staging,
        TaskStatus::Running,
        TaskStatus::Finished,
        TaskStatus::Failed,
        TaskStatus::Killed,
        TaskStatus::Lost,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Failed | TaskStatus::Killed | TaskStatus::Lost
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Staging => "staging",
            TaskStatus::Running => "running",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
            TaskStatus::Killed => "killed",
            TaskStatus::Lost => "lost",
        };
        f.write_str(s)
    }
}

/// Observed state of a single launched task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRecord {
    pub task_id: TaskId,
    /// Back-reference to the owning instance.
    pub instance_name: InstanceName,
    pub role: TaskRole,
    pub node_id: NodeId,
    pub offer_id: String,
    pub memory_mb: u64,
    pub status: TaskStatus,
    pub created_at_ms: u64,
    pub last_status_update_ms: u64,
    /// When the last kill request for this task went out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_requested_at_ms: Option<u64>,
    /// Kill requests sent by the maintain loop.
    #[serde(default)]
    pub kill_attempts: u32,
}

// ── Pending queue ──────────────────────────────────────────────────

/// One task the create loop still has to launch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    /// Queue position; lower is older.
    pub seq: u64,
    pub instance_name: InstanceName,
    pub role: TaskRole,
    /// Failed launch attempts so far.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub enqueued_at_ms: u64,
}
