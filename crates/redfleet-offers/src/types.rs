//! Offers, launch requests and status reports.

use redfleet_state::{InstanceName, NodeId, TaskId, TaskRole, TaskStatus};

/// A time-bounded grant of resources on one node.
///
/// Consumed at most once: launched against or declined.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub offer_id: String,
    pub node_id: NodeId,
    pub cpu: f64,
    pub memory_mb: u64,
    pub ports: Vec<u16>,
    /// Unix timestamp (milliseconds) after which the offer is void.
    pub expires_at_ms: u64,
}

impl Offer {
    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// What to run with an accepted offer.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub instance_name: InstanceName,
    pub role: TaskRole,
    pub redis_image: String,
    pub memory_mb: u64,
    pub cpu: f64,
    pub ports: u32,
}

/// Asynchronous task status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Free-form reason supplied by the scheduler.
    pub message: Option<String>,
}

impl StatusUpdate {
    pub fn new(task_id: &str, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.to_string(),
            status,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_expiry_is_inclusive() {
        let offer = Offer {
            offer_id: "o-1".into(),
            node_id: "node-1".into(),
            cpu: 1.0,
            memory_mb: 256,
            ports: vec![6379],
            expires_at_ms: 1000,
        };
        assert!(!offer.expired(999));
        assert!(offer.expired(1000));
    }
}
