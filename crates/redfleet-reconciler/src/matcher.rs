//! Offer matching.
//!
//! Pure FIFO first-fit: the oldest eligible work item whose requirement
//! fits the offer wins. No bin packing.

use redfleet_core::ReconcilerConfig;
use redfleet_offers::Offer;
use redfleet_state::{InstanceName, TaskRole};

/// Resources one task needs from an offer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Requirement {
    pub memory_mb: u64,
    pub cpu: f64,
    pub ports: u32,
}

impl Requirement {
    /// Instance memory plus the fixed per-task overhead.
    pub fn for_task(memory_mb: u64, config: &ReconcilerConfig) -> Self {
        Self {
            memory_mb,
            cpu: config.task_cpu,
            ports: config.task_ports,
        }
    }

    pub fn fits(&self, offer: &Offer) -> bool {
        offer.memory_mb >= self.memory_mb
            && offer.cpu >= self.cpu
            && offer.ports.len() >= self.ports as usize
    }
}

/// A queued task as the matcher sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTask {
    pub seq: u64,
    pub instance_name: InstanceName,
    pub role: TaskRole,
    pub requirement: Requirement,
    /// False for a slave whose master has not been launched yet.
    pub eligible: bool,
}

/// Index of the first eligible task that fits `offer`, in queue order.
pub fn first_fit(offer: &Offer, queue: &[PendingTask]) -> Option<usize> {
    queue
        .iter()
        .position(|task| task.eligible && task.requirement.fits(offer))
}
