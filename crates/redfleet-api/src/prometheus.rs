//! Prometheus text exposition of fleet state.
//!
//! Every phase and status is emitted, including zero counts, so series do
//! not disappear when the last instance leaves a phase.

use redfleet_state::{InstancePhase, InstanceStatus, TaskRecord, TaskStatus, Versioned};

pub fn render_prometheus(
    statuses: &[Versioned<InstanceStatus>],
    tasks: &[Versioned<TaskRecord>],
    queued: usize,
) -> String {
    let mut out = String::new();

    out.push_str("# HELP redfleet_instances Number of instances by phase.\n");
    out.push_str("# TYPE redfleet_instances gauge\n");
    for phase in InstancePhase::ALL {
        let count = statuses.iter().filter(|s| s.value.phase == phase).count();
        out.push_str(&format!("redfleet_instances{{phase=\"{phase}\"}} {count}\n"));
    }

    out.push_str("# HELP redfleet_tasks Number of task records by status.\n");
    out.push_str("# TYPE redfleet_tasks gauge\n");
    for status in TaskStatus::ALL {
        let count = tasks.iter().filter(|t| t.value.status == status).count();
        out.push_str(&format!("redfleet_tasks{{status=\"{status}\"}} {count}\n"));
    }

    out.push_str("# HELP redfleet_pending_work_items Tasks waiting for an offer.\n");
    out.push_str("# TYPE redfleet_pending_work_items gauge\n");
    out.push_str(&format!("redfleet_pending_work_items {queued}\n"));

    out.push_str("# HELP redfleet_instance_errors Instances carrying an error annotation.\n");
    out.push_str("# TYPE redfleet_instance_errors gauge\n");
    let errored = statuses.iter().filter(|s| s.value.error.is_some()).count();
    out.push_str(&format!("redfleet_instance_errors {errored}\n"));

    out
}
