//! Gateway — the operator-facing contract over the store.
//!
//! The gateway only writes desired state (a new spec, a delete request);
//! everything else is left to the reconciliation loops.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use redfleet_state::*;

use crate::error::{GatewayError, GatewayResult};

/// Optimistic write attempts before a contended request gives up.
const MAX_WRITE_ATTEMPTS: usize = 5;

/// Body of a create request. Sizes are clamped, not validated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub memory_mb: i64,
    pub slave_count: i64,
}

/// An instance as shown to operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceView {
    pub status: InstanceStatus,
    /// Absent for forced-deletion tombstones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<InstanceSpec>,
}

#[derive(Clone)]
pub struct Gateway {
    store: StateStore,
    redis_image: String,
}

impl Gateway {
    pub fn new(store: StateStore, redis_image: impl Into<String>) -> Self {
        Self {
            store,
            redis_image: redis_image.into(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Accept a new instance.
    ///
    /// Writes the spec, a `Pending` status and one work item per task in a
    /// single batch. A forced-deletion tombstone under the same name is
    /// replaced.
    pub fn create_instance(&self, req: &CreateRequest) -> GatewayResult<InstanceSpec> {
        validate_name(&req.name).map_err(|e| GatewayError::Validation(e.to_string()))?;

        let mut last_conflict = None;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            if self.store.get_spec(&req.name)?.is_some() {
                return Err(GatewayError::AlreadyExists(req.name.clone()));
            }
            let existing = self.store.get_status(&req.name)?;
            let replaces = match &existing {
                Some(s) if s.value.is_tombstone() => Some(s.version),
                Some(_) => return Err(GatewayError::AlreadyExists(req.name.clone())),
                None => None,
            };

            let now = epoch_millis();
            let spec = InstanceSpec::clamped(
                &req.name,
                req.memory_mb,
                req.slave_count,
                &self.redis_image,
                now,
            );
            let cursor = self.store.queue_cursor()?;
            let mut batch = self.store.batch();
            batch
                .create_spec(&spec)
                .put_status(&InstanceStatus::pending(&spec.name, now), replaces)
                .enqueue(&cursor, &spec.name, TaskRole::Master, now);
            for _ in 0..spec.slave_count {
                batch.enqueue(&cursor, &spec.name, TaskRole::Slave, now);
            }

            match self.store.commit(batch) {
                Ok(()) => {
                    info!(
                        instance = %spec.name,
                        memory_mb = spec.memory_mb,
                        slaves = spec.slave_count,
                        "instance accepted"
                    );
                    return Ok(spec);
                }
                Err(e) if e.is_conflict() => {
                    debug!(instance = %req.name, error = %e, "create raced, retrying");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        // Only reachable when every attempt conflicted.
        Err(last_conflict
            .map(GatewayError::State)
            .unwrap_or_else(|| GatewayError::AlreadyExists(req.name.clone())))
    }

    pub fn get_instance_status(&self, name: &str) -> GatewayResult<InstanceStatus> {
        self.store
            .get_status(name)?
            .map(|s| s.value)
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    pub fn describe_instance(&self, name: &str) -> GatewayResult<InstanceView> {
        let status = self.get_instance_status(name)?;
        let spec = self.store.get_spec(name)?.map(|s| s.value);
        Ok(InstanceView { status, spec })
    }

    /// All known instances in name order.
    pub fn list_instances(&self) -> GatewayResult<Vec<InstanceView>> {
        let mut specs: std::collections::HashMap<String, InstanceSpec> = self
            .store
            .list_specs()?
            .into_iter()
            .map(|s| (s.value.name.clone(), s.value))
            .collect();
        Ok(self
            .store
            .list_statuses()?
            .into_iter()
            .map(|s| InstanceView {
                spec: specs.remove(&s.value.name),
                status: s.value,
            })
            .collect())
    }

    /// Request deletion of an instance.
    ///
    /// Idempotent while the deletion is in flight. Deleting a tombstone
    /// acknowledges it and removes it.
    pub fn delete_instance(&self, name: &str) -> GatewayResult<()> {
        let mut last_conflict = None;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(read) = self.store.get_status(name)? else {
                return Err(GatewayError::NotFound(name.to_string()));
            };

            let mut batch = self.store.batch();
            match read.value.phase {
                InstancePhase::DeleteRequested => return Ok(()),
                InstancePhase::Deleted => {
                    batch.delete_status(name, Some(read.version));
                }
                _ => {
                    let mut status = read.value.clone();
                    status.phase = InstancePhase::DeleteRequested;
                    status.kill_attempts = 0;
                    status.last_kill_at_ms = None;
                    status.last_updated_ms = epoch_millis();
                    batch.put_status(&status, Some(read.version));
                }
            }

            match self.store.commit(batch) {
                Ok(()) => {
                    info!(instance = %name, from = ?read.value.phase, "delete requested");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!(instance = %name, error = %e, "delete raced, retrying");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_conflict
            .map(GatewayError::State)
            .unwrap_or_else(|| GatewayError::NotFound(name.to_string())))
    }
}
