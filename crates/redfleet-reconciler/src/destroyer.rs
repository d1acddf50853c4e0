//! Destroy loop — tears down instances marked `DeleteRequested`.
//!
//! Kills every live task, re-issuing kills after `kill_timeout` until
//! `max_kill_attempts` rounds have gone out. A round is committed before
//! its kills are sent. Once all tasks are terminal
//! the tasks, queue items, spec and status are removed in one batch.
//! If the ceiling is reached first, the deletion is forced: everything but
//! the status goes, and the status stays behind as a `Deleted` tombstone
//! carrying an error until it is acknowledged or `tombstone_ttl` passes.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use redfleet_core::ReconcilerConfig;
use redfleet_offers::OfferSource;
use redfleet_state::*;

use crate::error::ReconcileResult;

/// Result of one destroy pass over an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// All tasks confirmed terminal; every record is gone.
    Removed,
    /// Kill ceiling reached; a tombstone remains.
    Forced,
    /// Kills are in flight.
    Waiting { outstanding: usize },
    /// The instance is not awaiting deletion.
    Skipped,
}

/// State of a doomed instance as read at the start of a pass.
struct Doomed {
    status: Versioned<InstanceStatus>,
    tasks: Vec<Versioned<TaskRecord>>,
    items: Vec<Versioned<WorkItem>>,
}

pub struct Destroyer {
    store: StateStore,
    source: Arc<dyn OfferSource>,
    config: ReconcilerConfig,
    shutdown: watch::Receiver<bool>,
}

impl Destroyer {
    pub fn new(
        store: StateStore,
        source: Arc<dyn OfferSource>,
        config: ReconcilerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            source,
            config,
            shutdown,
        }
    }

    pub async fn run(self) -> ReconcileResult<()> {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.config.destroy_interval());
        info!(
            interval_ms = self.config.destroy_interval_ms,
            "destroy loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_all(epoch_millis()).await {
                        error!(error = %e, "destroy pass failed");
                    }
                }
            }
        }

        info!("destroy loop stopped");
        Ok(())
    }

    /// One pass over every doomed instance and expired tombstone.
    ///
    /// Returns the number of instances removed or forced.
    pub async fn reconcile_all(&self, now_ms: u64) -> ReconcileResult<usize> {
        let statuses = retry_transient("list statuses", &self.shutdown, || {
            self.store.list_statuses()
        })
        .await?;

        let mut finished = 0;
        for status in statuses {
            let name = &status.value.name;
            match status.value.phase {
                InstancePhase::DeleteRequested => match self.destroy_instance(name, now_ms).await {
                    Ok(DestroyOutcome::Removed | DestroyOutcome::Forced) => finished += 1,
                    Ok(_) => {}
                    Err(e) => warn!(instance = %name, error = %e, "destroy failed"),
                },
                InstancePhase::Deleted => {
                    let expired = status
                        .value
                        .deleted_at_ms
                        .is_none_or(|at| now_ms.saturating_sub(at) >= self.config.tombstone_ttl_ms);
                    if expired {
                        self.purge_tombstone(&status);
                    }
                }
                _ => {}
            }
        }
        Ok(finished)
    }

    fn purge_tombstone(&self, status: &Versioned<InstanceStatus>) {
        let mut batch = self.store.batch();
        batch.delete_status(&status.value.name, Some(status.version));
        match self.store.commit(batch) {
            Ok(()) => info!(instance = %status.value.name, "tombstone expired"),
            Err(e) => debug!(instance = %status.value.name, error = %e, "tombstone not purged"),
        }
    }

    fn read_doomed(&self, name: &str) -> StateResult<Option<Doomed>> {
        let Some(status) = self.store.get_status(name)? else {
            return Ok(None);
        };
        if status.value.phase != InstancePhase::DeleteRequested {
            return Ok(None);
        }
        Ok(Some(Doomed {
            status,
            tasks: self.store.list_tasks_for_instance(name)?,
            items: self.store.list_work_items_for_instance(name)?,
        }))
    }

    /// Advance the deletion of one instance.
    pub async fn destroy_instance(&self, name: &str, now_ms: u64) -> ReconcileResult<DestroyOutcome> {
        let doomed = retry_transient("read doomed instance", &self.shutdown, || {
            self.read_doomed(name)
        })
        .await?;
        let Some(Doomed {
            status,
            tasks,
            items,
        }) = doomed
        else {
            return Ok(DestroyOutcome::Skipped);
        };

        let mut batch = self.store.batch();
        let mut kills: Vec<&str> = Vec::new();
        for item in &items {
            batch.remove_work_item(item.value.seq, Some(item.version));
        }

        let live: Vec<&Versioned<TaskRecord>> = tasks
            .iter()
            .filter(|t| !t.value.status.is_terminal())
            .collect();

        let outcome = if live.is_empty() {
            for task in &tasks {
                batch.delete_task(&task.value.task_id, Some(task.version));
            }
            batch
                .delete_spec(name)
                .delete_status(name, Some(status.version));
            DestroyOutcome::Removed
        } else {
            let kill_due = status
                .value
                .last_kill_at_ms
                .is_none_or(|at| now_ms.saturating_sub(at) >= self.config.kill_timeout_ms);
            if !kill_due {
                return Ok(DestroyOutcome::Waiting {
                    outstanding: live.len(),
                });
            }

            if status.value.kill_attempts >= self.config.max_kill_attempts {
                let stuck: Vec<&str> = live.iter().map(|t| t.value.task_id.as_str()).collect();
                error!(
                    instance = %name,
                    attempts = status.value.kill_attempts,
                    tasks = %stuck.join(","),
                    "kill ceiling reached, forcing deletion"
                );
                for task in &tasks {
                    batch.delete_task(&task.value.task_id, Some(task.version));
                }
                let mut tombstone = status.value.clone();
                tombstone.phase = InstancePhase::Deleted;
                tombstone.error = Some(format!(
                    "forced deletion after {} kill attempts; tasks never confirmed termination: {}",
                    status.value.kill_attempts,
                    stuck.join(", ")
                ));
                tombstone.deleted_at_ms = Some(now_ms);
                tombstone.last_updated_ms = now_ms;
                batch
                    .delete_spec(name)
                    .put_status(&tombstone, Some(status.version));
                DestroyOutcome::Forced
            } else {
                kills.extend(live.iter().map(|t| t.value.task_id.as_str()));
                let mut next = status.value.clone();
                next.kill_attempts += 1;
                next.last_kill_at_ms = Some(now_ms);
                next.last_updated_ms = now_ms;
                batch.put_status(&next, Some(status.version));
                DestroyOutcome::Waiting {
                    outstanding: live.len(),
                }
            }
        };

        let result = retry_transient("commit deletion", &self.shutdown, || {
            self.store.commit(batch.clone())
        })
        .await;
        match result {
            Ok(()) => {
                if outcome == DestroyOutcome::Removed {
                    info!(instance = %name, tasks = tasks.len(), "instance removed");
                }
                for task_id in &kills {
                    if let Err(e) = self.source.kill_task(task_id).await {
                        warn!(instance = %name, %task_id, error = %e, "kill request failed");
                    }
                }
                if !kills.is_empty() {
                    info!(
                        instance = %name,
                        attempt = status.value.kill_attempts + 1,
                        outstanding = kills.len(),
                        "kill requests sent"
                    );
                }
                Ok(outcome)
            }
            Err(e) if e.is_conflict() => {
                debug!(instance = %name, error = %e, "deletion raced, next pass retries");
                Ok(DestroyOutcome::Waiting {
                    outstanding: live.len(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}
