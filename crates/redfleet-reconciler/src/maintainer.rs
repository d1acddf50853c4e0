//! Maintain loop — keeps observed state current and heals slaves.
//!
//! Status updates from the offer source are written onto task records as
//! they arrive. On every tick (and after every applied update) each
//! `Starting`/`Running` instance is evaluated, as is a `Pending` instance
//! whose master is already launched:
//!
//! - dead slaves are removed and a replacement slave is queued
//! - a dead master fails the instance (no automatic promotion)
//! - tasks stuck in `Staging` are killed, then replaced once the kill lands;
//!   after `max_kill_attempts` unanswered kills the task is given up as dead
//! - `Starting` becomes `Running` once every task reports running
//!
//! Kill requests go out only after the evaluation that decided them has
//! committed. An evaluation that finds nothing to change writes nothing.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use redfleet_core::ReconcilerConfig;
use redfleet_offers::{OfferSource, StatusUpdate};
use redfleet_state::*;

use crate::error::ReconcileResult;

/// Optimistic commit attempts per evaluation before deferring to the next tick.
const MAX_COMMIT_ATTEMPTS: usize = 5;

/// What a status update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// Same status as recorded, or the task already ended.
    Unchanged,
    /// No record for the task; tracked as a possible orphan.
    Orphan,
}

/// A task the scheduler reports but the store does not know.
#[derive(Debug, Clone, Copy)]
struct Orphan {
    first_seen_ms: u64,
    status: TaskStatus,
}

/// Writes and kill requests decided by one evaluation.
struct Plan {
    batch: Batch,
    kills: Vec<TaskId>,
}

pub struct Maintainer {
    store: StateStore,
    source: Arc<dyn OfferSource>,
    config: ReconcilerConfig,
    shutdown: watch::Receiver<bool>,
    orphans: HashMap<TaskId, Orphan>,
}

impl Maintainer {
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
            orphans: HashMap::new(),
        }
    }

    /// Consume status updates and evaluate on a fixed tick until shutdown.
    pub async fn run(mut self) -> ReconcileResult<()> {
        let mut updates = self.source.status_updates().await?;
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.config.maintain_interval());
        info!(
            interval_ms = self.config.maintain_interval_ms,
            "maintain loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                next = updates.next() => {
                    let Some(update) = next else {
                        warn!("status stream closed");
                        break;
                    };
                    let task_id = update.task_id.clone();
                    if let Err(e) = self.apply_status_update(update, epoch_millis()).await {
                        error!(%task_id, error = %e, "status update not applied");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_all(epoch_millis()).await {
                        error!(error = %e, "maintain pass failed");
                    }
                }
            }
        }

        info!("maintain loop stopped");
        Ok(())
    }

    /// Record a reported status on its task and re-evaluate the instance.
    pub async fn apply_status_update(
        &mut self,
        update: StatusUpdate,
        now_ms: u64,
    ) -> ReconcileResult<UpdateOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let read = retry_transient("read task", &self.shutdown, || {
                self.store.get_task(&update.task_id)
            })
            .await?;
            let Some(read) = read else {
                self.track_orphan(&update, now_ms);
                return Ok(UpdateOutcome::Orphan);
            };
            self.orphans.remove(&update.task_id);

            if read.value.status == update.status || read.value.status.is_terminal() {
                return Ok(UpdateOutcome::Unchanged);
            }

            let mut task = read.value.clone();
            task.status = update.status;
            task.last_status_update_ms = now_ms;
            let result = retry_transient("record task status", &self.shutdown, || {
                let mut batch = self.store.batch();
                batch.put_task(&task, Some(read.version));
                self.store.commit(batch)
            })
            .await;

            match result {
                Ok(()) => {
                    if update.status.is_terminal() {
                        info!(
                            instance = %task.instance_name,
                            task_id = %task.task_id,
                            status = %update.status,
                            message = update.message.as_deref().unwrap_or(""),
                            "task ended"
                        );
                    } else {
                        debug!(task_id = %task.task_id, status = %update.status, "task status updated");
                    }
                    self.reconcile_instance(&task.instance_name, now_ms).await?;
                    return Ok(UpdateOutcome::Applied);
                }
                Err(e) if e.is_conflict() && attempt < MAX_COMMIT_ATTEMPTS => {
                    debug!(task_id = %update.task_id, error = %e, "task update raced, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn track_orphan(&mut self, update: &StatusUpdate, now_ms: u64) {
        if update.status.is_terminal() {
            if self.orphans.remove(&update.task_id).is_some() {
                debug!(task_id = %update.task_id, "orphaned task ended");
            }
            return;
        }
        let orphan = self.orphans.entry(update.task_id.clone()).or_insert(Orphan {
            first_seen_ms: now_ms,
            status: update.status,
        });
        orphan.status = update.status;
    }

    /// Evaluate every active instance, then deal with overdue orphans.
    ///
    /// Returns the number of instances whose state changed.
    pub async fn reconcile_all(&mut self, now_ms: u64) -> ReconcileResult<usize> {
        let active = retry_transient("list active instances", &self.shutdown, || {
            self.store.list_statuses_in(&[
                InstancePhase::Pending,
                InstancePhase::Starting,
                InstancePhase::Running,
            ])
        })
        .await?;

        let mut changed = 0;
        for status in active.iter().filter(|s| s.value.is_maintained()) {
            let name = &status.value.name;
            match self.reconcile_instance(name, now_ms).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => warn!(instance = %name, error = %e, "instance evaluation failed"),
            }
        }

        self.reap_orphans(now_ms).await?;
        Ok(changed)
    }

    async fn reap_orphans(&mut self, now_ms: u64) -> ReconcileResult<()> {
        let grace = self.config.orphan_grace_ms;
        let due: Vec<(TaskId, TaskStatus)> = self
            .orphans
            .iter()
            .filter(|(_, o)| now_ms.saturating_sub(o.first_seen_ms) >= grace)
            .map(|(id, o)| (id.clone(), o.status))
            .collect();

        for (task_id, status) in due {
            let known = retry_transient("read task", &self.shutdown, || {
                self.store.get_task(&task_id)
            })
            .await?;
            if known.is_some() {
                // The launch was recorded after its first status report.
                self.orphans.remove(&task_id);
                self.apply_status_update(StatusUpdate::new(&task_id, status), now_ms)
                    .await?;
                continue;
            }

            warn!(%task_id, "killing orphaned task");
            if let Err(e) = self.source.kill_task(&task_id).await {
                warn!(%task_id, error = %e, "orphan kill failed");
            }
            // Retried after another grace period unless a terminal update arrives.
            if let Some(orphan) = self.orphans.get_mut(&task_id) {
                orphan.first_seen_ms = now_ms;
            }
        }
        Ok(())
    }

    /// Evaluate one instance. Returns whether anything was written.
    pub async fn reconcile_instance(&self, name: &str, now_ms: u64) -> ReconcileResult<bool> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let plan = retry_transient("evaluate instance", &self.shutdown, || {
                self.plan(name, now_ms)
            })
            .await?;
            let Some(plan) = plan else {
                return Ok(false);
            };

            let result = retry_transient("commit instance", &self.shutdown, || {
                self.store.commit(plan.batch.clone())
            })
            .await;
            match result {
                Ok(()) => {
                    for task_id in &plan.kills {
                        if let Err(e) = self.source.kill_task(task_id).await {
                            warn!(instance = %name, %task_id, error = %e, "kill request failed");
                        }
                    }
                    return Ok(true);
                }
                Err(e) if e.is_conflict() => {
                    debug!(instance = %name, attempt, error = %e, "evaluation raced, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!(instance = %name, "instance contended, deferring to next tick");
        Ok(false)
    }

    /// Decide what one instance needs. `None` when nothing changes.
    fn plan(&self, name: &str, now_ms: u64) -> StateResult<Option<Plan>> {
        let Some(read) = self.store.get_status(name)? else {
            return Ok(None);
        };
        if !read.value.is_maintained() {
            return Ok(None);
        }
        let Some(spec) = self.store.get_spec(name)? else {
            return Ok(None);
        };
        let tasks: HashMap<TaskId, Versioned<TaskRecord>> = self
            .store
            .list_tasks_for_instance(name)?
            .into_iter()
            .map(|t| (t.value.task_id.clone(), t))
            .collect();

        let mut status = read.value.clone();
        let mut plan = Plan {
            batch: self.store.batch(),
            kills: Vec::new(),
        };

        let master = status.master_task_id.as_ref().map(|id| (id.clone(), tasks.get(id)));
        let master_running = match master {
            Some((_, Some(task))) if self.is_live(&task.value, now_ms) => {
                self.check_staging(task, now_ms, &mut plan);
                task.value.status == TaskStatus::Running
            }
            Some((master_id, task)) => {
                let observed = task.map_or_else(|| "missing".to_string(), |t| describe(&t.value));
                error!(
                    instance = %name,
                    task_id = %master_id,
                    status = %observed,
                    "master task lost, instance failed"
                );
                status.phase = InstancePhase::Failed;
                status.error = Some(format!(
                    "master task {master_id} {observed}; no automatic promotion, delete and recreate the instance"
                ));
                status.last_updated_ms = now_ms;
                plan.batch.put_status(&status, Some(read.version));
                return Ok(Some(plan));
            }
            // Maintained instances always have a launched master.
            None => false,
        };

        let mut survivors = Vec::with_capacity(status.slave_task_ids.len());
        let mut all_slaves_running = true;
        for id in &status.slave_task_ids {
            match tasks.get(id) {
                Some(task) if self.is_live(&task.value, now_ms) => {
                    self.check_staging(task, now_ms, &mut plan);
                    all_slaves_running &= task.value.status == TaskStatus::Running;
                    survivors.push(id.clone());
                }
                Some(task) => {
                    warn!(
                        instance = %name,
                        task_id = %id,
                        status = %describe(&task.value),
                        "slave task ended, scheduling replacement"
                    );
                    plan.batch.delete_task(id, Some(task.version));
                }
                None => {
                    warn!(instance = %name, task_id = %id, "slave task record missing, scheduling replacement");
                }
            }
        }
        status.slave_task_ids = survivors;

        let queued_slaves = self
            .store
            .list_work_items_for_instance(name)?
            .iter()
            .filter(|w| w.value.role == TaskRole::Slave)
            .count();
        let wanted = spec.value.slave_count as usize;
        let missing = wanted.saturating_sub(status.slave_task_ids.len() + queued_slaves);
        if missing > 0 {
            let cursor = self.store.queue_cursor()?;
            for _ in 0..missing {
                plan.batch.enqueue(&cursor, name, TaskRole::Slave, now_ms);
            }
            info!(instance = %name, count = missing, "replacement slaves queued");
        }

        if status.phase == InstancePhase::Starting
            && master_running
            && all_slaves_running
            && status.slave_task_ids.len() == wanted
            && queued_slaves == 0
            && missing == 0
        {
            status.phase = InstancePhase::Running;
            info!(instance = %name, slaves = wanted, "instance running");
        }

        // Enqueues are sized from this status, so they commit against its version.
        if status != read.value || missing > 0 {
            status.last_updated_ms = now_ms;
            plan.batch.put_status(&status, Some(read.version));
        }

        if plan.batch.is_empty() && plan.kills.is_empty() {
            return Ok(None);
        }
        Ok(Some(plan))
    }

    /// Whether a task still counts towards its instance.
    fn is_live(&self, task: &TaskRecord, now_ms: u64) -> bool {
        !task.status.is_terminal() && !self.kills_exhausted(task, now_ms)
    }

    /// A staging task whose last permitted kill went unanswered.
    fn kills_exhausted(&self, task: &TaskRecord, now_ms: u64) -> bool {
        task.status == TaskStatus::Staging
            && task.kill_attempts >= self.config.max_kill_attempts
            && task
                .kill_requested_at_ms
                .is_some_and(|at| now_ms.saturating_sub(at) >= self.config.kill_timeout_ms)
    }

    /// Kill a task stuck in `Staging`, re-killing if the first kill was lost.
    fn check_staging(&self, task: &Versioned<TaskRecord>, now_ms: u64, plan: &mut Plan) {
        if task.value.status != TaskStatus::Staging {
            return;
        }
        let due = match task.value.kill_requested_at_ms {
            None => {
                now_ms.saturating_sub(task.value.created_at_ms) >= self.config.staging_timeout_ms
            }
            Some(at) => now_ms.saturating_sub(at) >= self.config.kill_timeout_ms,
        };
        if !due {
            return;
        }
        warn!(
            instance = %task.value.instance_name,
            task_id = %task.value.task_id,
            attempt = task.value.kill_attempts + 1,
            "task stuck in staging, killing"
        );
        let mut record = task.value.clone();
        record.kill_requested_at_ms = Some(now_ms);
        record.kill_attempts += 1;
        plan.batch.put_task(&record, Some(task.version));
        plan.kills.push(record.task_id);
    }
}

fn describe(task: &TaskRecord) -> String {
    if task.status.is_terminal() {
        task.status.to_string()
    } else {
        format!("stuck in {} after {} kills", task.status, task.kill_attempts)
    }
}
