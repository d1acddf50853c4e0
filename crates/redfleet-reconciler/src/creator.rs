//! Create loop — turns queued work items into launched tasks.
//!
//! Offers are handled one at a time: the queue is read, the first
//! eligible item that fits is launched, and the launch is recorded in one
//! atomic batch (task record, instance status, queue removal). Every other
//! offer is declined straight away.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use redfleet_core::ReconcilerConfig;
use redfleet_offers::{Offer, OfferError, OfferSource, TaskSpec};
use redfleet_state::*;

use crate::error::ReconcileResult;
use crate::matcher::{PendingTask, Requirement, first_fit};

/// Optimistic commit attempts per launch before giving up.
const MAX_COMMIT_ATTEMPTS: usize = 5;

/// What happened to one offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    Launched {
        task_id: TaskId,
        instance_name: InstanceName,
        role: TaskRole,
    },
    Declined(DeclineReason),
    LaunchFailed {
        instance_name: InstanceName,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    /// The offer was void before it could be used.
    Expired,
    /// No eligible work item fits.
    NoFit,
}

/// A queue item joined with the spec it launches.
#[derive(Debug, Clone)]
struct QueueEntry {
    item: Versioned<WorkItem>,
    task: PendingTask,
    redis_image: String,
}

/// Queue snapshot: launchable entries plus items whose instance is gone.
struct QueueSnapshot {
    entries: Vec<QueueEntry>,
    stale: Vec<Versioned<WorkItem>>,
}

/// Whether a launched task made it into the store.
enum Recorded {
    Yes,
    /// The instance left the create path while the task was launching.
    Unwanted(&'static str),
}

pub struct Creator {
    store: StateStore,
    source: Arc<dyn OfferSource>,
    config: ReconcilerConfig,
    shutdown: watch::Receiver<bool>,
}

impl Creator {
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

    /// Consume the offer stream until shutdown.
    pub async fn run(self) -> ReconcileResult<()> {
        let mut offers = self.source.offers().await?;
        let mut shutdown = self.shutdown.clone();
        info!("create loop started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                next = offers.next() => {
                    let Some(offer) = next else {
                        warn!("offer stream closed");
                        break;
                    };
                    let offer_id = offer.offer_id.clone();
                    if let Err(e) = self.handle_offer(offer, epoch_millis()).await {
                        error!(%offer_id, error = %e, "offer handling failed");
                    }
                }
            }
        }

        info!("create loop stopped");
        Ok(())
    }

    /// Match one offer against the pending queue and act on it.
    pub async fn handle_offer(&self, offer: Offer, now_ms: u64) -> ReconcileResult<OfferOutcome> {
        if offer.expired(now_ms) {
            debug!(offer_id = %offer.offer_id, "offer expired before use");
            self.decline(&offer).await;
            return Ok(OfferOutcome::Declined(DeclineReason::Expired));
        }

        let snapshot =
            match retry_transient("load pending queue", &self.shutdown, || self.snapshot()).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.decline(&offer).await;
                    return Err(e.into());
                }
            };
        self.prune(&snapshot.stale);

        let pending: Vec<PendingTask> = snapshot.entries.iter().map(|e| e.task.clone()).collect();
        let Some(index) = first_fit(&offer, &pending) else {
            debug!(
                offer_id = %offer.offer_id,
                queued = pending.len(),
                "no work item fits offer"
            );
            self.decline(&offer).await;
            return Ok(OfferOutcome::Declined(DeclineReason::NoFit));
        };
        let entry = &snapshot.entries[index];
        let task = &entry.task;

        let spec = TaskSpec {
            instance_name: task.instance_name.clone(),
            role: task.role,
            redis_image: entry.redis_image.clone(),
            memory_mb: task.requirement.memory_mb,
            cpu: task.requirement.cpu,
            ports: task.requirement.ports,
        };

        match self.source.launch_task(&offer.offer_id, spec).await {
            Ok(task_id) => {
                self.record_launch(entry, &offer, &task_id, now_ms).await?;
                Ok(OfferOutcome::Launched {
                    task_id,
                    instance_name: task.instance_name.clone(),
                    role: task.role,
                })
            }
            Err(e @ (OfferError::OfferExpired(_) | OfferError::UnknownOffer(_))) => {
                debug!(offer_id = %offer.offer_id, error = %e, "offer gone before launch");
                Ok(OfferOutcome::Declined(DeclineReason::Expired))
            }
            Err(e) => {
                warn!(
                    instance = %task.instance_name,
                    role = %task.role,
                    offer_id = %offer.offer_id,
                    error = %e,
                    "launch failed"
                );
                self.decline(&offer).await;
                let error = e.to_string();
                self.record_failure(entry, &error, now_ms).await?;
                Ok(OfferOutcome::LaunchFailed {
                    instance_name: task.instance_name.clone(),
                    error,
                })
            }
        }
    }

    async fn decline(&self, offer: &Offer) {
        if let Err(e) = self.source.decline_offer(&offer.offer_id).await {
            warn!(offer_id = %offer.offer_id, error = %e, "failed to decline offer");
        }
    }

    /// Read the queue and classify every item.
    fn snapshot(&self) -> StateResult<QueueSnapshot> {
        // instance name -> (spec, master launched), None when not launchable.
        let mut instances: HashMap<String, Option<(InstanceSpec, bool)>> = HashMap::new();
        let mut snapshot = QueueSnapshot {
            entries: Vec::new(),
            stale: Vec::new(),
        };

        for item in self.store.list_work_items()? {
            let name = item.value.instance_name.clone();
            if !instances.contains_key(&name) {
                let target = self.launch_target(&name)?;
                instances.insert(name.clone(), target);
            }
            match instances.get(&name) {
                Some(Some((spec, master_launched))) => {
                    let role = item.value.role;
                    snapshot.entries.push(QueueEntry {
                        task: PendingTask {
                            seq: item.value.seq,
                            instance_name: name,
                            role,
                            requirement: Requirement::for_task(spec.memory_mb, &self.config),
                            eligible: role == TaskRole::Master || *master_launched,
                        },
                        redis_image: spec.redis_image.clone(),
                        item,
                    });
                }
                _ => snapshot.stale.push(item),
            }
        }
        Ok(snapshot)
    }

    fn launch_target(&self, name: &str) -> StateResult<Option<(InstanceSpec, bool)>> {
        let Some(spec) = self.store.get_spec(name)? else {
            return Ok(None);
        };
        let Some(status) = self.store.get_status(name)? else {
            return Ok(None);
        };
        match status.value.phase {
            InstancePhase::Pending | InstancePhase::Starting | InstancePhase::Running => Ok(Some((
                spec.value,
                status.value.master_task_id.is_some(),
            ))),
            _ => Ok(None),
        }
    }

    /// Drop queue items whose instance is missing, failed or being deleted.
    fn prune(&self, stale: &[Versioned<WorkItem>]) {
        if stale.is_empty() {
            return;
        }
        let mut batch = self.store.batch();
        for item in stale {
            batch.remove_work_item(item.value.seq, Some(item.version));
        }
        match self.store.commit(batch) {
            Ok(()) => debug!(count = stale.len(), "dropped stale work items"),
            Err(e) => debug!(error = %e, "stale work items not dropped, retrying next offer"),
        }
    }

    async fn record_launch(
        &self,
        entry: &QueueEntry,
        offer: &Offer,
        task_id: &str,
        now_ms: u64,
    ) -> ReconcileResult<()> {
        let record = TaskRecord {
            task_id: task_id.to_string(),
            instance_name: entry.task.instance_name.clone(),
            role: entry.task.role,
            node_id: offer.node_id.clone(),
            offer_id: offer.offer_id.clone(),
            memory_mb: entry.task.requirement.memory_mb,
            status: TaskStatus::Staging,
            created_at_ms: now_ms,
            last_status_update_ms: now_ms,
            kill_requested_at_ms: None,
            kill_attempts: 0,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = retry_transient("record launch", &self.shutdown, || {
                self.try_record_launch(entry, &record, now_ms)
            })
            .await;
            match result {
                Ok(Recorded::Yes) => {
                    info!(
                        instance = %record.instance_name,
                        role = %record.role,
                        %task_id,
                        node_id = %record.node_id,
                        "task launched"
                    );
                    return Ok(());
                }
                Ok(Recorded::Unwanted(reason)) => {
                    warn!(instance = %record.instance_name, %task_id, reason, "launched task not wanted, killing it");
                    if let Err(e) = self.source.kill_task(task_id).await {
                        warn!(%task_id, error = %e, "kill of unrecorded task failed");
                    }
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < MAX_COMMIT_ATTEMPTS => {
                    debug!(%task_id, error = %e, "launch record raced, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Record the launch against the status version it was read at.
    ///
    /// A task is only recorded together with its status update, so a
    /// concurrent delete or removal turns into a conflict and a re-read.
    fn try_record_launch(
        &self,
        entry: &QueueEntry,
        record: &TaskRecord,
        now_ms: u64,
    ) -> StateResult<Recorded> {
        let name = &record.instance_name;
        let Some(read) = self.store.get_status(name)? else {
            return Ok(Recorded::Unwanted("instance removed"));
        };
        if !matches!(
            read.value.phase,
            InstancePhase::Pending | InstancePhase::Starting | InstancePhase::Running
        ) {
            return Ok(Recorded::Unwanted("instance no longer launching"));
        }
        let items = self.store.list_work_items_for_instance(name)?;
        let seq = entry.item.value.seq;
        let Some(own) = items.iter().find(|w| w.value.seq == seq) else {
            return Ok(Recorded::Unwanted("work item already dropped"));
        };

        let mut status = read.value.clone();
        match record.role {
            TaskRole::Master => status.master_task_id = Some(record.task_id.clone()),
            TaskRole::Slave => status.slave_task_ids.push(record.task_id.clone()),
        }
        let remaining = items.len() - 1;
        if status.phase == InstancePhase::Pending && remaining == 0 {
            status.phase = InstancePhase::Starting;
        }
        status.last_updated_ms = now_ms;

        let mut batch = self.store.batch();
        batch
            .put_task(record, None)
            .remove_work_item(seq, Some(own.version))
            .put_status(&status, Some(read.version));
        self.store.commit(batch)?;
        Ok(Recorded::Yes)
    }

    async fn record_failure(
        &self,
        entry: &QueueEntry,
        error: &str,
        now_ms: u64,
    ) -> ReconcileResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = retry_transient("record launch failure", &self.shutdown, || {
                self.try_record_failure(entry, error, now_ms)
            })
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() && attempt < MAX_COMMIT_ATTEMPTS => {
                    debug!(instance = %entry.task.instance_name, error = %e, "failure record raced, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Bump the item's attempt count, failing the instance at the ceiling.
    fn try_record_failure(&self, entry: &QueueEntry, error: &str, now_ms: u64) -> StateResult<()> {
        let name = &entry.task.instance_name;
        let items = self.store.list_work_items_for_instance(name)?;
        let Some(current) = items.iter().find(|w| w.value.seq == entry.item.value.seq) else {
            return Ok(());
        };

        let mut item = current.value.clone();
        item.attempts += 1;
        item.last_error = Some(error.to_string());

        let mut batch = self.store.batch();
        if item.attempts < self.config.max_launch_attempts {
            batch.update_work_item(&item, current.version);
            self.store.commit(batch)?;
            debug!(instance = %name, attempts = item.attempts, "work item kept at queue position");
            return Ok(());
        }

        for w in &items {
            batch.remove_work_item(w.value.seq, Some(w.version));
        }
        if let Some(read) = self.store.get_status(name)? {
            if read.value.phase != InstancePhase::DeleteRequested && !read.value.phase.is_terminal() {
                let mut status = read.value.clone();
                status.phase = InstancePhase::Failed;
                status.error = Some(format!(
                    "{} launch failed {} times: {error}",
                    item.role, item.attempts
                ));
                status.last_updated_ms = now_ms;
                batch.put_status(&status, Some(read.version));
            }
        }
        self.store.commit(batch)?;
        error!(
            instance = %name,
            role = %item.role,
            attempts = item.attempts,
            %error,
            "launch retries exhausted, instance failed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CreateRequest, Gateway};
    use redfleet_offers::SimulatedCluster;

    struct Fixture {
        gateway: Gateway,
        cluster: Arc<SimulatedCluster>,
        creator: Creator,
        _shutdown: watch::Sender<bool>,
    }

    fn fixture(config: ReconcilerConfig) -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = Arc::new(SimulatedCluster::manual());
        let (tx, rx) = watch::channel(false);
        Fixture {
            gateway: Gateway::new(store.clone(), "redis:3.0-alpine"),
            creator: Creator::new(store, cluster.clone(), config, rx),
            cluster,
            _shutdown: tx,
        }
    }

    fn create(gateway: &Gateway, name: &str, memory_mb: i64, slave_count: i64) {
        gateway
            .create_instance(&CreateRequest {
                name: name.to_string(),
                memory_mb,
                slave_count,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn expired_offer_is_declined_without_touching_queue() {
        let f = fixture(ReconcilerConfig::default());
        create(&f.gateway, "a", 256, 0);
        let offer = f.cluster.inject_offer("node-1", 2.0, 512, vec![6379]).await;

        let outcome = f
            .creator
            .handle_offer(offer.clone(), offer.expires_at_ms)
            .await
            .unwrap();
        assert_eq!(outcome, OfferOutcome::Declined(DeclineReason::Expired));
        assert_eq!(f.gateway.store().list_work_items().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn slaves_wait_for_their_master() {
        let f = fixture(ReconcilerConfig::default());
        create(&f.gateway, "big", 4096, 1);
        let offer = f.cluster.inject_offer("node-1", 2.0, 512, vec![6379]).await;

        let outcome = f.creator.handle_offer(offer, epoch_millis()).await.unwrap();
        assert_eq!(outcome, OfferOutcome::Declined(DeclineReason::NoFit));
    }

    #[tokio::test]
    async fn single_task_instance_goes_to_starting() {
        let f = fixture(ReconcilerConfig::default());
        create(&f.gateway, "solo", 128, 0);
        let offer = f.cluster.inject_offer("node-1", 1.0, 128, vec![6379]).await;

        let outcome = f.creator.handle_offer(offer, epoch_millis()).await.unwrap();
        let OfferOutcome::Launched { task_id, role, .. } = outcome else {
            panic!("expected launch, got {outcome:?}");
        };
        assert_eq!(role, TaskRole::Master);

        let status = f.gateway.get_instance_status("solo").unwrap();
        assert_eq!(status.phase, InstancePhase::Starting);
        assert_eq!(status.master_task_id.as_deref(), Some(task_id.as_str()));

        let record = f.gateway.store().get_task(&task_id).unwrap().unwrap();
        assert_eq!(record.value.status, TaskStatus::Staging);
        assert!(f.gateway.store().list_work_items().unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_launch_failure_fails_instance() {
        let config = ReconcilerConfig {
            max_launch_attempts: 2,
            ..ReconcilerConfig::default()
        };
        let f = fixture(config);
        create(&f.gateway, "doomed", 256, 1);
        f.cluster.fail_next_launches(2).await;

        let offer = f.cluster.inject_offer("node-1", 1.0, 256, vec![6379]).await;
        let outcome = f.creator.handle_offer(offer, epoch_millis()).await.unwrap();
        assert!(matches!(outcome, OfferOutcome::LaunchFailed { .. }));

        // The item keeps its queue position.
        let head = f.gateway.store().list_work_items().unwrap().remove(0);
        assert_eq!(head.value.seq, 1);
        assert_eq!(head.value.attempts, 1);
        assert_eq!(
            f.gateway.get_instance_status("doomed").unwrap().phase,
            InstancePhase::Pending
        );

        let offer = f.cluster.inject_offer("node-1", 1.0, 256, vec![6379]).await;
        let now = epoch_millis() + 1_000;
        f.creator.handle_offer(offer, now).await.unwrap();

        let status = f.gateway.get_instance_status("doomed").unwrap();
        assert_eq!(status.phase, InstancePhase::Failed);
        assert_eq!(status.last_updated_ms, now);
        assert!(status.error.unwrap().contains("launch failed 2 times"));
        assert!(f.gateway.store().list_work_items().unwrap().is_empty());
    }

    #[tokio::test]
    async fn items_of_deleted_instances_are_pruned() {
        let f = fixture(ReconcilerConfig::default());
        create(&f.gateway, "gone", 256, 2);
        f.gateway.delete_instance("gone").unwrap();

        let offer = f.cluster.inject_offer("node-1", 4.0, 4096, vec![6379]).await;
        let outcome = f.creator.handle_offer(offer, epoch_millis()).await.unwrap();
        assert_eq!(outcome, OfferOutcome::Declined(DeclineReason::NoFit));
        assert!(f.gateway.store().list_work_items().unwrap().is_empty());
    }
}
