//! In-process simulated cluster.
//!
//! Models a set of nodes with CPU, memory and port capacity. Each offer
//! round advertises the free capacity of every node that has no offer
//! outstanding. Launches allocate from the offer's node and report
//! `Staging`, then `Running` after the configured start-up delay. Kills
//! report `Killed` and free the resources again.
//!
//! Status reports never block the caller. When the consumer lags behind
//! the stream capacity, reports wait in an ordered backlog that a
//! background task feeds into the stream.
//!
//! Test hooks can inject offers, fail launches, drop kill requests and
//! report arbitrary task status.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use redfleet_core::{ClusterConfig, NodeConfig};
use redfleet_state::{NodeId, TaskId, TaskStatus, epoch_millis};

use crate::error::{OfferError, OfferResult};
use crate::source::{OfferFuture, OfferSource};
use crate::stream::{OfferStream, STREAM_CAPACITY, StatusStream};
use crate::types::{Offer, StatusUpdate, TaskSpec};

/// Offer validity used by [`SimulatedCluster::manual`].
const MANUAL_OFFER_TTL_MS: u64 = 60_000;

struct Node {
    free_cpu: f64,
    free_memory_mb: u64,
    free_ports: BTreeSet<u16>,
    /// Offer currently advertising this node's capacity.
    offered: Option<String>,
}

impl Node {
    fn from_config(config: &NodeConfig) -> Self {
        Self {
            free_cpu: config.cpu,
            free_memory_mb: config.memory_mb,
            free_ports: (config.port_start..=config.port_end).collect(),
            offered: None,
        }
    }

    fn has_capacity(&self) -> bool {
        self.free_cpu > 0.0 && self.free_memory_mb > 0
    }
}

struct SimTask {
    node_id: NodeId,
    cpu: f64,
    memory_mb: u64,
    ports: Vec<u16>,
    status: TaskStatus,
}

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<NodeId, Node>,
    offers: HashMap<String, Offer>,
    tasks: HashMap<TaskId, SimTask>,
    failing_launches: u32,
    drop_kills: bool,
}

impl ClusterState {
    fn release_offer(&mut self, offer: &Offer) {
        if let Some(node) = self.nodes.get_mut(&offer.node_id) {
            if node.offered.as_deref() == Some(offer.offer_id.as_str()) {
                node.offered = None;
            }
        }
    }

    /// Move a live task to a terminal status and free its resources.
    ///
    /// Returns false if the task is unknown or already terminal.
    fn finish(&mut self, task_id: &str, status: TaskStatus) -> bool {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        task.status = status;
        if let Some(node) = self.nodes.get_mut(&task.node_id) {
            node.free_cpu += task.cpu;
            node.free_memory_mb += task.memory_mb;
            node.free_ports.extend(task.ports.iter().copied());
        }
        true
    }
}

/// Ordered, non-blocking sender of status reports.
///
/// While `backlog` is non-empty a flush task owns delivery, and every new
/// report queues behind it.
#[derive(Clone)]
struct StatusOutbox {
    tx: mpsc::Sender<StatusUpdate>,
    backlog: Arc<Mutex<VecDeque<StatusUpdate>>>,
}

impl StatusOutbox {
    fn new(tx: mpsc::Sender<StatusUpdate>) -> Self {
        Self {
            tx,
            backlog: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    async fn emit(&self, update: StatusUpdate) {
        let mut backlog = self.backlog.lock().await;
        if !backlog.is_empty() {
            backlog.push_back(update);
            return;
        }
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => debug!("status stream dropped"),
            Err(TrySendError::Full(update)) => {
                debug!(task_id = %update.task_id, "status stream full, backlogging");
                backlog.push_back(update);
                tokio::spawn(self.clone().flush());
            }
        }
    }

    /// Deliver the backlog in order, then exit once it is empty.
    async fn flush(self) {
        loop {
            let Some(next) = self.backlog.lock().await.front().cloned() else {
                return;
            };
            if self.tx.send(next).await.is_err() {
                debug!("status stream dropped, discarding backlog");
                self.backlog.lock().await.clear();
                return;
            }
            let mut backlog = self.backlog.lock().await;
            backlog.pop_front();
            if backlog.is_empty() {
                return;
            }
        }
    }

    async fn backlog_len(&self) -> usize {
        self.backlog.lock().await.len()
    }
}

/// [`OfferSource`] backed by simulated nodes.
pub struct SimulatedCluster {
    state: Arc<Mutex<ClusterState>>,
    offer_tx: mpsc::Sender<Offer>,
    offer_rx: Mutex<Option<mpsc::Receiver<Offer>>>,
    status: StatusOutbox,
    status_rx: Mutex<Option<mpsc::Receiver<StatusUpdate>>>,
    offer_interval: Duration,
    offer_ttl_ms: u64,
    /// `None` leaves launched tasks in `Staging` until a test reports otherwise.
    task_startup: Option<Duration>,
    next_id: AtomicU64,
}

impl SimulatedCluster {
    /// Cluster with the configured nodes and timings.
    pub fn new(config: &ClusterConfig) -> Self {
        let nodes = config
            .nodes
            .iter()
            .map(|n| (n.id.clone(), Node::from_config(n)))
            .collect();
        Self::build(
            nodes,
            Duration::from_millis(config.offer_interval_ms),
            config.offer_ttl_ms,
            Some(Duration::from_millis(config.task_startup_ms)),
        )
    }

    /// Cluster with no nodes whose tasks never start on their own.
    ///
    /// Offers come only from [`inject_offer`](Self::inject_offer) and task
    /// status only from [`report_status`](Self::report_status).
    pub fn manual() -> Self {
        Self::build(
            BTreeMap::new(),
            Duration::from_secs(1),
            MANUAL_OFFER_TTL_MS,
            None,
        )
    }

    fn build(
        nodes: BTreeMap<NodeId, Node>,
        offer_interval: Duration,
        offer_ttl_ms: u64,
        task_startup: Option<Duration>,
    ) -> Self {
        let (offer_tx, offer_rx) = mpsc::channel(STREAM_CAPACITY);
        let (status_tx, status_rx) = mpsc::channel(STREAM_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                nodes,
                ..ClusterState::default()
            })),
            offer_tx,
            offer_rx: Mutex::new(Some(offer_rx)),
            status: StatusOutbox::new(status_tx),
            status_rx: Mutex::new(Some(status_rx)),
            offer_interval,
            offer_ttl_ms,
            task_startup,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish offers every `offer_interval` until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.offer_interval);
        info!(interval_ms = self.offer_interval.as_millis() as u64, "simulated cluster started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for offer in self.offer_round(epoch_millis()).await {
                        tokio::select! {
                            sent = self.offer_tx.send(offer) => {
                                if sent.is_err() {
                                    debug!("offer stream dropped, stopping offers");
                                    return;
                                }
                            }
                            _ = shutdown.changed() => return,
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("simulated cluster shutting down");
                    break;
                }
            }
        }
    }

    /// Expire stale offers and create one offer per idle node.
    ///
    /// The returned offers are registered but not yet published.
    pub async fn offer_round(&self, now_ms: u64) -> Vec<Offer> {
        let mut state = self.state.lock().await;

        let expired: Vec<Offer> = state
            .offers
            .values()
            .filter(|o| o.expired(now_ms))
            .cloned()
            .collect();
        for offer in expired {
            debug!(offer_id = %offer.offer_id, "offer expired");
            state.offers.remove(&offer.offer_id);
            state.release_offer(&offer);
        }

        let mut fresh = Vec::new();
        for (node_id, node) in state.nodes.iter_mut() {
            if node.offered.is_some() || !node.has_capacity() {
                continue;
            }
            let offer = Offer {
                offer_id: format!("offer-{}", self.next_id()),
                node_id: node_id.clone(),
                cpu: node.free_cpu,
                memory_mb: node.free_memory_mb,
                ports: node.free_ports.iter().copied().collect(),
                expires_at_ms: now_ms + self.offer_ttl_ms,
            };
            node.offered = Some(offer.offer_id.clone());
            fresh.push(offer);
        }
        for offer in &fresh {
            state.offers.insert(offer.offer_id.clone(), offer.clone());
        }
        fresh
    }

    /// Register an offer that is not backed by a configured node.
    ///
    /// The offer is returned rather than published; hand it to the consumer
    /// directly.
    pub async fn inject_offer(
        &self,
        node_id: &str,
        cpu: f64,
        memory_mb: u64,
        ports: Vec<u16>,
    ) -> Offer {
        let offer = Offer {
            offer_id: format!("offer-{}", self.next_id()),
            node_id: node_id.to_string(),
            cpu,
            memory_mb,
            ports,
            expires_at_ms: epoch_millis() + self.offer_ttl_ms,
        };
        let mut state = self.state.lock().await;
        state.offers.insert(offer.offer_id.clone(), offer.clone());
        offer
    }

    /// Make the next `count` launches fail.
    pub async fn fail_next_launches(&self, count: u32) {
        self.state.lock().await.failing_launches = count;
    }

    /// Silently drop kill requests while set.
    pub async fn drop_kills(&self, drop: bool) {
        self.state.lock().await.drop_kills = drop;
    }

    /// Force a task into `status` and report it.
    pub async fn report_status(&self, task_id: &str, status: TaskStatus) -> OfferResult<()> {
        {
            let mut state = self.state.lock().await;
            if !state.tasks.contains_key(task_id) {
                return Err(OfferError::UnknownTask(task_id.to_string()));
            }
            if status.is_terminal() {
                state.finish(task_id, status);
            } else if let Some(task) = state.tasks.get_mut(task_id) {
                task.status = status;
            }
        }
        self.emit(StatusUpdate::new(task_id, status)).await;
        Ok(())
    }

    pub async fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.state.lock().await.tasks.get(task_id).map(|t| t.status)
    }

    /// Ids of tasks currently in `status`, sorted.
    pub async fn tasks_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        let state = self.state.lock().await;
        let mut ids: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|(_, t)| t.status == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Reports not yet handed to the status stream.
    pub async fn status_backlog(&self) -> usize {
        self.status.backlog_len().await
    }

    async fn emit(&self, update: StatusUpdate) {
        self.status.emit(update).await;
    }

    async fn launch(&self, offer_id: &str, spec: TaskSpec) -> OfferResult<TaskId> {
        let now_ms = epoch_millis();
        let task_id = {
            let mut state = self.state.lock().await;
            let offer = state
                .offers
                .remove(offer_id)
                .ok_or_else(|| OfferError::UnknownOffer(offer_id.to_string()))?;
            state.release_offer(&offer);

            if offer.expired(now_ms) {
                return Err(OfferError::OfferExpired(offer_id.to_string()));
            }
            if state.failing_launches > 0 {
                state.failing_launches -= 1;
                return Err(OfferError::LaunchRejected(
                    "simulated launch failure".to_string(),
                ));
            }
            if offer.memory_mb < spec.memory_mb
                || offer.cpu < spec.cpu
                || offer.ports.len() < spec.ports as usize
            {
                return Err(OfferError::InsufficientResources {
                    offer_id: offer_id.to_string(),
                    reason: format!(
                        "need {} MB / {} cpu / {} ports, have {} MB / {} cpu / {} ports",
                        spec.memory_mb,
                        spec.cpu,
                        spec.ports,
                        offer.memory_mb,
                        offer.cpu,
                        offer.ports.len()
                    ),
                });
            }

            let ports: Vec<u16> = offer.ports[..spec.ports as usize].to_vec();
            if let Some(node) = state.nodes.get_mut(&offer.node_id) {
                node.free_cpu -= spec.cpu;
                node.free_memory_mb = node.free_memory_mb.saturating_sub(spec.memory_mb);
                for port in &ports {
                    node.free_ports.remove(port);
                }
            }

            let task_id = format!("{}.{}.{}", spec.instance_name, spec.role, self.next_id());
            state.tasks.insert(
                task_id.clone(),
                SimTask {
                    node_id: offer.node_id.clone(),
                    cpu: spec.cpu,
                    memory_mb: spec.memory_mb,
                    ports,
                    status: TaskStatus::Staging,
                },
            );
            info!(%task_id, node_id = %offer.node_id, image = %spec.redis_image, "task launched");
            task_id
        };

        self.emit(StatusUpdate::new(&task_id, TaskStatus::Staging))
            .await;

        if let Some(delay) = self.task_startup {
            let state = self.state.clone();
            let outbox = self.status.clone();
            let id = task_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let started = {
                    let mut state = state.lock().await;
                    match state.tasks.get_mut(&id) {
                        Some(task) if task.status == TaskStatus::Staging => {
                            task.status = TaskStatus::Running;
                            true
                        }
                        _ => false,
                    }
                };
                if started {
                    outbox.emit(StatusUpdate::new(&id, TaskStatus::Running)).await;
                }
            });
        }

        Ok(task_id)
    }

    async fn kill(&self, task_id: &str) -> OfferResult<()> {
        let update = {
            let mut state = self.state.lock().await;
            if state.drop_kills {
                debug!(%task_id, "dropping kill request");
                return Ok(());
            }
            match state.tasks.get(task_id).map(|t| t.status) {
                None => {
                    warn!(%task_id, "kill for unknown task");
                    StatusUpdate::new(task_id, TaskStatus::Lost).with_message("unknown task")
                }
                Some(status) if status.is_terminal() => StatusUpdate::new(task_id, status),
                Some(_) => {
                    state.finish(task_id, TaskStatus::Killed);
                    StatusUpdate::new(task_id, TaskStatus::Killed)
                }
            }
        };
        self.emit(update).await;
        Ok(())
    }

    async fn decline(&self, offer_id: &str) -> OfferResult<()> {
        let mut state = self.state.lock().await;
        match state.offers.remove(offer_id) {
            Some(offer) => {
                state.release_offer(&offer);
                debug!(%offer_id, "offer declined");
            }
            None => debug!(%offer_id, "decline for unknown offer"),
        }
        Ok(())
    }
}

impl OfferSource for SimulatedCluster {
    fn offers(&self) -> OfferFuture<'_, OfferStream> {
        Box::pin(async move {
            self.offer_rx
                .lock()
                .await
                .take()
                .map(OfferStream::new)
                .ok_or(OfferError::StreamTaken("offer"))
        })
    }

    fn status_updates(&self) -> OfferFuture<'_, StatusStream> {
        Box::pin(async move {
            self.status_rx
                .lock()
                .await
                .take()
                .map(StatusStream::new)
                .ok_or(OfferError::StreamTaken("status"))
        })
    }

    fn launch_task<'a>(&'a self, offer_id: &'a str, spec: TaskSpec) -> OfferFuture<'a, TaskId> {
        Box::pin(self.launch(offer_id, spec))
    }

    fn kill_task<'a>(&'a self, task_id: &'a str) -> OfferFuture<'a, ()> {
        Box::pin(self.kill(task_id))
    }

    fn decline_offer<'a>(&'a self, offer_id: &'a str) -> OfferFuture<'a, ()> {
        Box::pin(self.decline(offer_id))
    }
}
