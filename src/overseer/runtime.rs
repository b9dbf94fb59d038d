//! The overseer role of one node: campaign, load state, process the queue,
//! flush on a timer, drain on shutdown.

use super::election::{LeaderElector, LeadershipHandle};
use super::message::StateChangeMessage;
use super::processor::{MutationProcessor, OverseerStatus, ProcessOutcome, StatusCell};
use super::queue::{QueueEntry, QueueReceipt, WorkQueue, coalesce};
use super::writer::{FlushReport, StateWriter};
use crate::cluster::{ClusterState, LiveNodesWatcher, ReplicaState, load_cluster_state};
use crate::config::OverseerConfig;
use crate::core::{OverseerError, Result};
use crate::events::ClusterEventBus;
use crate::store::paths::{OVERSEER_ELECTION_PATH, OVERSEER_QUEUE_PATH};
use crate::store::{CoordinationStore, SessionId};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

/// Tasks that live for one leadership term.
struct TermWorkers {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TermWorkers {
    async fn stop(self) {
        self.stop.send_replace(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    event!(Level::WARN, error = %err, "overseer worker failed");
                }
            }
        }
    }
}

pub struct Overseer {
    store: Arc<dyn CoordinationStore>,
    session: SessionId,
    config: OverseerConfig,
    bus: ClusterEventBus,
    status: Arc<StatusCell>,
    queue: Arc<WorkQueue>,
    state: Arc<AsyncMutex<ClusterState>>,
    writer: Mutex<Option<Arc<StateWriter>>>,
    leadership: Mutex<Option<LeadershipHandle>>,
    shutdown: watch::Sender<bool>,
    main_task: Mutex<Option<JoinHandle<()>>>,
}

impl Overseer {
    pub async fn new(
        store: Arc<dyn CoordinationStore>,
        session: SessionId,
        config: OverseerConfig,
        bus: ClusterEventBus,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let queue = Arc::new(WorkQueue::open(store.clone(), session, OVERSEER_QUEUE_PATH).await?);
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            store,
            session,
            config,
            bus,
            status: Arc::new(StatusCell::default()),
            queue,
            state: Arc::new(AsyncMutex::new(ClusterState::new())),
            writer: Mutex::new(None),
            leadership: Mutex::new(None),
            shutdown,
            main_task: Mutex::new(None),
        }))
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn status(&self) -> OverseerStatus {
        self.status.get()
    }

    pub fn is_leader(&self) -> bool {
        self.status.get() == OverseerStatus::Leading
            && self
                .leadership
                .lock()
                .map(|slot| slot.iter().any(LeadershipHandle::is_leader))
                .unwrap_or(false)
    }

    /// Current leadership, if this node was elected.
    pub fn leadership(&self) -> Result<Option<LeadershipHandle>> {
        Ok(self.leadership.lock()?.clone())
    }

    /// Copy of the authoritative in-memory state. Empty until elected.
    pub async fn cluster_state(&self) -> ClusterState {
        self.state.lock().await.clone()
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    pub fn events(&self) -> &ClusterEventBus {
        &self.bus
    }

    pub async fn enqueue(&self, message: &StateChangeMessage) -> Result<QueueReceipt> {
        self.queue.enqueue(message).await
    }

    /// Starts campaigning in the background.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut main_task = self.main_task.lock()?;
        if main_task.is_some() || self.status.get() != OverseerStatus::Idle {
            return Err(OverseerError::InvariantViolation(format!(
                "overseer on '{}' already started",
                self.config.node_name
            )));
        }
        let span = info_span!("overseer", node = %self.config.node_name);
        let overseer = self.clone();
        *main_task = Some(tokio::spawn(
            async move { overseer.campaign_loop().await }.instrument(span),
        ));
        event!(Level::INFO, node = %self.config.node_name, "overseer started");
        Ok(())
    }

    /// Flushes buffered state updates now. Does nothing unless leading.
    pub async fn write_pending_updates(&self) -> Result<FlushReport> {
        let writer = self.writer.lock()?.clone();
        match writer {
            Some(writer) => writer.write_pending_updates().await,
            None => {
                event!(Level::DEBUG, "not leading, no pending updates to write");
                Ok(FlushReport::default())
            }
        }
    }

    /// Stops processing, writes what is buffered once more and gives up
    /// leadership. Messages that were not committed stay queued.
    pub async fn shutdown(&self) -> Result<()> {
        if matches!(
            self.status.get(),
            OverseerStatus::Stopping | OverseerStatus::Stopped
        ) {
            return Ok(());
        }
        self.status.set(OverseerStatus::Stopping);
        self.shutdown.send_replace(true);
        let main_task = self.main_task.lock()?.take();
        if let Some(task) = main_task {
            if let Err(err) = task.await {
                event!(Level::WARN, error = %err, "overseer task ended abnormally");
            }
        }

        let writer = self.writer.lock()?.take();
        if let Some(writer) = writer {
            match writer.write_pending_updates().await {
                Ok(report) => event!(
                    Level::INFO,
                    committed = report.committed,
                    removed = report.removed_messages,
                    "final flush done"
                ),
                Err(err) => event!(Level::WARN, error = %err, "final flush failed"),
            }
            writer.dispose()?;
        }
        let leadership = self.leadership.lock()?.take();
        if let Some(handle) = leadership {
            if let Err(err) = handle.resign().await {
                event!(Level::WARN, error = %err, "failed to resign overseer leadership");
            }
        }
        self.status.set(OverseerStatus::Stopped);
        event!(Level::INFO, node = %self.config.node_name, "overseer stopped");
        Ok(())
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn campaign_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut failures = 0u32;
        while !self.stopping() {
            let elector = LeaderElector::new(self.store.clone(), self.session, OVERSEER_ELECTION_PATH)
                .with_retry(self.config.retry.clone());
            let elected = match elector.register(&self.config.node_name).await {
                Ok(candidacy) => {
                    let node_path = candidacy.node_path().to_string();
                    let outcome = tokio::select! {
                        elected = candidacy.wait_for_leadership() => Some(elected),
                        _ = shutdown.changed() => None,
                    };
                    match outcome {
                        Some(Ok(handle)) => Ok(handle),
                        Some(Err(err)) => {
                            self.leave_election(&node_path).await;
                            Err(err)
                        }
                        None => {
                            // A stale candidate would block every later one.
                            self.leave_election(&node_path).await;
                            break;
                        }
                    }
                }
                Err(err) => Err(err),
            };
            match elected {
                Ok(handle) => {
                    failures = 0;
                    self.lead(handle).await;
                }
                Err(OverseerError::SessionExpired(session)) => {
                    event!(Level::ERROR, session, "session expired, no longer campaigning");
                    break;
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let backoff = self.config.retry.backoff(failures);
                    event!(Level::WARN, error = %err, failures, "overseer campaign failed");
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        event!(Level::DEBUG, "overseer campaign loop finished");
    }

    async fn leave_election(&self, node_path: &str) {
        match self.store.delete(node_path, None).await {
            Ok(()) | Err(OverseerError::NoNode(_)) => {}
            Err(err) => {
                event!(Level::WARN, node = %node_path, error = %err, "failed to leave overseer election")
            }
        }
    }

    /// One leadership term.
    async fn lead(&self, handle: LeadershipHandle) {
        event!(
            Level::INFO,
            token = %handle.fencing_token(),
            "elected overseer"
        );
        if let Ok(mut leadership) = self.leadership.lock() {
            *leadership = Some(handle.clone());
        }
        let status = self.status.clone();
        handle.on_loss(move || {
            status.transition(OverseerStatus::Leading, OverseerStatus::Idle);
        });

        let baseline = match self.load_state(&handle).await {
            Some(baseline) => baseline,
            None => return self.end_term(None, None).await,
        };
        if !self
            .status
            .transition(OverseerStatus::Idle, OverseerStatus::Leading)
        {
            return self.end_term(None, None).await;
        }

        let writer = Arc::new(StateWriter::new(
            self.store.clone(),
            self.session,
            handle.clone(),
            self.state.clone(),
            self.queue.clone(),
            self.bus.clone(),
            self.config.writer.clone(),
        ));
        if let Ok(mut slot) = self.writer.lock() {
            *slot = Some(writer.clone());
        }
        let workers = self.spawn_term_workers(&writer, baseline);
        let processor = MutationProcessor::new(self.status.clone(), handle.clone())
            .with_limits(self.config.limits.clone());
        self.process_queue(&processor, &writer, &handle).await;
        self.end_term(Some(writer), Some(workers)).await;
    }

    /// Loads the authoritative state for a new term, retrying while the
    /// store is unavailable. Returns the live nodes seen at load time.
    async fn load_state(&self, handle: &LeadershipHandle) -> Option<BTreeSet<String>> {
        let mut failures = 0u32;
        loop {
            if self.stopping() || !handle.is_leader() {
                return None;
            }
            match load_cluster_state(self.store.as_ref()).await {
                Ok(loaded) => {
                    let mut state = self.state.lock().await;
                    state.absorb(loaded);
                    event!(
                        Level::INFO,
                        collections = state.collection_names().len(),
                        live_nodes = state.live_nodes().len(),
                        "cluster state loaded"
                    );
                    return Some(state.live_nodes().clone());
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    event!(Level::WARN, error = %err, failures, "cluster state load failed");
                    sleep(self.config.retry.backoff(failures)).await;
                }
            }
        }
    }

    fn spawn_term_workers(
        &self,
        writer: &Arc<StateWriter>,
        baseline: BTreeSet<String>,
    ) -> TermWorkers {
        let (stop, stop_rx) = watch::channel(false);
        let flush = tokio::spawn(
            flush_periodically(
                writer.clone(),
                self.config.flush_interval_duration(),
                stop_rx.clone(),
            )
            .in_current_span(),
        );
        let watcher = LiveNodesWatcher::new(self.store.clone(), self.bus.clone())
            .with_baseline(baseline);
        let live = tokio::spawn(
            track_live_nodes(
                watcher,
                self.state.clone(),
                self.queue.clone(),
                self.config.clone(),
                stop_rx,
            )
            .in_current_span(),
        );
        TermWorkers {
            stop,
            tasks: vec![flush, live],
        }
    }

    async fn end_term(&self, writer: Option<Arc<StateWriter>>, workers: Option<TermWorkers>) {
        if let Some(workers) = workers {
            workers.stop().await;
        }
        // On shutdown the writer and the election node are left for the final
        // flush in `shutdown`.
        if self.status.get() == OverseerStatus::Stopping {
            return;
        }
        self.status
            .transition(OverseerStatus::Leading, OverseerStatus::Idle);
        if let Some(writer) = writer {
            if let Err(err) = writer.dispose() {
                event!(Level::WARN, error = %err, "failed to dispose state writer");
            }
        }
        if let Ok(mut slot) = self.writer.lock() {
            *slot = None;
        }
        let leadership = self.leadership.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = leadership {
            if let Err(err) = handle.resign().await {
                event!(Level::WARN, error = %err, "failed to release election node");
            }
        }
        event!(Level::WARN, "overseer term ended");
    }

    async fn process_queue(
        &self,
        processor: &MutationProcessor,
        writer: &StateWriter,
        handle: &LeadershipHandle,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let idle_wait = self.config.idle_wait_duration();
        let mut failures = 0u32;
        loop {
            if self.stopping() || !processor.is_active() || !writer.is_active() {
                return;
            }
            let ready = tokio::select! {
                ready = self.queue.wait_for_items(idle_wait) => ready,
                _ = shutdown.changed() => return,
                _ = handle.lost() => return,
            };
            let cycle = match ready {
                Ok(true) => self.process_batch(processor, writer).await,
                Ok(false) => Ok(()),
                Err(err) => Err(err),
            };
            match cycle {
                Ok(()) => failures = 0,
                Err(err) if err.is_fencing() => {
                    event!(Level::ERROR, error = %err, "overseer fenced off, stopping processing");
                    return;
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let backoff = self.config.retry.backoff(failures);
                    event!(
                        Level::WARN,
                        error = %err,
                        failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "processing cycle failed"
                    );
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    }

    /// Peeks one batch, applies it to the in-memory state and stages the
    /// resulting deltas.
    async fn process_batch(&self, processor: &MutationProcessor, writer: &StateWriter) -> Result<()> {
        let batch_size = self.config.queue.batch_size;
        // Staged entries stay queued until committed; look past them.
        let window = batch_size.saturating_add(writer.in_flight_count()?);
        let peeked = self.queue.peek(window).await?;
        let mut fresh: Vec<QueueEntry> = Vec::with_capacity(batch_size.min(peeked.len()));
        let mut most_conflicts = 0u32;
        for entry in peeked {
            if fresh.len() == batch_size {
                break;
            }
            if writer.is_in_flight(&entry.id)? {
                continue;
            }
            most_conflicts = most_conflicts.max(writer.conflict_count(&entry.id)?);
            fresh.push(entry);
        }
        if fresh.is_empty() {
            // Everything queued is staged; the writer policy decides when it goes out.
            if writer.flush_due()? {
                writer.write_pending_updates().await?;
            } else {
                let pause = self
                    .config
                    .flush_interval_duration()
                    .min(self.config.idle_wait_duration());
                let mut shutdown = self.shutdown.subscribe();
                tokio::select! {
                    _ = sleep(pause) => {}
                    _ = shutdown.changed() => {}
                }
            }
            return Ok(());
        }
        if most_conflicts > self.config.retry.max_attempts {
            let backoff = self.config.retry.backoff(most_conflicts);
            event!(
                Level::WARN,
                conflicts = most_conflicts,
                backoff_ms = backoff.as_millis() as u64,
                "messages keep conflicting, backing off"
            );
            sleep(backoff).await;
        }

        let entries = coalesce(fresh);
        let mut finished: Vec<String> = Vec::new();
        let mut urgent = false;
        {
            let mut state = self.state.lock().await;
            for entry in &entries {
                match processor.process(&state, entry) {
                    ProcessOutcome::Delta(deltas) => {
                        for delta in deltas {
                            urgent |= delta.urgent;
                            delta.apply_to(&mut state);
                            writer.stage_update(delta)?;
                        }
                    }
                    ProcessOutcome::NoOp(reason) => {
                        event!(Level::DEBUG, id = %entry.id, reason = %reason, "message had no effect");
                        finished.extend(entry.all_ids());
                    }
                    ProcessOutcome::Rejected(reason) => {
                        event!(Level::WARN, id = %entry.id, reason = %reason, "message rejected");
                        finished.extend(entry.all_ids());
                    }
                    ProcessOutcome::Abandoned => break,
                }
            }
        }
        self.queue.remove_all(&finished).await?;
        if urgent || writer.flush_due()? {
            writer.write_pending_updates().await?;
        }
        Ok(())
    }
}

async fn flush_periodically(
    writer: Arc<StateWriter>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut failures = 0u32;
    loop {
        let wait = if failures == 0 {
            interval
        } else {
            interval.max(Duration::from_millis(5) * failures.min(100))
        };
        tokio::select! {
            _ = stop.changed() => break,
            _ = sleep(wait) => {}
        }
        if !writer.is_active() {
            break;
        }
        if !writer.has_pending().unwrap_or(false) {
            continue;
        }
        match writer.write_pending_updates().await {
            Ok(_) => failures = 0,
            Err(err) if err.is_fencing() => break,
            Err(err) => {
                failures = failures.saturating_add(1);
                event!(Level::WARN, error = %err, failures, "timed flush failed");
            }
        }
    }
}

/// Keeps live nodes in the overseer state current and marks the replicas of
/// departed nodes down.
async fn track_live_nodes(
    mut watcher: LiveNodesWatcher,
    state: Arc<AsyncMutex<ClusterState>>,
    queue: Arc<WorkQueue>,
    config: OverseerConfig,
    mut stop: watch::Receiver<bool>,
) {
    let mut failures = 0u32;
    let mut first = true;
    loop {
        let (diff, changed) = match watcher.observe().await {
            Ok(observed) => {
                failures = 0;
                observed
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                event!(Level::WARN, error = %err, failures, "live nodes watch failed");
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = sleep(config.retry.backoff(failures)) => continue,
                }
            }
        };

        let mut departed: BTreeSet<String> = diff.removed.iter().cloned().collect();
        {
            let mut state = state.lock().await;
            if first {
                // Nodes that left while no overseer was watching.
                departed.extend(nodes_hosting_live_replicas(&state, &diff.current));
            }
            state.set_live_nodes(diff.current.clone());
        }
        first = false;
        for node in departed {
            match queue.enqueue(&StateChangeMessage::down_node(&node)).await {
                Ok(_) => event!(Level::INFO, node = %node, "queued down_node"),
                Err(err) => event!(Level::WARN, node = %node, error = %err, "failed to queue down_node"),
            }
        }

        tokio::select! {
            _ = stop.changed() => break,
            _ = changed => {}
        }
    }
}

fn nodes_hosting_live_replicas(state: &ClusterState, live: &BTreeSet<String>) -> Vec<String> {
    let hosting: BTreeSet<String> = state
        .collections()
        .flat_map(|collection| collection.shards.values())
        .flat_map(|shard| shard.replicas.values())
        .filter(|replica| replica.state != ReplicaState::Down && !live.contains(&replica.node_name))
        .map(|replica| replica.node_name.clone())
        .collect();
    hosting.into_iter().collect()
}
