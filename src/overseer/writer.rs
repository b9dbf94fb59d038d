use super::delta::{DeltaState, DeltaTarget, StateDelta};
use super::election::LeadershipHandle;
use super::queue::WorkQueue;
use crate::cluster::{ClusterState, load_cluster_properties, load_collection};
use crate::config::WriterPolicy;
use crate::core::{OverseerError, Result};
use crate::events::{ClusterEvent, ClusterEventBus};
use crate::store::paths::{collection_path, join};
use crate::store::{CoordinationStore, CreateMode, SessionId, StoreOp, StoreOpResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{Instrument, Level, event, info_span};

type Waiter = oneshot::Sender<Result<Option<u64>>>;

/// Resolves once the staged delta committed (with the new store version,
/// `None` for deletions) or was discarded.
pub struct UpdateReceipt {
    outcome: oneshot::Receiver<Result<Option<u64>>>,
}

impl UpdateReceipt {
    pub async fn wait(self) -> Result<Option<u64>> {
        self.outcome
            .await
            .map_err(|_| OverseerError::OverseerStopped)?
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Targets written to the store.
    pub committed: usize,
    /// Targets discarded after a version conflict.
    pub conflicts: usize,
    /// Targets dropped because their state could not be encoded.
    pub rejected: usize,
    /// Queue messages removed after their last delta committed.
    pub removed_messages: usize,
    pub events_published: usize,
}

/// Buffered deltas of one target.
struct PendingUpdate {
    target: DeltaTarget,
    /// Version read by the first buffered delta.
    expected_version: Option<u64>,
    new_state: DeltaState,
    source_ids: Vec<String>,
    events: Vec<ClusterEvent>,
    waiters: Vec<Waiter>,
    urgent: bool,
}

impl PendingUpdate {
    /// Folds `newer` in: the first expected version stays, the latest state wins.
    fn absorb(&mut self, newer: PendingUpdate) {
        self.new_state = newer.new_state;
        self.source_ids.extend(newer.source_ids);
        self.events.extend(newer.events);
        self.waiters.extend(newer.waiters);
        self.urgent |= newer.urgent;
    }

    fn fail(self, reason: impl Fn() -> OverseerError) {
        for waiter in self.waiters {
            let _ = waiter.send(Err(reason()));
        }
    }
}

#[derive(Default)]
struct PendingBuffer {
    updates: BTreeMap<DeltaTarget, PendingUpdate>,
    oldest: Option<Instant>,
    /// Queue id -> number of staged deltas not yet committed.
    in_flight: HashMap<String, usize>,
    /// Ids with at least one discarded delta; released instead of removed.
    discarded: HashSet<String>,
    conflicts: HashMap<String, u32>,
}

impl PendingBuffer {
    fn merge(&mut self, update: PendingUpdate) {
        match self.updates.remove(&update.target) {
            Some(mut existing) => {
                existing.absorb(update);
                self.updates.insert(existing.target.clone(), existing);
            }
            None => {
                self.updates.insert(update.target.clone(), update);
            }
        }
        self.oldest.get_or_insert_with(Instant::now);
    }

    /// Puts an update taken by a failed flush back in front of anything
    /// staged since.
    fn restore(&mut self, mut update: PendingUpdate) {
        if let Some(newer) = self.updates.remove(&update.target) {
            update.absorb(newer);
        }
        self.updates.insert(update.target.clone(), update);
        self.oldest.get_or_insert_with(Instant::now);
    }

    /// Marks one delta of each id finished. Returns the ids whose last delta
    /// committed and that should leave the queue.
    fn settle(&mut self, ids: &[String], committed: bool) -> Vec<String> {
        let mut removable = Vec::new();
        for id in ids {
            if !committed {
                self.discarded.insert(id.clone());
            }
            let remaining = match self.in_flight.get_mut(id) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => continue,
            };
            if remaining == 0 {
                self.in_flight.remove(id);
                if !self.discarded.remove(id) {
                    self.conflicts.remove(id);
                    removable.push(id.clone());
                }
            }
        }
        removable
    }
}

enum CommitError {
    Conflict(OverseerError),
    Unencodable(OverseerError),
    Fenced(OverseerError),
    Unavailable(OverseerError),
}

/// Persists buffered deltas under optimistic concurrency and fencing.
///
/// Every write is one atomic transaction: a check of the leader's election
/// node followed by the conditional write of the target document.
pub struct StateWriter {
    store: Arc<dyn CoordinationStore>,
    session: SessionId,
    leadership: LeadershipHandle,
    state: Arc<AsyncMutex<ClusterState>>,
    queue: Arc<WorkQueue>,
    bus: ClusterEventBus,
    policy: WriterPolicy,
    pending: Mutex<PendingBuffer>,
    flush_lock: AsyncMutex<()>,
    active: AtomicBool,
}

impl StateWriter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        session: SessionId,
        leadership: LeadershipHandle,
        state: Arc<AsyncMutex<ClusterState>>,
        queue: Arc<WorkQueue>,
        bus: ClusterEventBus,
        policy: WriterPolicy,
    ) -> Self {
        Self {
            store,
            session,
            leadership,
            state,
            queue,
            bus,
            policy,
            pending: Mutex::new(PendingBuffer::default()),
            flush_lock: AsyncMutex::new(()),
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Buffers a delta without flushing. Callers holding the cluster state
    /// lock use this; the flush itself needs that lock.
    pub fn stage_update(&self, delta: StateDelta) -> Result<UpdateReceipt> {
        if !self.is_active() {
            return Err(OverseerError::OverseerStopped);
        }
        let (waiter, outcome) = oneshot::channel();
        let mut pending = self.pending.lock()?;
        for id in &delta.source_ids {
            *pending.in_flight.entry(id.clone()).or_insert(0) += 1;
        }
        pending.merge(PendingUpdate {
            target: delta.target,
            expected_version: delta.previous_version,
            new_state: delta.new_state,
            source_ids: delta.source_ids,
            events: delta.events,
            waiters: vec![waiter],
            urgent: delta.urgent,
        });
        Ok(UpdateReceipt { outcome })
    }

    /// Buffers a delta and flushes right away when it is urgent or a
    /// threshold is reached.
    pub async fn enqueue_update(&self, mut delta: StateDelta, urgent: bool) -> Result<UpdateReceipt> {
        delta.urgent |= urgent;
        let receipt = self.stage_update(delta)?;
        if self.flush_due()? {
            self.write_pending_updates().await?;
        }
        Ok(receipt)
    }

    /// True when an urgent delta is buffered or a count/age threshold is hit.
    pub fn flush_due(&self) -> Result<bool> {
        let pending = self.pending.lock()?;
        if pending.updates.is_empty() {
            return Ok(false);
        }
        let aged = pending.oldest.is_some_and(|oldest| {
            oldest.elapsed() >= Duration::from_millis(self.policy.max_pending_age_ms)
        });
        Ok(aged
            || pending.updates.len() >= self.policy.max_pending_updates
            || pending.updates.values().any(|update| update.urgent))
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.pending.lock()?.updates.is_empty())
    }

    /// Whether a queue id has staged deltas that are not settled yet.
    pub fn is_in_flight(&self, id: &str) -> Result<bool> {
        Ok(self.pending.lock()?.in_flight.contains_key(id))
    }

    /// Number of queue ids with staged deltas.
    pub fn in_flight_count(&self) -> Result<usize> {
        Ok(self.pending.lock()?.in_flight.len())
    }

    /// Version conflicts recorded against a queue id.
    pub fn conflict_count(&self, id: &str) -> Result<u32> {
        Ok(self.pending.lock()?.conflicts.get(id).copied().unwrap_or(0))
    }

    /// Writes every buffered delta. A disposed writer does nothing.
    pub async fn write_pending_updates(&self) -> Result<FlushReport> {
        if !self.is_active() {
            event!(Level::DEBUG, "writer disposed, nothing to write");
            return Ok(FlushReport::default());
        }
        let _flush = self.flush_lock.lock().await;
        let mut state = self.state.lock().await;
        let batch: Vec<PendingUpdate> = {
            let mut pending = self.pending.lock()?;
            pending.oldest = None;
            std::mem::take(&mut pending.updates).into_values().collect()
        };
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }
        let span = info_span!("overseer.flush", targets = batch.len());
        self.flush_batch(&mut state, batch).instrument(span).await
    }

    async fn flush_batch(
        &self,
        state: &mut ClusterState,
        batch: Vec<PendingUpdate>,
    ) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        if !self.leadership.is_leader() {
            self.abort_batch(batch, || OverseerError::LeadershipLost)?;
            return Err(OverseerError::LeadershipLost);
        }

        let mut remaining = batch.into_iter();
        while let Some(update) = remaining.next() {
            match self.commit(&update).await {
                Ok(version) => self.committed(state, update, version, &mut report).await?,
                Err(CommitError::Conflict(err)) => {
                    report.conflicts += 1;
                    self.conflicted(state, update, err).await?;
                }
                Err(CommitError::Unencodable(err)) => {
                    report.rejected += 1;
                    self.unencodable(state, update, err, &mut report).await?;
                }
                Err(CommitError::Unavailable(err)) => {
                    event!(Level::WARN, error = %err, "store unavailable, keeping updates buffered");
                    let mut pending = self.pending.lock()?;
                    pending.restore(update);
                    for later in remaining {
                        pending.restore(later);
                    }
                    return Err(err);
                }
                Err(CommitError::Fenced(err)) => {
                    event!(Level::ERROR, error = %err, "write fenced off, writer deactivated");
                    let fenced = || {
                        OverseerError::StaleFencingToken(self.leadership.fencing_token().to_string())
                    };
                    self.abort_batch(std::iter::once(update).chain(remaining).collect(), fenced)?;
                    return Err(fenced());
                }
            }
        }
        event!(
            Level::DEBUG,
            committed = report.committed,
            conflicts = report.conflicts,
            removed = report.removed_messages,
            "flushed pending updates"
        );
        Ok(report)
    }

    async fn commit(&self, update: &PendingUpdate) -> std::result::Result<Option<u64>, CommitError> {
        let path = update.target.store_path();
        let write = match (&update.new_state, update.expected_version) {
            // Created and deleted within one batch; nothing was ever persisted.
            (DeltaState::Deleted, None) => return Ok(None),
            (DeltaState::Deleted, Some(version)) => StoreOp::Delete {
                path,
                version: Some(version),
            },
            (new_state, expected) => {
                let data = match new_state {
                    DeltaState::Collection(collection) => collection.to_bytes(),
                    DeltaState::ClusterProperties(properties) => properties.to_bytes(),
                    DeltaState::Deleted => Ok(Vec::new()),
                }
                .map_err(CommitError::Unencodable)?;
                match expected {
                    Some(version) => StoreOp::SetData {
                        path,
                        data,
                        version: Some(version),
                    },
                    None => StoreOp::Create {
                        path,
                        data,
                        mode: CreateMode::Persistent,
                    },
                }
            }
        };

        if let (DeltaTarget::Collection(name), StoreOp::Create { .. }) = (&update.target, &write) {
            self.store
                .ensure_path(self.session, &collection_path(name))
                .await
                .map_err(classify)?;
        }

        let ops = vec![self.leadership.fencing_token().check_op(), write];
        let results = self.store.multi(self.session, ops).await.map_err(classify)?;
        Ok(match results.get(1) {
            Some(StoreOpResult::SetData(stat)) => Some(stat.version),
            Some(StoreOpResult::Created(_)) => Some(0),
            _ => None,
        })
    }

    async fn committed(
        &self,
        state: &mut ClusterState,
        update: PendingUpdate,
        version: Option<u64>,
        report: &mut FlushReport,
    ) -> Result<()> {
        report.committed += 1;
        match (&update.target, &update.new_state) {
            (DeltaTarget::Collection(name), DeltaState::Deleted) => {
                delete_tree(self.store.as_ref(), &collection_path(name)).await;
            }
            (DeltaTarget::Collection(name), _) => {
                if let Some(version) = version {
                    state.set_collection_version(name, version);
                }
            }
            (DeltaTarget::ClusterProperties, _) => {
                let mut properties = state.properties().clone();
                properties.version = version;
                state.set_properties(properties);
            }
        }
        event!(
            Level::DEBUG,
            delta_target = %update.target,
            version = ?version,
            "state update committed"
        );

        let removable = self.pending.lock()?.settle(&update.source_ids, true);
        self.remove_messages(&removable, report).await;
        for cluster_event in update.events {
            self.bus.publish(cluster_event);
            report.events_published += 1;
        }
        for waiter in update.waiters {
            let _ = waiter.send(Ok(version));
        }
        Ok(())
    }

    async fn remove_messages(&self, ids: &[String], report: &mut FlushReport) {
        for id in ids {
            match self.queue.remove(id).await {
                Ok(()) => report.removed_messages += 1,
                Err(err) => {
                    event!(Level::WARN, id = %id, error = %err, "settled message not removed")
                }
            }
        }
    }

    /// Replaces the in-memory copy of `target` with what the store holds.
    async fn reload_target(&self, state: &mut ClusterState, target: &DeltaTarget) -> Result<()> {
        match target {
            DeltaTarget::Collection(name) => {
                match load_collection(self.store.as_ref(), name).await? {
                    Some(collection) => state.put_collection(collection),
                    None => {
                        state.remove_collection(name);
                    }
                }
            }
            DeltaTarget::ClusterProperties => {
                state.set_properties(load_cluster_properties(self.store.as_ref()).await?);
            }
        }
        Ok(())
    }

    /// A state that cannot be encoded never will be: the delta is dropped and
    /// its messages leave the queue instead of being retried.
    async fn unencodable(
        &self,
        state: &mut ClusterState,
        update: PendingUpdate,
        err: OverseerError,
        report: &mut FlushReport,
    ) -> Result<()> {
        event!(
            Level::ERROR,
            delta_target = %update.target,
            error = %err,
            "state cannot be encoded, dropping update"
        );
        self.reload_target(state, &update.target).await?;
        let removable = self.pending.lock()?.settle(&update.source_ids, true);
        self.remove_messages(&removable, report).await;
        let reason = err.to_string();
        update.fail(|| OverseerError::Serialization(reason.clone()));
        Ok(())
    }

    /// Drops the local delta, reloads the authoritative target and releases
    /// the message ids so that the messages are processed again.
    async fn conflicted(
        &self,
        state: &mut ClusterState,
        update: PendingUpdate,
        err: OverseerError,
    ) -> Result<()> {
        event!(
            Level::WARN,
            delta_target = %update.target,
            expected = ?update.expected_version,
            error = %err,
            "version conflict, reloading target"
        );
        self.reload_target(state, &update.target).await?;
        {
            let mut pending = self.pending.lock()?;
            for id in &update.source_ids {
                *pending.conflicts.entry(id.clone()).or_insert(0) += 1;
            }
            pending.settle(&update.source_ids, false);
        }
        let target = update.target.to_string();
        let expected = update.expected_version;
        update.fail(|| OverseerError::VersionConflict {
            target: target.clone(),
            expected,
        });
        Ok(())
    }

    /// Deactivates the writer and fails every update of the batch; their
    /// messages stay queued for the next leader.
    fn abort_batch(
        &self,
        batch: Vec<PendingUpdate>,
        reason: impl Fn() -> OverseerError,
    ) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        let mut pending = self.pending.lock()?;
        for update in batch {
            pending.settle(&update.source_ids, false);
            update.fail(&reason);
        }
        Ok(())
    }

    /// Stops accepting updates; buffered ones are failed and their messages
    /// stay queued. Later flushes are no-ops.
    pub fn dispose(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut pending = self.pending.lock()?;
        let updates = std::mem::take(&mut pending.updates);
        pending.oldest = None;
        for update in updates.into_values() {
            pending.settle(&update.source_ids, false);
            update.fail(|| OverseerError::OverseerStopped);
        }
        event!(Level::INFO, "state writer disposed");
        Ok(())
    }
}

fn classify(err: OverseerError) -> CommitError {
    match err {
        OverseerError::TransactionFailed { index: 0, source } => {
            CommitError::Fenced(OverseerError::StaleFencingToken(source.to_string()))
        }
        OverseerError::SessionExpired(_) => CommitError::Fenced(err),
        OverseerError::StoreUnavailable(_) => CommitError::Unavailable(err),
        OverseerError::TransactionFailed { ref source, .. }
            if matches!(**source, OverseerError::StoreUnavailable(_)) =>
        {
            CommitError::Unavailable(err)
        }
        other => CommitError::Conflict(other),
    }
}

/// Best-effort removal of a subtree, children first.
async fn delete_tree(store: &dyn CoordinationStore, root: &str) {
    let mut stack = vec![(root.to_string(), false)];
    while let Some((path, expanded)) = stack.pop() {
        if expanded {
            match store.delete(&path, None).await {
                Ok(()) | Err(OverseerError::NoNode(_)) => {}
                Err(err) => {
                    event!(Level::WARN, path = %path, error = %err, "cleanup delete failed");
                }
            }
            continue;
        }
        match store.get_children(&path).await {
            Ok(children) => {
                stack.push((path.clone(), true));
                for child in children {
                    stack.push((join(&path, &child), false));
                }
            }
            Err(OverseerError::NoNode(_)) => {}
            Err(err) => {
                event!(Level::WARN, path = %path, error = %err, "cleanup listing failed");
            }
        }
    }
}
