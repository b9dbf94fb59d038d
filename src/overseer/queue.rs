use super::message::{Operation, StateChangeMessage};
use crate::cluster::ReplicaState;
use crate::core::{OverseerError, Result};
use crate::store::paths::{QUEUE_NODE_PREFIX, join};
use crate::store::{CoordinationStore, CreateMode, SessionId, sequence_of};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{Level, event};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueReceipt {
    pub id: String,
    pub sequence: u64,
}

/// A message read from the queue, still present in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// Queue node name, e.g. `qn-0000000042`.
    pub id: String,
    pub sequence: u64,
    pub message: StateChangeMessage,
    /// Earlier entries collapsed into this one; removed together with it.
    pub superseded: Vec<String>,
}

impl QueueEntry {
    /// Every queue id that goes away once this entry committed.
    pub fn all_ids(&self) -> Vec<String> {
        let mut ids = self.superseded.clone();
        ids.push(self.id.clone());
        ids
    }
}

/// Durable FIFO of state-change messages backed by persistent sequential
/// nodes.
pub struct WorkQueue {
    store: Arc<dyn CoordinationStore>,
    session: SessionId,
    path: String,
}

impl WorkQueue {
    pub async fn open(
        store: Arc<dyn CoordinationStore>,
        session: SessionId,
        path: impl Into<String>,
    ) -> Result<Self> {
        let path = path.into();
        store.ensure_path(session, &path).await?;
        Ok(Self {
            store,
            session,
            path,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn enqueue(&self, message: &StateChangeMessage) -> Result<QueueReceipt> {
        let operation = message.operation()?;
        let node = self
            .store
            .create(
                self.session,
                &join(&self.path, QUEUE_NODE_PREFIX),
                message.to_bytes()?,
                CreateMode::PersistentSequential,
            )
            .await?;
        let id = crate::store::paths::name_of(&node).to_string();
        let sequence = sequence_of(&id).ok_or_else(|| {
            OverseerError::InvariantViolation(format!("queue node '{}' has no sequence", node))
        })?;
        event!(Level::DEBUG, id = %id, %operation, "message enqueued");
        Ok(QueueReceipt { id, sequence })
    }

    async fn ordered_ids(&self) -> Result<Vec<(u64, String)>> {
        let mut ids: Vec<(u64, String)> = self
            .store
            .get_children(&self.path)
            .await?
            .into_iter()
            .filter(|name| name.starts_with(QUEUE_NODE_PREFIX))
            .filter_map(|name| sequence_of(&name).map(|seq| (seq, name)))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Up to `max` entries in sequence order, without removing them.
    ///
    /// Nodes removed between listing and reading are skipped. A node that
    /// does not decode is returned with an empty message so that it is
    /// rejected and removed like any other malformed message.
    pub async fn peek(&self, max: usize) -> Result<Vec<QueueEntry>> {
        let mut entries = Vec::new();
        for (sequence, id) in self.ordered_ids().await?.into_iter().take(max) {
            let bytes = match self.store.get_data(&join(&self.path, &id)).await {
                Ok((bytes, _)) => bytes,
                Err(OverseerError::NoNode(_)) => continue,
                Err(err) => return Err(err),
            };
            let message = StateChangeMessage::from_bytes(&bytes).unwrap_or_else(|err| {
                event!(Level::WARN, id = %id, error = %err, "undecodable queue entry");
                StateChangeMessage::default()
            });
            entries.push(QueueEntry {
                id,
                sequence,
                message,
                superseded: Vec::new(),
            });
        }
        Ok(entries)
    }

    /// Removes one entry; removing a missing entry succeeds.
    pub async fn remove(&self, id: &str) -> Result<()> {
        match self.store.delete(&join(&self.path, id), None).await {
            Ok(()) | Err(OverseerError::NoNode(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn remove_all(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.remove(id).await?;
        }
        Ok(())
    }

    pub async fn size(&self) -> Result<usize> {
        Ok(self.ordered_ids().await?.len())
    }

    /// Waits on a children watch until the queue is non-empty or `max_wait`
    /// elapses. Returns whether items are present.
    pub async fn wait_for_items(&self, max_wait: Duration) -> Result<bool> {
        let (children, changed) = self.store.get_children_watch(&self.path).await?;
        if children.iter().any(|name| name.starts_with(QUEUE_NODE_PREFIX)) {
            return Ok(true);
        }
        // Either outcome is followed by a fresh read.
        let _ = timeout(max_wait, changed).await;
        Ok(self.size().await? > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntityKey {
    operation: Operation,
    collection: String,
    entity: String,
}

fn entity_key(message: &StateChangeMessage) -> Option<EntityKey> {
    let operation = message.operation().ok()?;
    let entity_field = match operation {
        Operation::SetReplicaState => "replica",
        Operation::SetShardState | Operation::SetShardLeader => "shard",
        _ => return None,
    };
    Some(EntityKey {
        operation,
        collection: message.get_str("collection")?,
        entity: message.get_str(entity_field)?,
    })
}

/// Whether applying `later` alone leaves the same state and events as
/// applying `earlier` and then `later`.
///
/// Shard states overwrite each other. A replica moving to ACTIVE has no side
/// effect of its own, so it may be skipped unless the survivor is a move to
/// DOWN (the skipped step is what makes that move publish REPLICAS_DOWN).
/// Any other replica transition can clear a leader or publish an event, and
/// a leader designation may be rejected, so those only merge with an
/// identical follower.
fn supersedes(later: &StateChangeMessage, earlier: &StateChangeMessage) -> bool {
    match later.operation() {
        Ok(Operation::SetShardState) => true,
        Ok(Operation::SetReplicaState) => {
            let parse = |message: &StateChangeMessage| {
                message
                    .get_str("state")
                    .and_then(|raw| raw.parse::<ReplicaState>().ok())
            };
            match (parse(earlier), parse(later)) {
                (Some(before), Some(after)) => {
                    before == after
                        || (before == ReplicaState::Active && after != ReplicaState::Down)
                }
                _ => false,
            }
        }
        Ok(Operation::SetShardLeader) => {
            let replica = earlier.get_str("replica");
            replica.is_some() && replica == later.get_str("replica")
        }
        _ => false,
    }
}

/// Collapses superseded state updates inside one peeked batch.
///
/// Repeated `set_replica_state`, `set_shard_state` and `set_shard_leader`
/// messages for the same entity merge when dropping the earlier one cannot
/// change the outcome (see [`supersedes`]); the dropped ids ride along in
/// [`QueueEntry::superseded`]. A message of another kind on the same
/// collection, or any structural message, ends the run so that only commuting
/// updates are merged.
pub fn coalesce(entries: Vec<QueueEntry>) -> Vec<QueueEntry> {
    let mut kept: Vec<Option<QueueEntry>> = Vec::with_capacity(entries.len());
    let mut latest: HashMap<EntityKey, usize> = HashMap::new();

    for mut entry in entries {
        match entity_key(&entry.message) {
            Some(key) => {
                latest.retain(|other, _| {
                    other.collection != key.collection || other.operation == key.operation
                });
                let mergeable = latest.get(&key).copied().filter(|idx| {
                    kept[*idx]
                        .as_ref()
                        .is_some_and(|previous| supersedes(&entry.message, &previous.message))
                });
                if let Some(previous) = mergeable.and_then(|idx| kept[idx].take()) {
                    event!(
                        Level::DEBUG,
                        superseded = %previous.id,
                        by = %entry.id,
                        "coalesced queue entry"
                    );
                    entry.superseded.extend(previous.all_ids());
                }
                latest.insert(key, kept.len());
            }
            None => {
                if entry.message.operation().is_ok() {
                    latest.clear();
                }
            }
        }
        kept.push(Some(entry));
    }

    kept.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CoordinationStore, InMemoryCoordinationStore};

    async fn open_queue() -> (Arc<InMemoryCoordinationStore>, WorkQueue) {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let session = store.open_session().await.unwrap();
        let queue = WorkQueue::open(store.clone(), session, "/overseer/queue")
            .await
            .unwrap();
        (store, queue)
    }

    fn entry(id: u64, message: StateChangeMessage) -> QueueEntry {
        QueueEntry {
            id: format!("qn-{:010}", id),
            sequence: id,
            message,
            superseded: Vec::new(),
        }
    }

    #[tokio::test]
    async fn peek_is_fifo_and_remove_is_idempotent() {
        let (_store, queue) = open_queue().await;
        let first = queue
            .enqueue(&StateChangeMessage::create_collection("a", 1, 1))
            .await
            .unwrap();
        queue
            .enqueue(&StateChangeMessage::delete_collection("b"))
            .await
            .unwrap();

        let entries = queue.peek(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, first.id);
        assert!(entries[0].sequence < entries[1].sequence);
        assert_eq!(queue.peek(1).await.unwrap().len(), 1);

        queue.remove(&first.id).await.unwrap();
        queue.remove(&first.id).await.unwrap();
        assert_eq!(queue.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueue_requires_an_operation() {
        let (_store, queue) = open_queue().await;
        let result = queue.enqueue(&StateChangeMessage::default()).await;
        assert!(matches!(result, Err(OverseerError::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn undecodable_nodes_surface_as_empty_messages() {
        let (store, queue) = open_queue().await;
        let session = store.open_session().await.unwrap();
        store
            .create(
                session,
                "/overseer/queue/qn-",
                b"{broken".to_vec(),
                CreateMode::PersistentSequential,
            )
            .await
            .unwrap();
        let entries = queue.peek(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].message.operation().is_err());
    }

    #[tokio::test]
    async fn wait_for_items_wakes_on_enqueue() {
        let (store, queue) = open_queue().await;
        assert!(!queue.wait_for_items(Duration::from_millis(10)).await.unwrap());

        let session = store.open_session().await.unwrap();
        let producer = WorkQueue::open(store.clone(), session, "/overseer/queue")
            .await
            .unwrap();
        let waiter = tokio::spawn(async move { queue.wait_for_items(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        producer
            .enqueue(&StateChangeMessage::down_node("n1"))
            .await
            .unwrap();
        assert!(waiter.await.unwrap().unwrap());
    }

    #[test]
    fn repeated_replica_updates_keep_the_latest() {
        let batch = vec![
            entry(1, StateChangeMessage::set_replica_state("c", "r1", "active")),
            entry(2, StateChangeMessage::set_replica_state("c", "r2", "active")),
            entry(3, StateChangeMessage::set_replica_state("c", "r1", "recovering")),
        ];
        let merged = coalesce(batch);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].sequence, 2);
        assert_eq!(merged[1].sequence, 3);
        assert_eq!(merged[1].superseded, vec!["qn-0000000001".to_string()]);
        assert_eq!(merged[1].all_ids().len(), 2);
    }

    #[test]
    fn other_kinds_on_the_same_collection_end_the_run() {
        let batch = vec![
            entry(1, StateChangeMessage::set_replica_state("c", "r1", "down")),
            entry(2, StateChangeMessage::set_shard_leader("c", "shard1", "r1")),
            entry(3, StateChangeMessage::set_replica_state("c", "r1", "active")),
            entry(4, StateChangeMessage::set_replica_state("other", "r1", "down")),
            entry(5, StateChangeMessage::add_replica("other", "shard1", "n1")),
            entry(6, StateChangeMessage::set_replica_state("other", "r1", "active")),
        ];
        let merged = coalesce(batch);
        assert_eq!(merged.len(), 6);
        assert!(merged.iter().all(|e| e.superseded.is_empty()));
    }

    #[test]
    fn transitions_with_side_effects_are_never_dropped() {
        let batch = vec![
            entry(1, StateChangeMessage::set_replica_state("c", "r1", "down")),
            entry(2, StateChangeMessage::set_replica_state("c", "r1", "active")),
            entry(3, StateChangeMessage::set_replica_state("c", "r2", "active")),
            entry(4, StateChangeMessage::set_replica_state("c", "r2", "down")),
            entry(5, StateChangeMessage::set_replica_state("c", "r3", "recovering")),
            entry(6, StateChangeMessage::set_replica_state("c", "r3", "recovering")),
        ];
        let merged = coalesce(batch);
        let sequences: Vec<u64> = merged.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 6]);
        assert_eq!(merged[4].superseded, vec!["qn-0000000005".to_string()]);
    }

    #[test]
    fn leader_designations_merge_only_when_identical() {
        let batch = vec![
            entry(1, StateChangeMessage::set_shard_leader("c", "shard1", "r1")),
            entry(2, StateChangeMessage::set_shard_leader("c", "shard1", "r2")),
            entry(3, StateChangeMessage::set_shard_leader("c", "shard1", "r2")),
            entry(4, StateChangeMessage::set_shard_state("c", "shard2", "recovery")),
            entry(5, StateChangeMessage::set_shard_state("c", "shard2", "active")),
        ];
        let merged = coalesce(batch);
        let sequences: Vec<u64> = merged.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 3, 5]);
    }
}
