use super::delta::{DeltaState, StateDelta};
use super::election::LeadershipHandle;
use super::message::{Operation, StateChangeMessage};
use super::queue::QueueEntry;
use crate::cluster::{
    ClusterState, Collection, CollectionConfig, Replica, ReplicaState, ReplicaType, RouterKind,
    Shard, ShardState,
};
use crate::config::CollectionLimits;
use crate::core::{OverseerError, Result};
use crate::events::{ClusterEvent, ReplicaRef};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{Level, event, info_span};

/// Lifecycle of the local overseer role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverseerStatus {
    /// Not elected (yet).
    Idle = 0,
    Leading = 1,
    Stopping = 2,
    Stopped = 3,
}

impl OverseerStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Leading,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Shared, lock-free status flag consulted before every mutation.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(OverseerStatus::Idle)
    }
}

impl StatusCell {
    pub fn new(status: OverseerStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> OverseerStatus {
        OverseerStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, status: OverseerStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    /// Moves `from` -> `to`; returns false if the status was something else.
    pub fn transition(&self, from: OverseerStatus, to: OverseerStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Mutations to stage; the message leaves the queue once all committed.
    Delta(Vec<StateDelta>),
    /// Target missing or change already present; the message is removed.
    NoOp(String),
    /// Malformed or invalid; the message is logged and removed.
    Rejected(String),
    /// Not leading or shutting down; the message stays queued.
    Abandoned,
}

/// Interprets queued messages against the in-memory cluster state.
///
/// Processing is a pure function of the state and the message: replaying an
/// already applied message yields [`ProcessOutcome::NoOp`].
pub struct MutationProcessor {
    status: Arc<StatusCell>,
    leadership: LeadershipHandle,
    limits: CollectionLimits,
}

impl MutationProcessor {
    pub fn new(status: Arc<StatusCell>, leadership: LeadershipHandle) -> Self {
        Self {
            status,
            leadership,
            limits: CollectionLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: CollectionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status.get() == OverseerStatus::Leading && self.leadership.is_leader()
    }

    pub fn process(&self, state: &ClusterState, entry: &QueueEntry) -> ProcessOutcome {
        if !self.is_active() {
            event!(
                Level::DEBUG,
                id = %entry.id,
                status = ?self.status.get(),
                "abandoning message, overseer not active"
            );
            return ProcessOutcome::Abandoned;
        }

        let operation = match entry.message.operation() {
            Ok(operation) => operation,
            Err(err) => {
                event!(Level::WARN, id = %entry.id, error = %err, "rejecting message");
                return ProcessOutcome::Rejected(err.to_string());
            }
        };
        let span = info_span!("overseer.process", op = %operation, id = %entry.id);
        let _enter = span.enter();

        let result = match operation {
            Operation::CreateCollection => create_collection(state, &entry.message, &self.limits),
            Operation::DeleteCollection => delete_collection(state, &entry.message),
            Operation::ModifyCollection => modify_collection(state, &entry.message, &self.limits),
            Operation::AddReplica => add_replica(state, entry, &self.limits),
            Operation::RemoveReplica => remove_replica(state, &entry.message),
            Operation::SetShardState => set_shard_state(state, &entry.message),
            Operation::SetReplicaState => set_replica_state(state, &entry.message),
            Operation::SetShardLeader => set_shard_leader(state, &entry.message),
            Operation::DownNode => down_node(state, &entry.message),
            Operation::ClusterConfigChanged => cluster_config_changed(state, &entry.message),
        }
        .and_then(verify_deltas);

        match result {
            Ok(ProcessOutcome::Delta(deltas)) => {
                let ids = entry.all_ids();
                let urgent = operation.is_urgent();
                event!(Level::DEBUG, deltas = deltas.len(), "message produced deltas");
                ProcessOutcome::Delta(
                    deltas
                        .into_iter()
                        .map(|delta| {
                            let urgent = delta.urgent || urgent;
                            delta.urgent(urgent).with_sources(ids.clone())
                        })
                        .collect(),
                )
            }
            Ok(ProcessOutcome::NoOp(reason)) => {
                event!(Level::DEBUG, reason = %reason, "message is a no-op");
                ProcessOutcome::NoOp(reason)
            }
            Ok(other) => other,
            Err(err) => {
                event!(Level::WARN, error = %err, "rejecting message");
                ProcessOutcome::Rejected(err.to_string())
            }
        }
    }
}

fn verify_deltas(outcome: ProcessOutcome) -> Result<ProcessOutcome> {
    if let ProcessOutcome::Delta(deltas) = &outcome {
        for delta in deltas {
            if let DeltaState::Collection(collection) = &delta.new_state {
                collection.check_invariants()?;
            }
        }
    }
    Ok(outcome)
}

fn malformed(reason: impl Into<String>) -> OverseerError {
    OverseerError::MalformedMessage(reason.into())
}

fn no_op(reason: impl Into<String>) -> Result<ProcessOutcome> {
    Ok(ProcessOutcome::NoOp(reason.into()))
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(malformed(format!("invalid {} name '{}'", kind, name)));
    }
    Ok(())
}

fn checked_replication_factor(raw: u64, limits: &CollectionLimits) -> Result<u32> {
    if raw == 0 || raw > limits.max_replication_factor {
        return Err(malformed(format!(
            "replicationFactor {} outside 1..={}",
            raw, limits.max_replication_factor
        )));
    }
    u32::try_from(raw).map_err(|_| malformed(format!("invalid replicationFactor {}", raw)))
}

fn comma_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

include!("processor/collection_ops.rs");
include!("processor/replica_ops.rs");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ClusterEventType;
    use crate::overseer::election::LeaderElector;
    use crate::overseer::queue::coalesce;
    use crate::store::{CoordinationStore, InMemoryCoordinationStore};
    use std::collections::BTreeSet;

    struct ProcessorFixture {
        processor: MutationProcessor,
        status: Arc<StatusCell>,
        state: ClusterState,
        next_sequence: u64,
    }

    impl ProcessorFixture {
        async fn new(live: &[&str]) -> Self {
            let store = Arc::new(InMemoryCoordinationStore::new());
            let session = store.open_session().await.unwrap();
            let leadership = LeaderElector::new(store, session, "/overseer_elect/election")
                .campaign("test-overseer")
                .await
                .unwrap();
            let status = Arc::new(StatusCell::new(OverseerStatus::Leading));
            let mut state = ClusterState::new();
            state.set_live_nodes(live.iter().map(|n| n.to_string()).collect::<BTreeSet<_>>());
            Self {
                processor: MutationProcessor::new(status.clone(), leadership),
                status,
                state,
                next_sequence: 0,
            }
        }

        fn entry(&mut self, message: StateChangeMessage) -> QueueEntry {
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            QueueEntry {
                id: format!("qn-{:010}", sequence),
                sequence,
                message,
                superseded: Vec::new(),
            }
        }

        /// Processes and applies, committing every delta at version+1.
        fn run(&mut self, message: StateChangeMessage) -> ProcessOutcome {
            let entry = self.entry(message);
            self.apply(&entry)
        }

        /// Applies a batch in order and returns the events it would publish.
        fn apply_batch(&mut self, batch: &[QueueEntry]) -> Vec<ClusterEventType> {
            let mut published = Vec::new();
            for entry in batch {
                if let ProcessOutcome::Delta(deltas) = self.apply(entry) {
                    published.extend(
                        deltas
                            .iter()
                            .flat_map(|d| d.events.iter().map(ClusterEvent::event_type)),
                    );
                }
            }
            published
        }

        fn apply(&mut self, entry: &QueueEntry) -> ProcessOutcome {
            let outcome = self.processor.process(&self.state, entry);
            if let ProcessOutcome::Delta(deltas) = &outcome {
                for delta in deltas {
                    delta.apply_to(&mut self.state);
                    if let DeltaState::Collection(c) = &delta.new_state {
                        let next = delta.previous_version.map(|v| v + 1).unwrap_or(0);
                        self.state.set_collection_version(&c.name, next);
                    }
                }
            }
            outcome
        }

        fn activate(&mut self, collection: &str, replica: &str) {
            let outcome =
                self.run(StateChangeMessage::set_replica_state(collection, replica, "active"));
            assert!(matches!(outcome, ProcessOutcome::Delta(_)), "{:?}", outcome);
        }

        fn shard(&self, collection: &str, shard: &str) -> Shard {
            self.state
                .collection(collection)
                .and_then(|c| c.shard(shard))
                .cloned()
                .unwrap()
        }
    }

    fn single_delta(outcome: ProcessOutcome) -> StateDelta {
        match outcome {
            ProcessOutcome::Delta(mut deltas) if deltas.len() == 1 => deltas.remove(0),
            other => panic!("expected one delta, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn create_collection_places_replicas_round_robin() {
        let mut fx = ProcessorFixture::new(&["n1", "n2"]).await;
        let delta = single_delta(fx.run(StateChangeMessage::create_collection("foo", 2, 2)));
        assert!(delta.urgent);
        assert_eq!(delta.previous_version, None);
        assert_eq!(delta.source_ids, vec!["qn-0000000000".to_string()]);
        assert_eq!(delta.events[0].event_type(), ClusterEventType::CollectionsAdded);

        let foo = fx.state.collection("foo").unwrap();
        assert_eq!(foo.replica_count(), 4);
        let shard1 = foo.shard("shard1").unwrap();
        assert_eq!(shard1.range.as_deref(), Some("80000000-ffffffff"));
        assert_eq!(shard1.replicas["core_node1"].node_name, "n1");
        assert_eq!(shard1.replicas["core_node2"].node_name, "n2");
        assert!(shard1.replicas.values().all(|r| r.state == ReplicaState::Down));
        assert_eq!(
            foo.shard("shard2").unwrap().range.as_deref(),
            Some("00000000-7fffffff")
        );

        let replay = fx.run(StateChangeMessage::create_collection("foo", 2, 2));
        assert!(matches!(replay, ProcessOutcome::NoOp(_)));
    }

    #[tokio::test]
    async fn create_collection_without_nodes_is_rejected() {
        let mut fx = ProcessorFixture::new(&[]).await;
        let outcome = fx.run(StateChangeMessage::create_collection("foo", 1, 1));
        assert!(matches!(outcome, ProcessOutcome::Rejected(_)));

        let named = StateChangeMessage::create_collection("bar", 1, 1)
            .with("shards", "a,b")
            .with("createNodeSet", "x");
        fx.run(named);
        let bar = fx.state.collection("bar").unwrap();
        assert_eq!(
            bar.shards.keys().cloned().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn leader_going_down_clears_designation_and_reports_replica() {
        let mut fx = ProcessorFixture::new(&["n1"]).await;
        fx.run(StateChangeMessage::create_collection("foo", 1, 2));
        fx.activate("foo", "core_node1");
        fx.activate("foo", "core_node2");
        single_delta(fx.run(StateChangeMessage::set_shard_leader("foo", "shard1", "core_node1")));
        assert_eq!(fx.shard("foo", "shard1").leader.as_deref(), Some("core_node1"));

        let delta =
            single_delta(fx.run(StateChangeMessage::set_replica_state("foo", "core_node1", "down")));
        assert_eq!(delta.events.len(), 1);
        match &delta.events[0] {
            ClusterEvent::ReplicasDown { replicas, .. } => {
                assert_eq!(replicas[0].replica, "core_node1");
                assert_eq!(replicas[0].shard, "shard1");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(fx.shard("foo", "shard1").leader, None);

        let again = fx.run(StateChangeMessage::set_replica_state("foo", "core_node1", "down"));
        assert!(matches!(again, ProcessOutcome::NoOp(_)));
    }

    #[tokio::test]
    async fn coalesced_batch_matches_one_by_one_application() {
        let mut fx = ProcessorFixture::new(&["n1"]).await;
        fx.run(StateChangeMessage::create_collection("foo", 1, 2));
        fx.activate("foo", "core_node1");
        fx.run(StateChangeMessage::set_shard_leader("foo", "shard1", "core_node1"));
        let baseline = fx.state.clone();

        let batches = vec![
            vec![
                fx.entry(StateChangeMessage::set_replica_state("foo", "core_node1", "down")),
                fx.entry(StateChangeMessage::set_replica_state("foo", "core_node1", "active")),
            ],
            vec![
                fx.entry(StateChangeMessage::set_shard_leader("foo", "shard1", "core_node1")),
                fx.entry(StateChangeMessage::set_shard_leader("foo", "shard1", "core_node2")),
            ],
        ];
        for batch in batches {
            fx.state = baseline.clone();
            let one_by_one_events = fx.apply_batch(&batch);
            let one_by_one = fx.shard("foo", "shard1");

            fx.state = baseline.clone();
            let merged_events = fx.apply_batch(&coalesce(batch));
            let merged = fx.shard("foo", "shard1");

            assert_eq!(merged.leader, one_by_one.leader);
            assert_eq!(merged.replicas, one_by_one.replicas);
            assert_eq!(merged_events, one_by_one_events);
        }
        fx.state = baseline;
        let down_then_up = vec![
            fx.entry(StateChangeMessage::set_replica_state("foo", "core_node1", "down")),
            fx.entry(StateChangeMessage::set_replica_state("foo", "core_node1", "active")),
        ];
        assert_eq!(
            fx.apply_batch(&coalesce(down_then_up)),
            vec![ClusterEventType::ReplicasDown]
        );
        assert_eq!(fx.shard("foo", "shard1").leader, None);
    }

    #[tokio::test]
    async fn oversized_layouts_are_rejected() {
        let mut fx = ProcessorFixture::new(&["n1"]).await;
        let huge = StateChangeMessage::new(Operation::CreateCollection)
            .with("name", "huge")
            .with("numShards", 10_000_000_000u64);
        assert!(matches!(fx.run(huge), ProcessOutcome::Rejected(_)));
        let wide = StateChangeMessage::create_collection("wide", 1, 1)
            .with("replicationFactor", 100_000u64);
        assert!(matches!(fx.run(wide), ProcessOutcome::Rejected(_)));
        assert!(!fx.state.has_collection("huge") && !fx.state.has_collection("wide"));

        fx.processor = MutationProcessor::new(fx.status.clone(), fx.processor.leadership.clone())
            .with_limits(CollectionLimits {
                max_shards_per_collection: 2,
                max_replication_factor: 1,
                max_replicas_per_shard: 2,
            });
        let listed = StateChangeMessage::new(Operation::CreateCollection)
            .with("name", "listed")
            .with("shards", "a,b,c");
        assert!(matches!(fx.run(listed), ProcessOutcome::Rejected(_)));
        single_delta(fx.run(StateChangeMessage::create_collection("foo", 2, 1)));
        single_delta(fx.run(StateChangeMessage::add_replica("foo", "shard1", "n1")));
        let full = fx.run(StateChangeMessage::add_replica("foo", "shard1", "n1"));
        assert!(matches!(full, ProcessOutcome::Rejected(_)));
        let modify = StateChangeMessage::new(Operation::ModifyCollection)
            .with("collection", "foo")
            .with("replicationFactor", 2u64);
        assert!(matches!(fx.run(modify), ProcessOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn ineligible_leader_is_rejected_and_leader_unchanged() {
        let mut fx = ProcessorFixture::new(&["n1"]).await;
        fx.run(StateChangeMessage::create_collection("foo", 1, 2));
        fx.activate("foo", "core_node1");
        fx.run(StateChangeMessage::set_shard_leader("foo", "shard1", "core_node1"));

        let outcome = fx.run(StateChangeMessage::set_shard_leader("foo", "shard1", "core_node2"));
        assert!(matches!(outcome, ProcessOutcome::Rejected(_)));
        assert_eq!(fx.shard("foo", "shard1").leader.as_deref(), Some("core_node1"));

        let pull = StateChangeMessage::add_replica("foo", "shard1", "n1")
            .with("replica", "pull1")
            .with("type", "PULL")
            .with("state", "active");
        single_delta(fx.run(pull));
        let outcome = fx.run(StateChangeMessage::set_shard_leader("foo", "shard1", "pull1"));
        assert!(matches!(outcome, ProcessOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn replayed_add_replica_converges() {
        let mut fx = ProcessorFixture::new(&["n1"]).await;
        fx.run(StateChangeMessage::create_collection("foo", 1, 1));
        let entry = fx.entry(StateChangeMessage::add_replica("foo", "shard1", "n1"));

        let first = fx.processor.process(&fx.state, &entry);
        let delta = single_delta(first);
        delta.apply_to(&mut fx.state);
        let replay = fx.processor.process(&fx.state, &entry);
        assert!(matches!(replay, ProcessOutcome::NoOp(_)));
        assert_eq!(fx.state.collection("foo").unwrap().replica_count(), 2);
        assert!(
            fx.state
                .collection("foo")
                .unwrap()
                .find_replica(&format!("core_node_{}", entry.sequence))
                .is_some()
        );
    }

    #[tokio::test]
    async fn removing_the_leader_replica_clears_the_leader() {
        let mut fx = ProcessorFixture::new(&["n1"]).await;
        fx.run(StateChangeMessage::create_collection("foo", 1, 2));
        fx.activate("foo", "core_node2");
        fx.run(StateChangeMessage::set_shard_leader("foo", "shard1", "core_node2"));

        single_delta(fx.run(StateChangeMessage::remove_replica("foo", "shard1", "core_node2")));
        let shard = fx.shard("foo", "shard1");
        assert_eq!(shard.leader, None);
        assert_eq!(shard.replicas.len(), 1);
        assert!(matches!(
            fx.run(StateChangeMessage::remove_replica("foo", "shard1", "core_node2")),
            ProcessOutcome::NoOp(_)
        ));
    }

    #[tokio::test]
    async fn down_node_touches_every_affected_collection() {
        let mut fx = ProcessorFixture::new(&["n1", "n2"]).await;
        fx.run(StateChangeMessage::create_collection("a", 1, 2));
        fx.run(StateChangeMessage::create_collection("b", 1, 1).with("createNodeSet", "n1"));
        fx.run(StateChangeMessage::create_collection("c", 1, 1).with("createNodeSet", "n2"));
        fx.activate("a", "core_node1");
        fx.activate("b", "core_node1");
        fx.run(StateChangeMessage::set_shard_leader("a", "shard1", "core_node1"));

        match fx.run(StateChangeMessage::down_node("n1")) {
            ProcessOutcome::Delta(deltas) => {
                let targets: Vec<String> = deltas.iter().map(|d| d.target.to_string()).collect();
                assert_eq!(targets, vec!["collection:a", "collection:b"]);
                assert!(deltas.iter().all(|d| d.source_ids == deltas[0].source_ids));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(fx.shard("a", "shard1").leader, None);
        assert!(matches!(
            fx.run(StateChangeMessage::down_node("n1")),
            ProcessOutcome::NoOp(_)
        ));
    }

    #[tokio::test]
    async fn shard_state_and_collection_modifications() {
        let mut fx = ProcessorFixture::new(&["n1"]).await;
        fx.run(StateChangeMessage::create_collection("foo", 1, 1));
        single_delta(fx.run(StateChangeMessage::set_shard_state("foo", "shard1", "inactive")));
        assert_eq!(fx.shard("foo", "shard1").state, ShardState::Inactive);
        assert!(matches!(
            fx.run(StateChangeMessage::set_shard_state("foo", "missing", "active")),
            ProcessOutcome::NoOp(_)
        ));

        let modify = StateChangeMessage::new(Operation::ModifyCollection)
            .with("collection", "foo")
            .with("replicationFactor", 3);
        single_delta(fx.run(modify.clone()));
        assert_eq!(fx.state.collection("foo").unwrap().config.replication_factor, 3);
        assert!(matches!(fx.run(modify), ProcessOutcome::NoOp(_)));

        let delta = single_delta(fx.run(StateChangeMessage::delete_collection("foo")));
        assert!(delta.urgent);
        assert_eq!(delta.new_state, DeltaState::Deleted);
        assert!(matches!(
            fx.run(StateChangeMessage::delete_collection("foo")),
            ProcessOutcome::NoOp(_)
        ));
    }

    #[tokio::test]
    async fn cluster_properties_are_set_and_removed() {
        let mut fx = ProcessorFixture::new(&["n1"]).await;
        let set = StateChangeMessage::cluster_config_changed("urlScheme", Some("https".into()));
        let delta = single_delta(fx.run(set.clone()));
        assert_eq!(delta.events[0].event_type(), ClusterEventType::ClusterConfigChanged);
        assert_eq!(
            fx.state.properties().get("urlScheme"),
            Some(&serde_json::Value::from("https"))
        );
        assert!(matches!(fx.run(set), ProcessOutcome::NoOp(_)));

        single_delta(fx.run(StateChangeMessage::cluster_config_changed("urlScheme", None)));
        assert!(fx.state.properties().get("urlScheme").is_none());
    }

    #[tokio::test]
    async fn inactive_overseer_abandons_and_malformed_is_rejected() {
        let mut fx = ProcessorFixture::new(&["n1"]).await;
        let outcome = fx.run(StateChangeMessage::default());
        assert!(matches!(outcome, ProcessOutcome::Rejected(_)));
        let outcome = fx.run(StateChangeMessage::new(Operation::CreateCollection));
        assert!(matches!(outcome, ProcessOutcome::Rejected(_)));

        fx.status.set(OverseerStatus::Stopping);
        let outcome = fx.run(StateChangeMessage::create_collection("foo", 1, 1));
        assert_eq!(outcome, ProcessOutcome::Abandoned);
        assert!(!fx.state.has_collection("foo"));
    }

    #[test]
    fn status_cell_transitions_are_checked() {
        let cell = StatusCell::default();
        assert_eq!(cell.get(), OverseerStatus::Idle);
        assert!(cell.transition(OverseerStatus::Idle, OverseerStatus::Leading));
        assert!(!cell.transition(OverseerStatus::Idle, OverseerStatus::Stopped));
        assert_eq!(cell.get(), OverseerStatus::Leading);
    }

    #[test]
    fn hash_ranges_cover_the_whole_space() {
        let ranges = hash_ranges(4);
        assert_eq!(
            ranges,
            vec![
                Some("80000000-bfffffff".to_string()),
                Some("c0000000-ffffffff".to_string()),
                Some("00000000-3fffffff".to_string()),
                Some("40000000-7fffffff".to_string()),
            ]
        );
        assert_eq!(hash_ranges(1), vec![Some("80000000-7fffffff".to_string())]);
    }
}
