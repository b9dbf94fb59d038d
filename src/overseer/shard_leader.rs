//! Per-node shard leader election.
//!
//! Each node campaigns for the shards whose replicas it hosts, using the same
//! election primitive as the overseer. A replica that wins announces itself
//! through the work queue; the overseer records the designation.

use super::election::{Candidacy, LeaderElector, LeadershipHandle};
use super::message::StateChangeMessage;
use super::queue::WorkQueue;
use crate::cluster::{ClusterState, ClusterStateReader};
use crate::config::RetryPolicy;
use crate::core::{OverseerError, Result};
use crate::store::paths::shard_election_path;
use crate::store::{CoordinationStore, SessionId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardLeaderPhase {
    NoLeader,
    ElectionInProgress,
    LeaderAssigned,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaKey {
    pub collection: String,
    pub shard: String,
    pub replica: String,
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.collection, self.shard, self.replica)
    }
}

#[derive(Default)]
struct CampaignState {
    leadership: Option<LeadershipHandle>,
    announced: bool,
    /// Collection version observed since the last announcement.
    seen_version: Option<u64>,
}

struct Campaign {
    node_path: String,
    task: JoinHandle<()>,
    slot: Arc<Mutex<CampaignState>>,
}

/// What the observed state says about one local replica.
struct Observed {
    designated: bool,
    version: u64,
}

pub struct ShardLeaderElection {
    store: Arc<dyn CoordinationStore>,
    session: SessionId,
    node_name: String,
    queue: Arc<WorkQueue>,
    retry: RetryPolicy,
    campaigns: Mutex<BTreeMap<ReplicaKey, Campaign>>,
}

impl ShardLeaderElection {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        session: SessionId,
        node_name: impl Into<String>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            store,
            session,
            node_name: node_name.into(),
            queue,
            retry: RetryPolicy::default(),
            campaigns: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Replicas this node currently campaigns for.
    pub fn campaigning(&self) -> Result<Vec<ReplicaKey>> {
        Ok(self.campaigns.lock()?.keys().cloned().collect())
    }

    /// Whether this node currently holds the election for `key`.
    pub fn is_leading(&self, key: &ReplicaKey) -> Result<bool> {
        let campaigns = self.campaigns.lock()?;
        let Some(campaign) = campaigns.get(key) else {
            return Ok(false);
        };
        let slot = campaign.slot.lock()?;
        Ok(slot.leadership.as_ref().is_some_and(LeadershipHandle::is_leader))
    }

    fn local_eligible(&self, state: &ClusterState) -> BTreeMap<ReplicaKey, Observed> {
        let mut eligible = BTreeMap::new();
        for collection in state.collections() {
            for shard in collection.shards.values() {
                for replica in shard.replicas.values() {
                    if replica.node_name != self.node_name || !replica.is_leader_eligible() {
                        continue;
                    }
                    eligible.insert(
                        ReplicaKey {
                            collection: collection.name.clone(),
                            shard: shard.name.clone(),
                            replica: replica.name.clone(),
                        },
                        Observed {
                            designated: shard.leader.as_deref() == Some(replica.name.as_str()),
                            version: collection.version,
                        },
                    );
                }
            }
        }
        eligible
    }

    /// Reconciles campaigns with the observed state: eligible local replicas
    /// campaign, everything else withdraws. Leaders whose designation is
    /// still missing after a newer collection version announce again.
    pub async fn sync(&self, state: &ClusterState) -> Result<()> {
        let desired = self.local_eligible(state);
        let (stale, announce, missing) = {
            let mut campaigns = self.campaigns.lock()?;
            let stale_keys: Vec<ReplicaKey> = campaigns
                .iter()
                .filter(|(key, campaign)| !desired.contains_key(*key) || campaign.task.is_finished())
                .map(|(key, _)| key.clone())
                .collect();
            let stale: Vec<(ReplicaKey, Campaign)> = stale_keys
                .into_iter()
                .filter_map(|key| campaigns.remove(&key).map(|campaign| (key, campaign)))
                .collect();

            let mut announce = Vec::new();
            for (key, campaign) in campaigns.iter() {
                if let Some(observed) = desired.get(key) {
                    let mut slot = campaign.slot.lock()?;
                    if needs_announcement(&mut slot, observed) {
                        announce.push((key.clone(), campaign.slot.clone()));
                    }
                }
            }
            let missing: Vec<ReplicaKey> = desired
                .keys()
                .filter(|key| !campaigns.contains_key(*key))
                .cloned()
                .collect();
            (stale, announce, missing)
        };

        for (key, campaign) in stale {
            self.withdraw(&key, campaign).await;
        }
        for (key, slot) in announce {
            let announced = announce_leader(&self.queue, &key).await;
            slot.lock()?.announced = announced;
        }
        for key in missing {
            self.join(key).await?;
        }
        Ok(())
    }

    async fn join(&self, key: ReplicaKey) -> Result<()> {
        let elector = LeaderElector::new(
            self.store.clone(),
            self.session,
            shard_election_path(&key.collection, &key.shard),
        )
        .with_retry(self.retry.clone());
        let candidacy = elector.register(&key.replica).await?;
        let node_path = candidacy.node_path().to_string();
        let slot = Arc::new(Mutex::new(CampaignState::default()));

        let span = info_span!("shard.election", replica = %key);
        let task = tokio::spawn(
            contend(candidacy, key.clone(), self.queue.clone(), slot.clone()).instrument(span),
        );
        event!(Level::DEBUG, replica = %key, node = %node_path, "joined shard election");
        self.campaigns.lock()?.insert(
            key,
            Campaign {
                node_path,
                task,
                slot,
            },
        );
        Ok(())
    }

    async fn withdraw(&self, key: &ReplicaKey, campaign: Campaign) {
        campaign.task.abort();
        let leadership = match campaign.slot.lock() {
            Ok(mut slot) => slot.leadership.take(),
            Err(_) => None,
        };
        let result = match leadership {
            Some(handle) => handle.resign().await,
            None => match self.store.delete(&campaign.node_path, None).await {
                Ok(()) | Err(OverseerError::NoNode(_)) => Ok(()),
                Err(err) => Err(err),
            },
        };
        match result {
            Ok(()) => event!(Level::INFO, replica = %key, "left shard election"),
            Err(err) => {
                event!(Level::WARN, replica = %key, error = %err, "failed to leave shard election")
            }
        }
    }

    /// Leaves every election; used on shutdown.
    pub async fn withdraw_all(&self) -> Result<()> {
        let campaigns = std::mem::take(&mut *self.campaigns.lock()?);
        for (key, campaign) in campaigns {
            self.withdraw(&key, campaign).await;
        }
        Ok(())
    }

    pub async fn phase(
        &self,
        state: &ClusterState,
        collection: &str,
        shard: &str,
    ) -> Result<ShardLeaderPhase> {
        shard_phase(self.store.as_ref(), state, collection, shard).await
    }

    /// Re-syncs on every state change seen by `reader` until `shutdown`
    /// flips, then withdraws.
    pub fn run(
        self: Arc<Self>,
        reader: Arc<ClusterStateReader>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let span = info_span!("shard.elections", node = %self.node_name);
        tokio::spawn(
            async move {
                let mut changes = reader.subscribe();
                let mut failures = 0u32;
                loop {
                    let synced = match reader.snapshot() {
                        Ok(state) => self.sync(&state).await,
                        Err(err) => Err(err),
                    };
                    match synced {
                        Ok(()) => failures = 0,
                        Err(err) => {
                            failures = failures.saturating_add(1);
                            event!(Level::WARN, error = %err, failures, "shard election sync failed");
                        }
                    }
                    let retry_after = (failures > 0).then(|| self.retry.backoff(failures));
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        changed = changes.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = sleep_or_never(retry_after) => {}
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                if let Err(err) = self.withdraw_all().await {
                    event!(Level::WARN, error = %err, "failed to withdraw shard elections");
                }
            }
            .instrument(span),
        )
    }
}

async fn sleep_or_never(duration: Option<std::time::Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

fn needs_announcement(slot: &mut CampaignState, observed: &Observed) -> bool {
    let leading = slot
        .leadership
        .as_ref()
        .is_some_and(LeadershipHandle::is_leader);
    if !leading {
        return false;
    }
    if observed.designated {
        slot.seen_version = Some(observed.version);
        return false;
    }
    if !slot.announced {
        slot.seen_version = Some(observed.version);
        return true;
    }
    match slot.seen_version {
        Some(seen) if seen < observed.version => {
            slot.seen_version = Some(observed.version);
            true
        }
        _ => {
            slot.seen_version = Some(observed.version);
            false
        }
    }
}

async fn contend(
    candidacy: Candidacy,
    key: ReplicaKey,
    queue: Arc<WorkQueue>,
    slot: Arc<Mutex<CampaignState>>,
) {
    let leadership = match candidacy.wait_for_leadership().await {
        Ok(handle) => handle,
        Err(err) => {
            event!(Level::WARN, replica = %key, error = %err, "shard election ended without leadership");
            return;
        }
    };
    if let Ok(mut slot) = slot.lock() {
        slot.leadership = Some(leadership.clone());
    }
    let announced = announce_leader(&queue, &key).await;
    if let Ok(mut slot) = slot.lock() {
        slot.announced = announced;
    }
    leadership.lost().await;
    event!(Level::INFO, replica = %key, "shard leadership lost");
}

async fn announce_leader(queue: &WorkQueue, key: &ReplicaKey) -> bool {
    let message = StateChangeMessage::set_shard_leader(&key.collection, &key.shard, &key.replica);
    match queue.enqueue(&message).await {
        Ok(receipt) => {
            event!(Level::INFO, replica = %key, id = %receipt.id, "announced shard leader");
            true
        }
        Err(err) => {
            event!(Level::WARN, replica = %key, error = %err, "shard leader announcement failed");
            false
        }
    }
}

/// Leader phase of one shard from the designation and the candidates present.
pub async fn shard_phase(
    store: &dyn CoordinationStore,
    state: &ClusterState,
    collection: &str,
    shard: &str,
) -> Result<ShardLeaderPhase> {
    let assigned = state
        .collection(collection)
        .and_then(|c| c.shard(shard))
        .and_then(|s| s.leader_replica())
        .is_some_and(|leader| leader.is_leader_eligible());
    if assigned {
        return Ok(ShardLeaderPhase::LeaderAssigned);
    }
    let candidates = match store
        .get_children(&shard_election_path(collection, shard))
        .await
    {
        Ok(children) => children.len(),
        Err(OverseerError::NoNode(_)) => 0,
        Err(err) => return Err(err),
    };
    Ok(if candidates > 0 {
        ShardLeaderPhase::ElectionInProgress
    } else {
        ShardLeaderPhase::NoLeader
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Collection, CollectionConfig, Replica, ReplicaState, ReplicaType, Shard, ShardState};
    use crate::overseer::message::Operation;
    use crate::store::paths::OVERSEER_QUEUE_PATH;
    use crate::store::InMemoryCoordinationStore;
    use std::time::Duration;

    fn replica(name: &str, node: &str, replica_type: ReplicaType) -> Replica {
        let mut replica = Replica::new(name, node, replica_type);
        replica.state = ReplicaState::Active;
        replica
    }

    fn cluster_state() -> ClusterState {
        let mut shard = Shard::new("shard1", ShardState::Active);
        for r in [
            replica("r1", "n1", ReplicaType::Nrt),
            replica("r2", "n2", ReplicaType::Tlog),
            replica("r3", "n1", ReplicaType::Pull),
        ] {
            shard.replicas.insert(r.name.clone(), r);
        }
        let mut collection = Collection::new("c", CollectionConfig::default());
        collection.shards.insert(shard.name.clone(), shard);
        let mut state = ClusterState::new();
        state.put_collection(collection);
        state
    }

    async fn node(store: &Arc<InMemoryCoordinationStore>, name: &str) -> ShardLeaderElection {
        let session = store.open_session().await.unwrap();
        let queue = Arc::new(
            WorkQueue::open(store.clone(), session, OVERSEER_QUEUE_PATH)
                .await
                .unwrap(),
        );
        ShardLeaderElection::new(store.clone(), session, name, queue)
    }

    async fn wait_for_announcement(queue: &WorkQueue, replica: &str) {
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let entries = queue.peek(100).await.unwrap();
                if entries.iter().any(|entry| {
                    entry.message.operation().ok() == Some(Operation::SetShardLeader)
                        && entry.message.get_str("replica").as_deref() == Some(replica)
                }) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(found.is_ok(), "no announcement for {}", replica);
    }

    #[tokio::test]
    async fn first_candidate_announces_and_pull_never_campaigns() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let n1 = node(&store, "n1").await;
        let state = cluster_state();

        n1.sync(&state).await.unwrap();
        let campaigning = n1.campaigning().unwrap();
        assert_eq!(campaigning.len(), 1);
        assert_eq!(campaigning[0].replica, "r1");
        wait_for_announcement(&n1.queue, "r1").await;
        assert!(n1.is_leading(&campaigning[0]).unwrap());

        let candidates = store
            .get_children(&shard_election_path("c", "shard1"))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn phases_follow_designation_and_candidates() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let n1 = node(&store, "n1").await;
        let mut state = cluster_state();
        assert_eq!(
            n1.phase(&state, "c", "shard1").await.unwrap(),
            ShardLeaderPhase::NoLeader
        );

        n1.sync(&state).await.unwrap();
        assert_eq!(
            n1.phase(&state, "c", "shard1").await.unwrap(),
            ShardLeaderPhase::ElectionInProgress
        );

        state
            .collection_mut("c")
            .and_then(|c| c.shard_mut("shard1"))
            .unwrap()
            .set_leader("r1")
            .unwrap();
        assert_eq!(
            n1.phase(&state, "c", "shard1").await.unwrap(),
            ShardLeaderPhase::LeaderAssigned
        );
    }

    #[tokio::test]
    async fn downed_leader_hands_over_to_the_next_candidate() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let n1 = node(&store, "n1").await;
        let n2 = node(&store, "n2").await;
        let mut state = cluster_state();

        n1.sync(&state).await.unwrap();
        wait_for_announcement(&n1.queue, "r1").await;
        n2.sync(&state).await.unwrap();
        let r2 = n2.campaigning().unwrap().remove(0);
        assert!(!n2.is_leading(&r2).unwrap());

        let shard = state
            .collection_mut("c")
            .and_then(|c| c.shard_mut("shard1"))
            .unwrap();
        if let Some(r1) = shard.replicas.get_mut("r1") {
            r1.state = ReplicaState::Down;
        }
        n1.sync(&state).await.unwrap();
        assert!(n1.campaigning().unwrap().is_empty());

        wait_for_announcement(&n2.queue, "r2").await;
        assert!(n2.is_leading(&r2).unwrap());
    }

    #[tokio::test]
    async fn undesignated_leader_announces_again_after_a_newer_version() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let n1 = node(&store, "n1").await;
        let mut state = cluster_state();
        n1.sync(&state).await.unwrap();
        wait_for_announcement(&n1.queue, "r1").await;
        let key = n1.campaigning().unwrap().remove(0);
        let announced = |node: &ShardLeaderElection| {
            let campaigns = node.campaigns.lock().unwrap();
            let slot = campaigns.get(&key).unwrap().slot.lock().unwrap();
            slot.announced
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while !announced(&n1) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        n1.queue.remove_all(&queued_ids(&n1.queue).await).await.unwrap();
        n1.sync(&state).await.unwrap();
        assert_eq!(n1.queue.size().await.unwrap(), 0);

        state.set_collection_version("c", 3);
        n1.sync(&state).await.unwrap();
        assert_eq!(n1.queue.size().await.unwrap(), 1);
    }

    async fn queued_ids(queue: &WorkQueue) -> Vec<String> {
        queue
            .peek(100)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.id)
            .collect()
    }
}
