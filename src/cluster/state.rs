use crate::core::{OverseerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a shard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    Active,
    Construction,
    Recovery,
    Recovering,
    Inactive,
}

impl Default for ShardState {
    fn default() -> Self {
        Self::Active
    }
}

/// Liveness state of a replica.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Active,
    Down,
    Recovering,
    RecoveryFailed,
}

impl Default for ReplicaState {
    fn default() -> Self {
        Self::Down
    }
}

/// Replica role.
///
/// - `Nrt`: indexes locally, accepts writes and serves queries.
/// - `Tlog`: accepts writes through the replication log only.
/// - `Pull`: read-only copy that pulls from the shard leader.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicaType {
    Nrt,
    Tlog,
    Pull,
}

impl Default for ReplicaType {
    fn default() -> Self {
        Self::Nrt
    }
}

impl ReplicaType {
    /// PULL replicas never take part in shard leader election.
    pub fn can_lead(self) -> bool {
        matches!(self, Self::Nrt | Self::Tlog)
    }
}

macro_rules! impl_state_text {
    ($ty:ty, $($variant:ident => $text:literal),+ $(,)?) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = OverseerError;

            fn from_str(raw: &str) -> Result<Self> {
                let normalized = raw.trim().to_ascii_lowercase();
                match normalized.as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(OverseerError::MalformedMessage(format!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        raw
                    ))),
                }
            }
        }
    };
}

impl_state_text!(ShardState,
    Active => "active",
    Construction => "construction",
    Recovery => "recovery",
    Recovering => "recovering",
    Inactive => "inactive",
);

impl_state_text!(ReplicaState,
    Active => "active",
    Down => "down",
    Recovering => "recovering",
    RecoveryFailed => "recovery_failed",
);

impl_state_text!(ReplicaType,
    Nrt => "nrt",
    Tlog => "tlog",
    Pull => "pull",
);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Replica {
    pub name: String,
    pub node_name: String,
    #[serde(rename = "type", default)]
    pub replica_type: ReplicaType,
    #[serde(default)]
    pub state: ReplicaState,
}

impl Replica {
    pub fn new(name: impl Into<String>, node_name: impl Into<String>, replica_type: ReplicaType) -> Self {
        Self {
            name: name.into(),
            node_name: node_name.into(),
            replica_type,
            state: ReplicaState::Down,
        }
    }

    /// A replica may hold the shard leader designation only while it can lead
    /// by role and is ACTIVE.
    pub fn is_leader_eligible(&self) -> bool {
        self.replica_type.can_lead() && self.state == ReplicaState::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shard {
    pub name: String,
    #[serde(default)]
    pub state: ShardState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    #[serde(default)]
    pub replicas: BTreeMap<String, Replica>,
    /// Name of the leader replica; a key into `replicas`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
}

impl Shard {
    pub fn new(name: impl Into<String>, state: ShardState) -> Self {
        Self {
            name: name.into(),
            state,
            range: None,
            replicas: BTreeMap::new(),
            leader: None,
        }
    }

    pub fn leader_replica(&self) -> Option<&Replica> {
        self.leader
            .as_deref()
            .and_then(|name| self.replicas.get(name))
    }

    /// Designates `replica` as leader, replacing any previous designation.
    pub fn set_leader(&mut self, replica: &str) -> Result<()> {
        let candidate = self.replicas.get(replica).ok_or_else(|| {
            OverseerError::MalformedMessage(format!(
                "replica '{}' is not part of shard '{}'",
                replica, self.name
            ))
        })?;
        if !candidate.is_leader_eligible() {
            return Err(OverseerError::MalformedMessage(format!(
                "replica '{}' ({} / {}) cannot lead shard '{}'",
                replica, candidate.replica_type, candidate.state, self.name
            )));
        }
        self.leader = Some(replica.to_string());
        Ok(())
    }

    /// Drops the leader designation when it points at a missing or ineligible
    /// replica. Returns the cleared name.
    pub fn clear_ineligible_leader(&mut self) -> Option<String> {
        let keep = self
            .leader_replica()
            .map(Replica::is_leader_eligible)
            .unwrap_or(false);
        if keep { None } else { self.leader.take() }
    }

    pub fn active_eligible_replicas(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.values().filter(|r| r.is_leader_eligible())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RouterKind {
    #[serde(rename = "compositeId")]
    CompositeId,
    #[serde(rename = "implicit")]
    Implicit,
}

impl Default for RouterKind {
    fn default() -> Self {
        Self::CompositeId
    }
}

impl FromStr for RouterKind {
    type Err = OverseerError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim() {
            "compositeId" | "compositeid" => Ok(Self::CompositeId),
            "implicit" => Ok(Self::Implicit),
            other => Err(OverseerError::MalformedMessage(format!(
                "unknown router '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionConfig {
    #[serde(rename = "replicationFactor")]
    pub replication_factor: u32,
    #[serde(default)]
    pub router: RouterKind,
    #[serde(rename = "configName", default, skip_serializing_if = "Option::is_none")]
    pub config_name: Option<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            replication_factor: 1,
            router: RouterKind::CompositeId,
            config_name: None,
        }
    }
}

/// A collection document as persisted at `/collections/<name>/state.json`.
///
/// `version` is the store version of that document and is never serialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Collection {
    pub name: String,
    #[serde(flatten)]
    pub config: CollectionConfig,
    #[serde(default)]
    pub shards: BTreeMap<String, Shard>,
    #[serde(skip)]
    pub version: u64,
}

impl Collection {
    pub fn new(name: impl Into<String>, config: CollectionConfig) -> Self {
        Self {
            name: name.into(),
            config,
            shards: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn shard(&self, name: &str) -> Option<&Shard> {
        self.shards.get(name)
    }

    pub fn shard_mut(&mut self, name: &str) -> Option<&mut Shard> {
        self.shards.get_mut(name)
    }

    /// Finds the shard holding `replica`.
    pub fn find_replica(&self, replica: &str) -> Option<(&Shard, &Replica)> {
        self.shards
            .values()
            .find_map(|shard| shard.replicas.get(replica).map(|r| (shard, r)))
    }

    pub fn replica_count(&self) -> usize {
        self.shards.values().map(|shard| shard.replicas.len()).sum()
    }

    /// Highest numeric suffix among `core_node<N>` replica names.
    pub fn max_core_node_index(&self) -> u64 {
        self.shards
            .values()
            .flat_map(|shard| shard.replicas.keys())
            .filter_map(|name| name.strip_prefix("core_node"))
            .filter_map(|suffix| suffix.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
    }

    /// Verifies the leader invariants of every shard.
    pub fn check_invariants(&self) -> Result<()> {
        for shard in self.shards.values() {
            if let Some(leader) = shard.leader.as_deref() {
                let replica = shard.replicas.get(leader).ok_or_else(|| {
                    OverseerError::InvariantViolation(format!(
                        "shard {}/{} leader '{}' is not a replica",
                        self.name, shard.name, leader
                    ))
                })?;
                if !replica.is_leader_eligible() {
                    return Err(OverseerError::InvariantViolation(format!(
                        "shard {}/{} leader '{}' is not eligible",
                        self.name, shard.name, leader
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8], version: u64) -> Result<Self> {
        let mut collection: Collection = serde_json::from_slice(bytes)?;
        collection.version = version;
        Ok(collection)
    }
}

/// Cluster-wide properties stored at `/clusterprops.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClusterProperties {
    #[serde(flatten)]
    pub values: BTreeMap<String, serde_json::Value>,
    /// Store version; `None` while the document does not exist.
    #[serde(skip)]
    pub version: Option<u64>,
}

impl ClusterProperties {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8], version: u64) -> Result<Self> {
        let mut props: ClusterProperties = if bytes.is_empty() {
            ClusterProperties::default()
        } else {
            serde_json::from_slice(bytes)?
        };
        props.version = Some(version);
        Ok(props)
    }
}

/// In-memory view of the whole cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterState {
    collections: BTreeMap<String, Collection>,
    live_nodes: BTreeSet<String>,
    properties: ClusterProperties,
    clock: u64,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    pub fn collection_mut(&mut self, name: &str) -> Option<&mut Collection> {
        self.collections.get_mut(name)
    }

    pub fn collections(&self) -> impl Iterator<Item = &Collection> {
        self.collections.values()
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn put_collection(&mut self, collection: Collection) {
        self.collections.insert(collection.name.clone(), collection);
        self.tick();
    }

    pub fn remove_collection(&mut self, name: &str) -> Option<Collection> {
        let removed = self.collections.remove(name);
        if removed.is_some() {
            self.tick();
        }
        removed
    }

    /// Records the store version a committed write produced.
    pub fn set_collection_version(&mut self, name: &str, version: u64) {
        if let Some(collection) = self.collections.get_mut(name) {
            collection.version = version;
        }
    }

    pub fn live_nodes(&self) -> &BTreeSet<String> {
        &self.live_nodes
    }

    pub fn is_live(&self, node_name: &str) -> bool {
        self.live_nodes.contains(node_name)
    }

    pub fn set_live_nodes(&mut self, nodes: BTreeSet<String>) {
        if self.live_nodes != nodes {
            self.live_nodes = nodes;
            self.tick();
        }
    }

    pub fn properties(&self) -> &ClusterProperties {
        &self.properties
    }

    pub fn set_properties(&mut self, properties: ClusterProperties) {
        self.properties = properties;
        self.tick();
    }

    /// Takes over the content of a freshly loaded state. The clock advances
    /// only when something differs, so it stays monotonic across reloads.
    pub fn absorb(&mut self, loaded: ClusterState) -> bool {
        let changed = self.collections != loaded.collections
            || self.live_nodes != loaded.live_nodes
            || self.properties != loaded.properties;
        if changed {
            self.collections = loaded.collections;
            self.live_nodes = loaded.live_nodes;
            self.properties = loaded.properties;
            self.tick();
        }
        changed
    }

    /// Logical clock bumped on every observed change.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    fn tick(&mut self) -> u64 {
        self.clock = self.clock.saturating_add(1);
        self.clock
    }
}
