use crate::core::{OverseerError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateCollection,
    DeleteCollection,
    ModifyCollection,
    AddReplica,
    RemoveReplica,
    SetShardState,
    SetReplicaState,
    SetShardLeader,
    DownNode,
    ClusterConfigChanged,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateCollection => "create_collection",
            Self::DeleteCollection => "delete_collection",
            Self::ModifyCollection => "modify_collection",
            Self::AddReplica => "add_replica",
            Self::RemoveReplica => "remove_replica",
            Self::SetShardState => "set_shard_state",
            Self::SetReplicaState => "set_replica_state",
            Self::SetShardLeader => "set_shard_leader",
            Self::DownNode => "down_node",
            Self::ClusterConfigChanged => "cluster_config_changed",
        }
    }

    /// Collection creation and deletion are flushed without waiting for the
    /// batch thresholds.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::CreateCollection | Self::DeleteCollection)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = OverseerError;

    fn from_str(raw: &str) -> Result<Self> {
        let op = match raw.trim().to_ascii_lowercase().as_str() {
            "create_collection" | "create" => Self::CreateCollection,
            "delete_collection" | "delete" => Self::DeleteCollection,
            "modify_collection" | "modifycollection" => Self::ModifyCollection,
            "add_replica" | "addreplica" => Self::AddReplica,
            "remove_replica" | "deletereplica" => Self::RemoveReplica,
            "set_shard_state" | "updateshardstate" => Self::SetShardState,
            "set_replica_state" | "state" => Self::SetReplicaState,
            "set_shard_leader" | "leader" => Self::SetShardLeader,
            "down_node" | "downnode" => Self::DownNode,
            "cluster_config_changed" => Self::ClusterConfigChanged,
            other => {
                return Err(OverseerError::MalformedMessage(format!(
                    "unknown operation '{}'",
                    other
                )));
            }
        };
        Ok(op)
    }
}

/// A queued request to change the cluster state.
///
/// The payload is a flat JSON object whose `operation` key selects the
/// mutation; keys an operation does not know are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateChangeMessage {
    properties: BTreeMap<String, Value>,
}

impl StateChangeMessage {
    pub fn new(operation: Operation) -> Self {
        Self::default().with("operation", operation.as_str())
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn create_collection(name: &str, num_shards: u32, replication_factor: u32) -> Self {
        Self::new(Operation::CreateCollection)
            .with("name", name)
            .with("numShards", num_shards)
            .with("replicationFactor", replication_factor)
    }

    pub fn delete_collection(name: &str) -> Self {
        Self::new(Operation::DeleteCollection).with("name", name)
    }

    pub fn add_replica(collection: &str, shard: &str, node_name: &str) -> Self {
        Self::new(Operation::AddReplica)
            .with("collection", collection)
            .with("shard", shard)
            .with("node", node_name)
    }

    pub fn remove_replica(collection: &str, shard: &str, replica: &str) -> Self {
        Self::new(Operation::RemoveReplica)
            .with("collection", collection)
            .with("shard", shard)
            .with("replica", replica)
    }

    pub fn set_shard_state(collection: &str, shard: &str, state: &str) -> Self {
        Self::new(Operation::SetShardState)
            .with("collection", collection)
            .with("shard", shard)
            .with("state", state)
    }

    pub fn set_replica_state(collection: &str, replica: &str, state: &str) -> Self {
        Self::new(Operation::SetReplicaState)
            .with("collection", collection)
            .with("replica", replica)
            .with("state", state)
    }

    pub fn set_shard_leader(collection: &str, shard: &str, replica: &str) -> Self {
        Self::new(Operation::SetShardLeader)
            .with("collection", collection)
            .with("shard", shard)
            .with("replica", replica)
    }

    pub fn down_node(node_name: &str) -> Self {
        Self::new(Operation::DownNode).with("node_name", node_name)
    }

    /// `value: None` removes the property.
    pub fn cluster_config_changed(name: &str, value: Option<Value>) -> Self {
        Self::new(Operation::ClusterConfigChanged)
            .with("name", name)
            .with("val", value.unwrap_or(Value::Null))
    }

    pub fn operation(&self) -> Result<Operation> {
        self.require_str("operation")?.parse()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// String value of `key`; numbers and booleans are rendered as text.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.properties.get(key)? {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            Value::Bool(flag) => Some(flag.to_string()),
            _ => None,
        }
    }

    pub fn require_str(&self, key: &str) -> Result<String> {
        self.get_str(key)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| OverseerError::MalformedMessage(format!("missing required '{}'", key)))
    }

    /// Unsigned integer value of `key`; numeric strings are accepted.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.properties.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(number)) => number.as_u64().map(Some).ok_or_else(|| {
                OverseerError::MalformedMessage(format!("'{}' must be a non-negative integer", key))
            }),
            Some(Value::String(text)) => text.trim().parse().map(Some).map_err(|_| {
                OverseerError::MalformedMessage(format!("'{}' must be a non-negative integer", key))
            }),
            Some(_) => Err(OverseerError::MalformedMessage(format!(
                "'{}' must be a non-negative integer",
                key
            ))),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| OverseerError::MalformedMessage(format!("undecodable message: {}", err)))
    }
}
