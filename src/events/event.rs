use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterEventType {
    NodesDown,
    NodesUp,
    CollectionsAdded,
    CollectionsRemoved,
    ReplicasDown,
    ClusterConfigChanged,
}

impl fmt::Display for ClusterEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NodesDown => "NODES_DOWN",
            Self::NodesUp => "NODES_UP",
            Self::CollectionsAdded => "COLLECTIONS_ADDED",
            Self::CollectionsRemoved => "COLLECTIONS_REMOVED",
            Self::ReplicasDown => "REPLICAS_DOWN",
            Self::ClusterConfigChanged => "CLUSTER_CONFIG_CHANGED",
        };
        f.write_str(text)
    }
}

/// Identifies one replica inside the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaRef {
    pub collection: String,
    pub shard: String,
    pub replica: String,
    pub node_name: String,
}

/// Typed, timestamped cluster event.
///
/// Events are derived from committed state transitions and are informational
/// only: the cluster state stays the authority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterEvent {
    NodesDown {
        timestamp: DateTime<Utc>,
        nodes: Vec<String>,
    },
    NodesUp {
        timestamp: DateTime<Utc>,
        nodes: Vec<String>,
    },
    CollectionsAdded {
        timestamp: DateTime<Utc>,
        collections: Vec<String>,
    },
    CollectionsRemoved {
        timestamp: DateTime<Utc>,
        collections: Vec<String>,
    },
    ReplicasDown {
        timestamp: DateTime<Utc>,
        replicas: Vec<ReplicaRef>,
    },
    ClusterConfigChanged {
        timestamp: DateTime<Utc>,
        changed_keys: Vec<String>,
    },
}

impl ClusterEvent {
    pub fn nodes_down(nodes: Vec<String>) -> Self {
        Self::NodesDown {
            timestamp: Utc::now(),
            nodes,
        }
    }

    pub fn nodes_up(nodes: Vec<String>) -> Self {
        Self::NodesUp {
            timestamp: Utc::now(),
            nodes,
        }
    }

    pub fn collections_added(collections: Vec<String>) -> Self {
        Self::CollectionsAdded {
            timestamp: Utc::now(),
            collections,
        }
    }

    pub fn collections_removed(collections: Vec<String>) -> Self {
        Self::CollectionsRemoved {
            timestamp: Utc::now(),
            collections,
        }
    }

    pub fn replicas_down(replicas: Vec<ReplicaRef>) -> Self {
        Self::ReplicasDown {
            timestamp: Utc::now(),
            replicas,
        }
    }

    pub fn cluster_config_changed(changed_keys: Vec<String>) -> Self {
        Self::ClusterConfigChanged {
            timestamp: Utc::now(),
            changed_keys,
        }
    }

    pub fn event_type(&self) -> ClusterEventType {
        match self {
            Self::NodesDown { .. } => ClusterEventType::NodesDown,
            Self::NodesUp { .. } => ClusterEventType::NodesUp,
            Self::CollectionsAdded { .. } => ClusterEventType::CollectionsAdded,
            Self::CollectionsRemoved { .. } => ClusterEventType::CollectionsRemoved,
            Self::ReplicasDown { .. } => ClusterEventType::ReplicasDown,
            Self::ClusterConfigChanged { .. } => ClusterEventType::ClusterConfigChanged,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::NodesDown { timestamp, .. }
            | Self::NodesUp { timestamp, .. }
            | Self::CollectionsAdded { timestamp, .. }
            | Self::CollectionsRemoved { timestamp, .. }
            | Self::ReplicasDown { timestamp, .. }
            | Self::ClusterConfigChanged { timestamp, .. } => *timestamp,
        }
    }
}
