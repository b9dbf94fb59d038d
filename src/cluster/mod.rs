//! Cluster state model plus the read side used by every node.

pub mod live_nodes;
pub mod reader;
pub mod state;

pub use live_nodes::{LiveNodesDiff, LiveNodesWatcher, register_live_node};
pub use reader::{
    ClusterStateReader, load_cluster_properties, load_cluster_state, load_collection,
};
pub use state::{
    ClusterProperties, ClusterState, Collection, CollectionConfig, Replica, ReplicaState,
    ReplicaType, RouterKind, Shard, ShardState,
};
