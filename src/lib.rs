// ============================================================================
// RustOverseer Library
// ============================================================================

pub mod cluster;
pub mod config;
pub mod core;
pub mod events;
pub mod overseer;
pub mod store;

// Re-export main types for convenience
pub use cluster::{
    ClusterProperties, ClusterState, ClusterStateReader, Collection, Replica, ReplicaState,
    ReplicaType, Shard, ShardState,
};
pub use config::{CollectionLimits, EventBusPolicy, OverseerConfig, QueuePolicy, RetryPolicy, WriterPolicy};
pub use core::{OverseerError, Result};
pub use events::{ClusterEvent, ClusterEventBus, ClusterEventListener, ClusterEventType};
pub use overseer::{
    FlushReport, LeaderElector, LeadershipHandle, Overseer, OverseerStatus, ShardLeaderElection,
    ShardLeaderPhase, StateChangeMessage, WorkQueue,
};
pub use store::{CoordinationStore, InMemoryCoordinationStore, SessionId};
