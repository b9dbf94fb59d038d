//! The overseer: election, work queue, mutation processing and the state
//! writer, plus the shard leader elections every node runs.

pub mod delta;
pub mod election;
pub mod message;
pub mod processor;
pub mod queue;
pub mod runtime;
pub mod shard_leader;
pub mod writer;

pub use delta::{DeltaState, DeltaTarget, StateDelta};
pub use election::{Candidacy, FencingToken, LeaderElector, LeadershipHandle};
pub use message::{Operation, StateChangeMessage};
pub use processor::{MutationProcessor, OverseerStatus, ProcessOutcome, StatusCell};
pub use queue::{QueueEntry, QueueReceipt, WorkQueue, coalesce};
pub use runtime::Overseer;
pub use shard_leader::{ReplicaKey, ShardLeaderElection, ShardLeaderPhase, shard_phase};
pub use writer::{FlushReport, StateWriter, UpdateReceipt};
