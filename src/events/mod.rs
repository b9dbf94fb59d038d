//! Typed cluster events and the in-process bus that delivers them.

pub mod bus;
pub mod event;

pub use bus::{ClusterEventBus, ClusterEventListener, FnListener, Subscription};
pub use event::{ClusterEvent, ClusterEventType, ReplicaRef};
