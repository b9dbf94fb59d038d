use crate::cluster::{ClusterProperties, ClusterState, Collection};
use crate::events::ClusterEvent;
use crate::store::paths::{CLUSTER_PROPS_PATH, collection_state_path};
use std::fmt;
use tracing::{Level, event};

/// The persisted document a delta rewrites.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeltaTarget {
    Collection(String),
    ClusterProperties,
}

impl DeltaTarget {
    pub fn store_path(&self) -> String {
        match self {
            Self::Collection(name) => collection_state_path(name),
            Self::ClusterProperties => CLUSTER_PROPS_PATH.to_string(),
        }
    }
}

impl fmt::Display for DeltaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collection(name) => write!(f, "collection:{}", name),
            Self::ClusterProperties => f.write_str("clusterprops"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeltaState {
    Collection(Collection),
    ClusterProperties(ClusterProperties),
    Deleted,
}

/// One mutation of one target, produced by the processor and persisted by
/// the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct StateDelta {
    pub target: DeltaTarget,
    /// Store version the mutation was computed from; `None` when the target
    /// did not exist.
    pub previous_version: Option<u64>,
    pub new_state: DeltaState,
    /// Queue ids removed once the delta committed.
    pub source_ids: Vec<String>,
    pub urgent: bool,
    /// Published after commit.
    pub events: Vec<ClusterEvent>,
}

impl StateDelta {
    pub fn collection(collection: Collection, previous_version: Option<u64>) -> Self {
        Self {
            target: DeltaTarget::Collection(collection.name.clone()),
            previous_version,
            new_state: DeltaState::Collection(collection),
            source_ids: Vec::new(),
            urgent: false,
            events: Vec::new(),
        }
    }

    pub fn collection_deleted(name: &str, previous_version: u64) -> Self {
        Self {
            target: DeltaTarget::Collection(name.to_string()),
            previous_version: Some(previous_version),
            new_state: DeltaState::Deleted,
            source_ids: Vec::new(),
            urgent: false,
            events: Vec::new(),
        }
    }

    pub fn cluster_properties(properties: ClusterProperties) -> Self {
        Self {
            target: DeltaTarget::ClusterProperties,
            previous_version: properties.version,
            new_state: DeltaState::ClusterProperties(properties),
            source_ids: Vec::new(),
            urgent: false,
            events: Vec::new(),
        }
    }

    pub fn urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }

    pub fn with_event(mut self, event: ClusterEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_sources(mut self, ids: Vec<String>) -> Self {
        self.source_ids = ids;
        self
    }

    /// Applies the new state to the in-memory view. Store versions are left
    /// alone; they change only when the writer commits.
    pub fn apply_to(&self, state: &mut ClusterState) {
        match (&self.target, &self.new_state) {
            (DeltaTarget::Collection(_), DeltaState::Collection(collection)) => {
                state.put_collection(collection.clone());
            }
            (DeltaTarget::Collection(name), DeltaState::Deleted) => {
                state.remove_collection(name);
            }
            (DeltaTarget::ClusterProperties, DeltaState::ClusterProperties(properties)) => {
                state.set_properties(properties.clone());
            }
            (DeltaTarget::ClusterProperties, DeltaState::Deleted) => {
                state.set_properties(ClusterProperties::default());
            }
            (target, new_state) => {
                event!(
                    Level::ERROR,
                    delta_target = %target,
                    state = ?new_state,
                    "delta state does not match its target"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::CollectionConfig;

    #[test]
    fn applying_keeps_the_committed_version() {
        let mut state = ClusterState::new();
        let mut collection = Collection::new("foo", CollectionConfig::default());
        collection.version = 4;
        state.put_collection(collection.clone());

        collection.config.replication_factor = 2;
        let delta = StateDelta::collection(collection, Some(4));
        delta.apply_to(&mut state);
        let stored = state.collection("foo").unwrap();
        assert_eq!(stored.version, 4);
        assert_eq!(stored.config.replication_factor, 2);

        StateDelta::collection_deleted("foo", 4).apply_to(&mut state);
        assert!(!state.has_collection("foo"));
        assert_eq!(
            DeltaTarget::Collection("foo".to_string()).store_path(),
            "/collections/foo/state.json"
        );
    }
}
