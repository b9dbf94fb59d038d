use crate::core::{OverseerError, Result};
use crate::events::{ClusterEvent, ClusterEventBus};
use crate::store::paths::{LIVE_NODES_PATH, live_node_path};
use crate::store::{CoordinationStore, CreateMode, SessionId, Watch};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{Level, event};

/// Announces `node_name` as live for as long as `session` lasts.
pub async fn register_live_node(
    store: &dyn CoordinationStore,
    session: SessionId,
    node_name: &str,
) -> Result<String> {
    store.ensure_path(session, LIVE_NODES_PATH).await?;
    let path = store
        .create(session, &live_node_path(node_name), Vec::new(), CreateMode::Ephemeral)
        .await?;
    event!(Level::INFO, node = node_name, session = %session, "registered live node");
    Ok(path)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveNodesDiff {
    pub current: BTreeSet<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl LiveNodesDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Tracks `/live_nodes` and publishes NODES_UP / NODES_DOWN for changes
/// after the first observation.
pub struct LiveNodesWatcher {
    store: Arc<dyn CoordinationStore>,
    bus: ClusterEventBus,
    known: Option<BTreeSet<String>>,
}

impl LiveNodesWatcher {
    pub fn new(store: Arc<dyn CoordinationStore>, bus: ClusterEventBus) -> Self {
        Self {
            store,
            bus,
            known: None,
        }
    }

    /// Starts from an already known membership; changes against it are
    /// published on the next observation.
    pub fn with_baseline(mut self, nodes: BTreeSet<String>) -> Self {
        self.known = Some(nodes);
        self
    }

    /// Reads the current membership, re-arming the children watch.
    pub async fn observe(&mut self) -> Result<(LiveNodesDiff, Watch)> {
        let (children, watch) = match self.store.get_children_watch(LIVE_NODES_PATH).await {
            Ok(found) => found,
            Err(OverseerError::NoNode(_)) => {
                let (_, watch) = self.store.exists_watch(LIVE_NODES_PATH).await?;
                (Vec::new(), watch)
            }
            Err(err) => return Err(err),
        };
        let current: BTreeSet<String> = children.into_iter().collect();
        let diff = match self.known.as_ref() {
            Some(known) => LiveNodesDiff {
                added: current.difference(known).cloned().collect(),
                removed: known.difference(&current).cloned().collect(),
                current: current.clone(),
            },
            None => LiveNodesDiff {
                current: current.clone(),
                ..LiveNodesDiff::default()
            },
        };
        if !diff.removed.is_empty() {
            event!(Level::INFO, nodes = ?diff.removed, "live nodes went down");
            self.bus.publish(ClusterEvent::nodes_down(diff.removed.clone()));
        }
        if !diff.added.is_empty() {
            event!(Level::INFO, nodes = ?diff.added, "live nodes came up");
            self.bus.publish(ClusterEvent::nodes_up(diff.added.clone()));
        }
        self.known = Some(current);
        Ok((diff, watch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ClusterEventType;
    use crate::store::{CoordinationStore, InMemoryCoordinationStore};

    #[tokio::test]
    async fn membership_changes_are_published() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let a = store.open_session().await.unwrap();
        let b = store.open_session().await.unwrap();
        register_live_node(&*store, a, "node-a").await.unwrap();

        let bus = ClusterEventBus::default();
        let mut events = bus.subscribe_receiver();
        let mut watcher = LiveNodesWatcher::new(store.clone(), bus.clone());

        let (initial, watch) = watcher.observe().await.unwrap();
        assert!(initial.is_empty());
        assert!(initial.current.contains("node-a"));

        register_live_node(&*store, b, "node-b").await.unwrap();
        watch.await.unwrap();
        let (diff, _) = watcher.observe().await.unwrap();
        assert_eq!(diff.added, vec!["node-b".to_string()]);
        assert_eq!(events.recv().await.unwrap().event_type(), ClusterEventType::NodesUp);

        store.expire_session(a).unwrap();
        let (diff, _) = watcher.observe().await.unwrap();
        assert_eq!(diff.removed, vec!["node-a".to_string()]);
        assert_eq!(events.recv().await.unwrap().event_type(), ClusterEventType::NodesDown);
    }
}
