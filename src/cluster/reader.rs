use super::state::{ClusterProperties, ClusterState, Collection};
use crate::config::RetryPolicy;
use crate::core::{OverseerError, Result};
use crate::store::paths::{
    CLUSTER_PROPS_PATH, COLLECTIONS_PATH, LIVE_NODES_PATH, collection_state_path,
};
use crate::store::{CoordinationStore, Watch};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{Level, event};

/// Loads one collection document. A missing document yields `None`.
pub async fn load_collection(
    store: &dyn CoordinationStore,
    name: &str,
) -> Result<Option<Collection>> {
    match store.get_data(&collection_state_path(name)).await {
        Ok((bytes, stat)) => Ok(Some(Collection::from_bytes(&bytes, stat.version)?)),
        Err(OverseerError::NoNode(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

pub async fn load_cluster_properties(store: &dyn CoordinationStore) -> Result<ClusterProperties> {
    match store.get_data(CLUSTER_PROPS_PATH).await {
        Ok((bytes, stat)) => ClusterProperties::from_bytes(&bytes, stat.version),
        Err(OverseerError::NoNode(_)) => Ok(ClusterProperties::default()),
        Err(err) => Err(err),
    }
}

async fn children_or_empty(store: &dyn CoordinationStore, path: &str) -> Result<Vec<String>> {
    match store.get_children(path).await {
        Ok(children) => Ok(children),
        Err(OverseerError::NoNode(_)) => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

/// Reads the complete cluster state from the store.
///
/// Collection directories without a `state.json` (a creation that never
/// committed) are skipped.
pub async fn load_cluster_state(store: &dyn CoordinationStore) -> Result<ClusterState> {
    let mut state = ClusterState::new();
    for name in children_or_empty(store, COLLECTIONS_PATH).await? {
        if let Some(collection) = load_collection(store, &name).await? {
            state.put_collection(collection);
        }
    }
    let live: BTreeSet<String> = children_or_empty(store, LIVE_NODES_PATH)
        .await?
        .into_iter()
        .collect();
    state.set_live_nodes(live);
    state.set_properties(load_cluster_properties(store).await?);
    Ok(state)
}

/// Read-only, watch-refreshed copy of the cluster state for nodes that are
/// not the overseer.
pub struct ClusterStateReader {
    store: Arc<dyn CoordinationStore>,
    state: RwLock<ClusterState>,
    clock: watch::Sender<u64>,
    retry: RetryPolicy,
}

impl ClusterStateReader {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        let (clock, _) = watch::channel(0);
        Self {
            store,
            state: RwLock::new(ClusterState::new()),
            clock,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reloads everything; returns whether anything changed.
    pub async fn refresh(&self) -> Result<bool> {
        let loaded = load_cluster_state(self.store.as_ref()).await?;
        let (changed, clock) = {
            let mut state = self.state.write()?;
            let changed = state.absorb(loaded);
            (changed, state.clock())
        };
        if changed {
            self.clock.send_replace(clock);
        }
        Ok(changed)
    }

    pub fn snapshot(&self) -> Result<ClusterState> {
        Ok(self.state.read()?.clone())
    }

    /// Receiver of the logical clock; changes whenever the view changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.clock.subscribe()
    }

    /// Waits until `predicate` holds for the current view. Returns `None` on
    /// timeout.
    pub async fn wait_for<F>(&self, max_wait: Duration, predicate: F) -> Result<Option<ClusterState>>
    where
        F: Fn(&ClusterState) -> bool,
    {
        let deadline = Instant::now() + max_wait;
        let mut changes = self.subscribe();
        loop {
            changes.borrow_and_update();
            let current = self.snapshot()?;
            if predicate(&current) {
                return Ok(Some(current));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match timeout(remaining, changes.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return Ok(None),
            }
        }
    }

    async fn arm_watches(&self) -> Result<Vec<Watch>> {
        let mut watches = Vec::new();
        for parent in [COLLECTIONS_PATH, LIVE_NODES_PATH] {
            match self.store.get_children_watch(parent).await {
                Ok((children, watch)) => {
                    watches.push(watch);
                    if parent == COLLECTIONS_PATH {
                        for name in children {
                            let (_, watch) =
                                self.store.exists_watch(&collection_state_path(&name)).await?;
                            watches.push(watch);
                        }
                    }
                }
                Err(OverseerError::NoNode(_)) => {
                    let (_, watch) = self.store.exists_watch(parent).await?;
                    watches.push(watch);
                }
                Err(err) => return Err(err),
            }
        }
        let (_, watch) = self.store.exists_watch(CLUSTER_PROPS_PATH).await?;
        watches.push(watch);
        Ok(watches)
    }

    /// Keeps the view current until `shutdown` flips to `true`.
    pub fn start_watching(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let armed = match self.arm_watches().await {
                    Ok(watches) => self.refresh().await.map(|_| watches),
                    Err(err) => Err(err),
                };
                let watches = match armed {
                    Ok(watches) => {
                        failures = 0;
                        watches
                    }
                    Err(err) => {
                        failures = failures.saturating_add(1);
                        let backoff = self.retry.backoff(failures);
                        event!(
                            Level::WARN,
                            error = %err,
                            backoff_ms = backoff.as_millis() as u64,
                            "cluster state refresh failed"
                        );
                        tokio::select! {
                            _ = sleep(backoff) => {}
                            _ = shutdown.changed() => {}
                        }
                        continue;
                    }
                };
                tokio::select! {
                    _ = futures::future::select_all(watches) => {}
                    _ = shutdown.changed() => {}
                }
            }
            event!(Level::DEBUG, "cluster state reader stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::state::CollectionConfig;
    use crate::store::{CreateMode, InMemoryCoordinationStore, SessionId};

    async fn write_collection(
        store: &InMemoryCoordinationStore,
        session: SessionId,
        collection: &Collection,
    ) {
        let path = collection_state_path(&collection.name);
        store
            .ensure_path(session, crate::store::paths::parent_of(&path))
            .await
            .unwrap();
        match store.exists(&path).await.unwrap() {
            Some(_) => {
                store
                    .set_data(&path, collection.to_bytes().unwrap(), None)
                    .await
                    .unwrap();
            }
            None => {
                store
                    .create(session, &path, collection.to_bytes().unwrap(), CreateMode::Persistent)
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn loads_collections_live_nodes_and_properties() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let session = store.open_session().await.unwrap();
        write_collection(&store, session, &Collection::new("foo", CollectionConfig::default()))
            .await;
        store.ensure_path(session, "/collections/half-created").await.unwrap();
        store.ensure_path(session, "/live_nodes/n1").await.unwrap();

        let state = load_cluster_state(&*store).await.unwrap();
        assert_eq!(state.collection_names(), vec!["foo".to_string()]);
        assert!(state.is_live("n1"));
        assert_eq!(state.properties().version, None);
    }

    #[tokio::test]
    async fn watching_reader_observes_new_versions() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let session = store.open_session().await.unwrap();
        let reader = Arc::new(ClusterStateReader::new(store.clone()));
        let (stop, shutdown) = watch::channel(false);
        let task = reader.clone().start_watching(shutdown);

        let mut collection = Collection::new("foo", CollectionConfig::default());
        write_collection(&store, session, &collection).await;
        let seen = reader
            .wait_for(Duration::from_secs(2), |s| s.has_collection("foo"))
            .await
            .unwrap()
            .expect("collection observed");
        let first_clock = seen.clock();

        collection.config.replication_factor = 3;
        write_collection(&store, session, &collection).await;
        let seen = reader
            .wait_for(Duration::from_secs(2), |s| {
                s.collection("foo").map(|c| c.version) == Some(1)
            })
            .await
            .unwrap()
            .expect("update observed");
        assert!(seen.clock() > first_clock);
        assert_eq!(seen.collection("foo").unwrap().config.replication_factor, 3);

        stop.send_replace(true);
        task.await.unwrap();
    }
}
