use super::paths::{join, name_of, parent_of};
use super::{
    CoordinationStore, CreateMode, NodeStat, SessionId, SessionState, StoreOp, StoreOpResult,
    Watch, WatchEvent, WatchEventKind,
};
use crate::core::{OverseerError, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{Level, event};

#[derive(Debug, Clone)]
struct StoredNode {
    data: Vec<u8>,
    version: u64,
    created_txid: u64,
    modified_txid: u64,
    ephemeral_owner: Option<SessionId>,
    children: BTreeSet<String>,
    next_sequence: u64,
}

impl StoredNode {
    fn new(data: Vec<u8>, txid: u64, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            data,
            version: 0,
            created_txid: txid,
            modified_txid: txid,
            ephemeral_owner,
            children: BTreeSet::new(),
            next_sequence: 0,
        }
    }

    fn stat(&self) -> NodeStat {
        NodeStat {
            version: self.version,
            created_txid: self.created_txid,
            modified_txid: self.modified_txid,
            ephemeral_owner: self.ephemeral_owner,
            num_children: self.children.len(),
        }
    }
}

/// Side effects of one applied op, committed together with the node changes.
#[derive(Default)]
struct OpEffects {
    fired: Vec<WatchEvent>,
    ephemeral_added: Option<(SessionId, String)>,
    ephemeral_removed: Option<(SessionId, String)>,
}

struct SessionEntry {
    state: watch::Sender<SessionState>,
    ephemerals: BTreeSet<String>,
}

struct Inner {
    nodes: HashMap<String, StoredNode>,
    sessions: HashMap<SessionId, SessionEntry>,
    next_session: u64,
    txid: u64,
    data_watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    child_watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    available: bool,
}

/// In-process coordination store with ZooKeeper-like semantics.
///
/// Every call is linearizable: the whole tree sits behind one lock and watches
/// are fired before the lock is released.
///
/// # Examples
///
/// ```
/// use rustoverseer::store::{CoordinationStore, CreateMode, InMemoryCoordinationStore};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryCoordinationStore::new();
/// let session = store.open_session().await.unwrap();
/// store.ensure_path(session, "/jobs").await.unwrap();
/// let path = store
///     .create(session, "/jobs/job-", b"payload".to_vec(), CreateMode::PersistentSequential)
///     .await
///     .unwrap();
/// assert_eq!(path, "/jobs/job-0000000000");
/// # });
/// ```
pub struct InMemoryCoordinationStore {
    inner: Mutex<Inner>,
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), StoredNode::new(Vec::new(), 0, None));
        Self {
            inner: Mutex::new(Inner {
                nodes,
                sessions: HashMap::new(),
                next_session: 1,
                txid: 0,
                data_watches: HashMap::new(),
                child_watches: HashMap::new(),
                available: true,
            }),
        }
    }

    /// Simulates a connectivity outage: while unavailable every call fails
    /// with [`OverseerError::StoreUnavailable`].
    pub fn set_available(&self, available: bool) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.available = available;
        Ok(())
    }

    /// Expires a session the way a lost heartbeat would.
    pub fn expire_session(&self, session: SessionId) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.end_session(session);
        event!(Level::INFO, session = %session, "store session expired");
        Ok(())
    }

    pub fn node_count(&self) -> Result<usize> {
        Ok(self.inner.lock()?.nodes.len())
    }
}

impl Inner {
    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(OverseerError::StoreUnavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }

    fn ensure_session(&self, session: SessionId) -> Result<()> {
        match self.sessions.get(&session) {
            Some(entry) if *entry.state.borrow() == SessionState::Connected => Ok(()),
            _ => Err(OverseerError::SessionExpired(session.0)),
        }
    }

    fn node(&self, path: &str) -> Result<&StoredNode> {
        validate_path(path)?;
        self.nodes
            .get(path)
            .ok_or_else(|| OverseerError::NoNode(path.to_string()))
    }

    fn next_txid(&mut self) -> u64 {
        self.txid += 1;
        self.txid
    }

    fn commit_effects(&mut self, effects: Vec<OpEffects>) {
        for effect in effects {
            if let Some((session, path)) = effect.ephemeral_added {
                if let Some(entry) = self.sessions.get_mut(&session) {
                    entry.ephemerals.insert(path);
                }
            }
            if let Some((session, path)) = effect.ephemeral_removed {
                if let Some(entry) = self.sessions.get_mut(&session) {
                    entry.ephemerals.remove(&path);
                }
            }
            for fired in effect.fired {
                self.fire(fired);
            }
        }
    }

    fn fire(&mut self, fired: WatchEvent) {
        let data_targets = match fired.kind {
            WatchEventKind::Created | WatchEventKind::Deleted | WatchEventKind::DataChanged => {
                self.data_watches.remove(&fired.path).unwrap_or_default()
            }
            _ => Vec::new(),
        };
        let child_targets = match fired.kind {
            WatchEventKind::ChildrenChanged | WatchEventKind::Deleted => {
                self.child_watches.remove(&fired.path).unwrap_or_default()
            }
            _ => Vec::new(),
        };
        for sender in data_targets.into_iter().chain(child_targets) {
            let _ = sender.send(fired.clone());
        }
    }

    fn end_session(&mut self, session: SessionId) {
        let Some(entry) = self.sessions.get_mut(&session) else {
            return;
        };
        let ephemerals = std::mem::take(&mut entry.ephemerals);
        entry.state.send_replace(SessionState::Expired);

        let txid = self.next_txid();
        let mut effects = Vec::new();
        for path in ephemerals {
            match apply_op(
                &mut self.nodes,
                session,
                StoreOp::Delete {
                    path: path.clone(),
                    version: None,
                },
                txid,
            ) {
                Ok((_, effect)) => effects.push(effect),
                Err(err) => {
                    event!(Level::WARN, path = %path, error = %err, "ephemeral cleanup failed")
                }
            }
        }
        self.commit_effects(effects);
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(OverseerError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Registers a one-shot watch, pruning senders whose receivers were dropped.
fn register_watch(
    watches: &mut HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    path: &str,
) -> Watch {
    let (tx, rx) = oneshot::channel();
    let pending = watches.entry(path.to_string()).or_default();
    pending.retain(|sender| !sender.is_closed());
    pending.push(tx);
    rx
}

fn check_version(path: &str, expected: Option<u64>, actual: u64) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(OverseerError::BadVersion {
            path: path.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

/// Applies one op. All preconditions are checked before anything is mutated,
/// so a failed op leaves `nodes` untouched.
fn apply_op(
    nodes: &mut HashMap<String, StoredNode>,
    session: SessionId,
    op: StoreOp,
    txid: u64,
) -> Result<(StoreOpResult, OpEffects)> {
    validate_path(op.path())?;
    let mut effects = OpEffects::default();
    match op {
        StoreOp::Check { path, version } => {
            let node = nodes
                .get(&path)
                .ok_or_else(|| OverseerError::NoNode(path.clone()))?;
            check_version(&path, version, node.version)?;
            Ok((StoreOpResult::Checked, effects))
        }
        StoreOp::Create { path, data, mode } => {
            if path == "/" {
                return Err(OverseerError::NodeExists(path));
            }
            let parent_path = parent_of(&path).to_string();
            let parent = nodes
                .get_mut(&parent_path)
                .ok_or_else(|| OverseerError::NoNode(parent_path.clone()))?;
            if parent.ephemeral_owner.is_some() {
                return Err(OverseerError::InvalidPath(format!(
                    "{} (ephemeral nodes cannot have children)",
                    path
                )));
            }
            let actual = if mode.is_sequential() {
                format!("{}{:010}", path, parent.next_sequence)
            } else {
                path
            };
            let name = name_of(&actual).to_string();
            if parent.children.contains(&name) {
                return Err(OverseerError::NodeExists(actual));
            }
            if mode.is_sequential() {
                parent.next_sequence += 1;
            }
            parent.children.insert(name);
            parent.modified_txid = txid;

            let owner = mode.is_ephemeral().then_some(session);
            nodes.insert(actual.clone(), StoredNode::new(data, txid, owner));
            if let Some(owner) = owner {
                effects.ephemeral_added = Some((owner, actual.clone()));
            }
            effects.fired.push(WatchEvent {
                path: actual.clone(),
                kind: WatchEventKind::Created,
            });
            effects.fired.push(WatchEvent {
                path: parent_path,
                kind: WatchEventKind::ChildrenChanged,
            });
            Ok((StoreOpResult::Created(actual), effects))
        }
        StoreOp::SetData {
            path,
            data,
            version,
        } => {
            let node = nodes
                .get_mut(&path)
                .ok_or_else(|| OverseerError::NoNode(path.clone()))?;
            check_version(&path, version, node.version)?;
            node.data = data;
            node.version += 1;
            node.modified_txid = txid;
            let stat = node.stat();
            effects.fired.push(WatchEvent {
                path,
                kind: WatchEventKind::DataChanged,
            });
            Ok((StoreOpResult::SetData(stat), effects))
        }
        StoreOp::Delete { path, version } => {
            if path == "/" {
                return Err(OverseerError::InvalidPath(path));
            }
            let node = nodes
                .get(&path)
                .ok_or_else(|| OverseerError::NoNode(path.clone()))?;
            check_version(&path, version, node.version)?;
            if !node.children.is_empty() {
                return Err(OverseerError::NotEmpty(path));
            }
            let owner = node.ephemeral_owner;
            nodes.remove(&path);
            let parent_path = parent_of(&path).to_string();
            if let Some(parent) = nodes.get_mut(&parent_path) {
                parent.children.remove(name_of(&path));
                parent.modified_txid = txid;
            }
            if let Some(owner) = owner {
                effects.ephemeral_removed = Some((owner, path.clone()));
            }
            effects.fired.push(WatchEvent {
                path,
                kind: WatchEventKind::Deleted,
            });
            effects.fired.push(WatchEvent {
                path: parent_path,
                kind: WatchEventKind::ChildrenChanged,
            });
            Ok((StoreOpResult::Deleted, effects))
        }
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn open_session(&self) -> Result<SessionId> {
        let mut inner = self.inner.lock()?;
        inner.ensure_available()?;
        let id = SessionId(inner.next_session);
        inner.next_session += 1;
        let (state, _) = watch::channel(SessionState::Connected);
        inner.sessions.insert(
            id,
            SessionEntry {
                state,
                ephemerals: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn close_session(&self, session: SessionId) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.end_session(session);
        Ok(())
    }

    async fn session_state(&self, session: SessionId) -> Result<watch::Receiver<SessionState>> {
        let inner = self.inner.lock()?;
        inner
            .sessions
            .get(&session)
            .map(|entry| entry.state.subscribe())
            .ok_or(OverseerError::SessionExpired(session.0))
    }

    async fn create(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String> {
        let mut inner = self.inner.lock()?;
        inner.ensure_available()?;
        inner.ensure_session(session)?;
        let txid = inner.next_txid();
        let op = StoreOp::Create {
            path: path.to_string(),
            data,
            mode,
        };
        let (result, effects) = apply_op(&mut inner.nodes, session, op, txid)?;
        inner.commit_effects(vec![effects]);
        match result {
            StoreOpResult::Created(actual) => Ok(actual),
            _ => Ok(path.to_string()),
        }
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat)> {
        let inner = self.inner.lock()?;
        inner.ensure_available()?;
        let node = inner.node(path)?;
        Ok((node.data.clone(), node.stat()))
    }

    async fn get_data_watch(&self, path: &str) -> Result<(Vec<u8>, NodeStat, Watch)> {
        let mut inner = self.inner.lock()?;
        inner.ensure_available()?;
        let (data, stat) = {
            let node = inner.node(path)?;
            (node.data.clone(), node.stat())
        };
        let rx = register_watch(&mut inner.data_watches, path);
        Ok((data, stat, rx))
    }

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>> {
        let inner = self.inner.lock()?;
        inner.ensure_available()?;
        validate_path(path)?;
        Ok(inner.nodes.get(path).map(StoredNode::stat))
    }

    async fn exists_watch(&self, path: &str) -> Result<(Option<NodeStat>, Watch)> {
        let mut inner = self.inner.lock()?;
        inner.ensure_available()?;
        validate_path(path)?;
        let stat = inner.nodes.get(path).map(StoredNode::stat);
        let rx = register_watch(&mut inner.data_watches, path);
        Ok((stat, rx))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock()?;
        inner.ensure_available()?;
        Ok(inner.node(path)?.children.iter().cloned().collect())
    }

    async fn get_children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        let mut inner = self.inner.lock()?;
        inner.ensure_available()?;
        let children = inner.node(path)?.children.iter().cloned().collect();
        let rx = register_watch(&mut inner.child_watches, path);
        Ok((children, rx))
    }

    async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<u64>) -> Result<NodeStat> {
        let mut inner = self.inner.lock()?;
        inner.ensure_available()?;
        let txid = inner.next_txid();
        let op = StoreOp::SetData {
            path: path.to_string(),
            data,
            version,
        };
        let (result, effects) = apply_op(&mut inner.nodes, SessionId(0), op, txid)?;
        inner.commit_effects(vec![effects]);
        match result {
            StoreOpResult::SetData(stat) => Ok(stat),
            _ => Err(OverseerError::NoNode(path.to_string())),
        }
    }

    async fn delete(&self, path: &str, version: Option<u64>) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.ensure_available()?;
        let txid = inner.next_txid();
        let op = StoreOp::Delete {
            path: path.to_string(),
            version,
        };
        let (_, effects) = apply_op(&mut inner.nodes, SessionId(0), op, txid)?;
        inner.commit_effects(vec![effects]);
        Ok(())
    }

    async fn multi(&self, session: SessionId, ops: Vec<StoreOp>) -> Result<Vec<StoreOpResult>> {
        let mut inner = self.inner.lock()?;
        inner.ensure_available()?;
        inner.ensure_session(session)?;
        let txid = inner.next_txid();

        let mut staged = inner.nodes.clone();
        let mut results = Vec::with_capacity(ops.len());
        let mut effects = Vec::with_capacity(ops.len());
        for (index, op) in ops.into_iter().enumerate() {
            match apply_op(&mut staged, session, op, txid) {
                Ok((result, effect)) => {
                    results.push(result);
                    effects.push(effect);
                }
                Err(source) => {
                    return Err(OverseerError::TransactionFailed {
                        index,
                        source: Box::new(source),
                    });
                }
            }
        }

        inner.nodes = staged;
        inner.commit_effects(effects);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_session() -> (InMemoryCoordinationStore, SessionId) {
        let store = InMemoryCoordinationStore::new();
        let session = store.open_session().await.unwrap();
        (store, session)
    }

    #[tokio::test]
    async fn sequential_nodes_get_increasing_suffixes() {
        let (store, session) = store_with_session().await;
        store.ensure_path(session, "/queue").await.unwrap();

        let first = store
            .create(session, "/queue/qn-", b"a".to_vec(), CreateMode::PersistentSequential)
            .await
            .unwrap();
        let second = store
            .create(session, "/queue/qn-", b"b".to_vec(), CreateMode::PersistentSequential)
            .await
            .unwrap();

        assert_eq!(first, "/queue/qn-0000000000");
        assert_eq!(second, "/queue/qn-0000000001");
        assert_eq!(
            store.get_children("/queue").await.unwrap(),
            vec!["qn-0000000000".to_string(), "qn-0000000001".to_string()]
        );
    }

    #[tokio::test]
    async fn conditional_set_rejects_stale_versions() {
        let (store, session) = store_with_session().await;
        store
            .create(session, "/doc", b"v0".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let stat = store.set_data("/doc", b"v1".to_vec(), Some(0)).await.unwrap();
        assert_eq!(stat.version, 1);

        let err = store.set_data("/doc", b"v2".to_vec(), Some(0)).await.unwrap_err();
        assert!(matches!(err, OverseerError::BadVersion { actual: 1, .. }));
        assert_eq!(store.get_data("/doc").await.unwrap().0, b"v1".to_vec());
    }

    #[tokio::test]
    async fn multi_is_all_or_nothing() {
        let (store, session) = store_with_session().await;
        store
            .create(session, "/a", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();

        let err = store
            .multi(
                session,
                vec![
                    StoreOp::SetData {
                        path: "/a".to_string(),
                        data: b"changed".to_vec(),
                        version: Some(0),
                    },
                    StoreOp::Check {
                        path: "/missing".to_string(),
                        version: None,
                    },
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, OverseerError::TransactionFailed { index: 1, .. }));
        let (data, stat) = store.get_data("/a").await.unwrap();
        assert!(data.is_empty());
        assert_eq!(stat.version, 0);
    }

    #[tokio::test]
    async fn expiring_a_session_removes_its_ephemerals_and_fires_watches() {
        let (store, session) = store_with_session().await;
        store.ensure_path(session, "/live_nodes").await.unwrap();
        store
            .create(session, "/live_nodes/n1", Vec::new(), CreateMode::Ephemeral)
            .await
            .unwrap();

        let (stat, watch) = store.exists_watch("/live_nodes/n1").await.unwrap();
        assert!(stat.unwrap().ephemeral_owner.is_some());
        let (_, children_watch) = store.get_children_watch("/live_nodes").await.unwrap();
        let mut state = store.session_state(session).await.unwrap();

        store.expire_session(session).unwrap();

        assert_eq!(watch.await.unwrap().kind, WatchEventKind::Deleted);
        assert_eq!(
            children_watch.await.unwrap().kind,
            WatchEventKind::ChildrenChanged
        );
        assert!(store.exists("/live_nodes/n1").await.unwrap().is_none());
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), SessionState::Expired);

        let err = store
            .create(session, "/live_nodes/n2", Vec::new(), CreateMode::Ephemeral)
            .await
            .unwrap_err();
        assert!(matches!(err, OverseerError::SessionExpired(_)));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let (store, _session) = store_with_session().await;
        store.set_available(false).unwrap();
        assert!(matches!(
            store.exists("/").await,
            Err(OverseerError::StoreUnavailable(_))
        ));
        store.set_available(true).unwrap();
        assert!(store.exists("/").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_refuses_nodes_with_children() {
        let (store, session) = store_with_session().await;
        store.ensure_path(session, "/a/b").await.unwrap();
        assert!(matches!(
            store.delete("/a", None).await,
            Err(OverseerError::NotEmpty(_))
        ));
        store.delete("/a/b", None).await.unwrap();
        store.delete("/a", None).await.unwrap();
        assert!(store.exists("/a").await.unwrap().is_none());
    }
}
