//! Sequential-node leader election over the coordination store.
//!
//! The same primitive elects the overseer (under `/overseer_elect/election`)
//! and shard leaders (under `/collections/<c>/leader_elect/<s>/election`).
//! Every candidate owns an ephemeral sequential `n_` node; the lowest sequence
//! leads and every other candidate watches only its immediate predecessor.

use crate::config::RetryPolicy;
use crate::core::{OverseerError, Result};
use crate::store::paths::{ELECTION_NODE_PREFIX, join, name_of};
use crate::store::{CoordinationStore, CreateMode, SessionId, SessionState, StoreOp, sequence_of};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// Proof of leadership attached to every write of the leader.
///
/// Writes carry a `Check` on the election node; once the node is gone (the
/// session expired or the leader resigned) every fenced write fails.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FencingToken {
    pub election_path: String,
    pub node_path: String,
    pub sequence: u64,
}

impl FencingToken {
    pub fn check_op(&self) -> StoreOp {
        StoreOp::Check {
            path: self.node_path.clone(),
            version: None,
        }
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.election_path, self.sequence)
    }
}

pub struct LeaderElector {
    store: Arc<dyn CoordinationStore>,
    session: SessionId,
    election_path: String,
    retry: RetryPolicy,
}

impl LeaderElector {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        session: SessionId,
        election_path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            session,
            election_path: election_path.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn election_path(&self) -> &str {
        &self.election_path
    }

    /// Enters the election without waiting for the outcome.
    pub async fn register(&self, identity: &str) -> Result<Candidacy> {
        self.store.ensure_path(self.session, &self.election_path).await?;
        let prefix = join(&self.election_path, ELECTION_NODE_PREFIX);
        let node_path = self
            .store
            .create(
                self.session,
                &prefix,
                identity.as_bytes().to_vec(),
                CreateMode::EphemeralSequential,
            )
            .await?;
        let sequence = sequence_of(&node_path).ok_or_else(|| {
            OverseerError::InvariantViolation(format!(
                "election node '{}' has no sequence suffix",
                node_path
            ))
        })?;
        event!(
            Level::DEBUG,
            election = %self.election_path,
            node = %node_path,
            identity,
            "registered election candidate"
        );
        Ok(Candidacy {
            store: self.store.clone(),
            session: self.session,
            identity: identity.to_string(),
            retry: self.retry.clone(),
            token: FencingToken {
                election_path: self.election_path.clone(),
                node_path,
                sequence,
            },
        })
    }

    /// Registers and waits until elected.
    pub async fn campaign(&self, identity: &str) -> Result<LeadershipHandle> {
        self.register(identity).await?.wait_for_leadership().await
    }

    /// Identity of the lowest candidate, if any.
    pub async fn current_leader(&self) -> Result<Option<String>> {
        let children = match self.store.get_children(&self.election_path).await {
            Ok(children) => children,
            Err(OverseerError::NoNode(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        for (_, name) in ordered_candidates(children) {
            match self.store.get_data(&join(&self.election_path, &name)).await {
                Ok((data, _)) => return Ok(Some(String::from_utf8_lossy(&data).into_owned())),
                Err(OverseerError::NoNode(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }
}

fn ordered_candidates(children: Vec<String>) -> Vec<(u64, String)> {
    let mut candidates: Vec<(u64, String)> = children
        .into_iter()
        .filter(|name| name.starts_with(ELECTION_NODE_PREFIX))
        .filter_map(|name| sequence_of(&name).map(|seq| (seq, name)))
        .collect();
    candidates.sort();
    candidates
}

/// A registered, not yet elected candidate.
pub struct Candidacy {
    store: Arc<dyn CoordinationStore>,
    session: SessionId,
    identity: String,
    retry: RetryPolicy,
    token: FencingToken,
}

impl Candidacy {
    pub fn node_path(&self) -> &str {
        &self.token.node_path
    }

    pub fn sequence(&self) -> u64 {
        self.token.sequence
    }

    /// Leaves the election by deleting the candidate node.
    pub async fn withdraw(self) -> Result<()> {
        delete_if_present(self.store.as_ref(), &self.token.node_path).await
    }

    /// Waits for every predecessor to vanish.
    ///
    /// Fails with `SessionExpired` when the session ends and with
    /// `LeadershipLost` when the candidate node disappears while waiting.
    pub async fn wait_for_leadership(self) -> Result<LeadershipHandle> {
        let mut session_state = self.store.session_state(self.session).await?;
        let own_name = name_of(&self.token.node_path).to_string();
        let mut failures = 0u32;
        loop {
            if *session_state.borrow() == SessionState::Expired {
                return Err(OverseerError::SessionExpired(self.session.0));
            }
            let children = match self.store.get_children(&self.token.election_path).await {
                Ok(children) => {
                    failures = 0;
                    children
                }
                Err(err) if err.is_retryable() => {
                    failures = failures.saturating_add(1);
                    sleep(self.retry.backoff(failures)).await;
                    continue;
                }
                Err(err) => return Err(err),
            };
            let candidates = ordered_candidates(children);
            let position = candidates
                .iter()
                .position(|(_, name)| *name == own_name)
                .ok_or(OverseerError::LeadershipLost)?;

            if position == 0 {
                event!(
                    Level::INFO,
                    election = %self.token.election_path,
                    identity = %self.identity,
                    sequence = self.token.sequence,
                    "won election"
                );
                return Ok(LeadershipHandle::start(
                    self.store,
                    self.session,
                    self.identity,
                    self.token,
                    self.retry,
                    session_state,
                ));
            }

            let predecessor = join(&self.token.election_path, &candidates[position - 1].1);
            let (stat, predecessor_gone) = match self.store.exists_watch(&predecessor).await {
                Ok(found) => found,
                Err(err) if err.is_retryable() => {
                    failures = failures.saturating_add(1);
                    sleep(self.retry.backoff(failures)).await;
                    continue;
                }
                Err(err) => return Err(err),
            };
            if stat.is_none() {
                continue;
            }
            event!(
                Level::DEBUG,
                node = %self.token.node_path,
                predecessor = %predecessor,
                "waiting for election predecessor"
            );
            tokio::select! {
                _ = predecessor_gone => {}
                changed = session_state.changed() => {
                    if changed.is_err() {
                        return Err(OverseerError::SessionExpired(self.session.0));
                    }
                }
            }
        }
    }
}

async fn delete_if_present(store: &dyn CoordinationStore, path: &str) -> Result<()> {
    match store.delete(path, None).await {
        Ok(()) | Err(OverseerError::NoNode(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

type LossCallback = Box<dyn FnOnce() + Send>;

struct LeadershipState {
    store: Arc<dyn CoordinationStore>,
    identity: String,
    token: FencingToken,
    leading: AtomicBool,
    lost: watch::Sender<bool>,
    on_loss: Mutex<Vec<LossCallback>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl LeadershipState {
    /// Flips to "not leading" once; later calls do nothing.
    fn revoke(&self, reason: &str) {
        if !self.leading.swap(false, Ordering::SeqCst) {
            return;
        }
        event!(
            Level::WARN,
            election = %self.token.election_path,
            identity = %self.identity,
            reason,
            "leadership revoked"
        );
        self.lost.send_replace(true);
        let callbacks = match self.on_loss.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for callback in callbacks {
            callback();
        }
    }
}

/// Held by an elected leader.
///
/// Leadership ends on `resign`, on session expiry, or when the election node
/// disappears; whichever comes first runs the `on_loss` callbacks once.
#[derive(Clone)]
pub struct LeadershipHandle {
    state: Arc<LeadershipState>,
}

impl LeadershipHandle {
    fn start(
        store: Arc<dyn CoordinationStore>,
        session: SessionId,
        identity: String,
        token: FencingToken,
        retry: RetryPolicy,
        session_state: watch::Receiver<SessionState>,
    ) -> Self {
        let (lost, _) = watch::channel(false);
        let state = Arc::new(LeadershipState {
            store,
            identity,
            token,
            leading: AtomicBool::new(true),
            lost,
            on_loss: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
        });
        let task = tokio::spawn(monitor_election_node(
            state.clone(),
            session,
            session_state,
            retry,
        ));
        if let Ok(mut monitor) = state.monitor.lock() {
            *monitor = Some(task);
        }
        Self { state }
    }

    pub fn is_leader(&self) -> bool {
        self.state.leading.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> &str {
        &self.state.identity
    }

    pub fn fencing_token(&self) -> &FencingToken {
        &self.state.token
    }

    /// Registers a callback run once when leadership ends. Runs immediately
    /// if it already has.
    pub fn on_loss<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let deferred = match self.state.on_loss.lock() {
            Ok(mut callbacks) if self.is_leader() => {
                callbacks.push(Box::new(callback));
                None
            }
            _ => Some(callback),
        };
        if let Some(callback) = deferred {
            callback();
        }
    }

    /// Resolves once leadership is gone.
    pub async fn lost(&self) {
        let mut lost = self.state.lost.subscribe();
        let _ = lost.wait_for(|gone| *gone).await;
    }

    /// Gives up leadership and deletes the election node.
    pub async fn resign(&self) -> Result<()> {
        self.state.revoke("resigned");
        if let Some(task) = self.state.monitor.lock()?.take() {
            task.abort();
        }
        delete_if_present(self.state.store.as_ref(), &self.state.token.node_path).await
    }
}

impl fmt::Debug for LeadershipHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeadershipHandle")
            .field("identity", &self.state.identity)
            .field("token", &self.state.token)
            .field("leading", &self.is_leader())
            .finish()
    }
}

async fn monitor_election_node(
    state: Arc<LeadershipState>,
    session: SessionId,
    mut session_state: watch::Receiver<SessionState>,
    retry: RetryPolicy,
) {
    let mut failures = 0u32;
    loop {
        if *session_state.borrow() == SessionState::Expired {
            state.revoke("session expired");
            return;
        }
        match state.store.exists_watch(&state.token.node_path).await {
            Ok((Some(_), changed)) => {
                failures = 0;
                tokio::select! {
                    _ = changed => {}
                    closed = session_state.changed() => {
                        if closed.is_err() {
                            state.revoke("session closed");
                            return;
                        }
                    }
                }
            }
            Ok((None, _)) => {
                state.revoke("election node deleted");
                return;
            }
            Err(OverseerError::SessionExpired(_)) => {
                state.revoke("session expired");
                return;
            }
            Err(err) if err.is_retryable() => {
                failures = failures.saturating_add(1);
                let backoff = retry.backoff(failures);
                event!(
                    Level::WARN,
                    session = %session,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "cannot verify election node"
                );
                sleep(backoff).await;
            }
            Err(err) => {
                event!(Level::ERROR, error = %err, "election monitor failed");
                state.revoke("election monitor failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CoordinationStore, InMemoryCoordinationStore};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    const ELECTION: &str = "/test_elect/election";

    #[tokio::test]
    async fn lowest_sequence_leads_and_successor_takes_over() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let s1 = store.open_session().await.unwrap();
        let s2 = store.open_session().await.unwrap();
        let first = LeaderElector::new(store.clone(), s1, ELECTION);
        let second = LeaderElector::new(store.clone(), s2, ELECTION);

        let leader = first.campaign("node-1").await.unwrap();
        assert!(leader.is_leader());
        assert_eq!(leader.fencing_token().sequence, 0);

        let waiting = tokio::spawn(async move { second.campaign("node-2").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());
        assert_eq!(first.current_leader().await.unwrap().as_deref(), Some("node-1"));

        leader.resign().await.unwrap();
        assert!(!leader.is_leader());

        let successor = timeout(Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(successor.is_leader());
        assert_eq!(successor.identity(), "node-2");
    }

    #[tokio::test]
    async fn session_expiry_revokes_and_fires_callbacks_once() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let session = store.open_session().await.unwrap();
        let leader = LeaderElector::new(store.clone(), session, ELECTION)
            .campaign("node-1")
            .await
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        leader.on_loss(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.expire_session(session).unwrap();
        timeout(Duration::from_secs(2), leader.lost()).await.unwrap();
        assert!(!leader.is_leader());
        leader.resign().await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let late = Arc::new(AtomicUsize::new(0));
        let late_counter = late.clone();
        leader.on_loss(move || {
            late_counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn withdrawn_predecessor_unblocks_next_candidate() {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let s1 = store.open_session().await.unwrap();
        let s2 = store.open_session().await.unwrap();
        let s3 = store.open_session().await.unwrap();

        let leader = LeaderElector::new(store.clone(), s1, ELECTION)
            .campaign("a")
            .await
            .unwrap();
        let middle = LeaderElector::new(store.clone(), s2, ELECTION)
            .register("b")
            .await
            .unwrap();
        let last = LeaderElector::new(store.clone(), s3, ELECTION)
            .register("c")
            .await
            .unwrap();
        let waiting = tokio::spawn(last.wait_for_leadership());

        middle.withdraw().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        leader.resign().await.unwrap();
        let handle = timeout(Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(handle.identity(), "c");
    }
}
