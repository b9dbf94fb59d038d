//! Coordination store contract.
//!
//! The overseer core treats the coordination store as an external collaborator:
//! a hierarchical, linearizable-per-path key-value store with sessions,
//! ephemeral/sequential nodes, compare-and-set writes, atomic multi-op
//! transactions and one-shot watches. [`InMemoryCoordinationStore`] implements
//! the contract in-process.

use crate::core::{OverseerError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{oneshot, watch};

pub mod memory;
pub mod paths;

pub use memory::InMemoryCoordinationStore;

/// Identifier of a store session. Ephemeral nodes live as long as their session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Metadata of a stored node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStat {
    /// Number of data writes since creation; starts at 0.
    pub version: u64,
    /// Store-wide transaction id that created the node.
    pub created_txid: u64,
    /// Store-wide transaction id of the last modification.
    pub modified_txid: u64,
    pub ephemeral_owner: Option<SessionId>,
    pub num_children: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
    /// The store is going away; re-read and re-register.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// One-shot notification registered together with a read.
pub type Watch = oneshot::Receiver<WatchEvent>;

/// A single operation of an atomic [`CoordinationStore::multi`] transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Succeeds only if the node exists (and has `version`, when given).
    Check { path: String, version: Option<u64> },
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: Option<u64>,
    },
    Delete { path: String, version: Option<u64> },
}

impl StoreOp {
    pub fn path(&self) -> &str {
        match self {
            Self::Check { path, .. }
            | Self::Create { path, .. }
            | Self::SetData { path, .. }
            | Self::Delete { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOpResult {
    Checked,
    Created(String),
    SetData(NodeStat),
    Deleted,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Opens a new session.
    async fn open_session(&self) -> Result<SessionId>;

    /// Closes a session, deleting every ephemeral node it owns.
    async fn close_session(&self, session: SessionId) -> Result<()>;

    /// Returns a receiver tracking the session state.
    async fn session_state(&self, session: SessionId) -> Result<watch::Receiver<SessionState>>;

    /// Creates a node and returns its actual path (sequential nodes get a
    /// zero-padded 10-digit suffix).
    async fn create(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String>;

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, NodeStat)>;

    async fn get_data_watch(&self, path: &str) -> Result<(Vec<u8>, NodeStat, Watch)>;

    async fn exists(&self, path: &str) -> Result<Option<NodeStat>>;

    /// Like [`exists`](Self::exists), also registering a watch that fires on
    /// creation, deletion or data change of `path`.
    async fn exists_watch(&self, path: &str) -> Result<(Option<NodeStat>, Watch)>;

    /// Child names (not full paths), sorted.
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    async fn get_children_watch(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    /// Conditional write; `version: None` writes unconditionally.
    async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<u64>) -> Result<NodeStat>;

    async fn delete(&self, path: &str, version: Option<u64>) -> Result<()>;

    /// Applies every op or none of them. A failing op is reported as
    /// [`OverseerError::TransactionFailed`] carrying its index.
    async fn multi(&self, session: SessionId, ops: Vec<StoreOp>) -> Result<Vec<StoreOpResult>>;

    /// Creates every missing persistent node along `path`.
    async fn ensure_path(&self, session: SessionId, path: &str) -> Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self
                .create(session, &current, Vec::new(), CreateMode::Persistent)
                .await
            {
                Ok(_) | Err(OverseerError::NodeExists(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Parses the store-assigned suffix of a sequential node name.
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() < 10 {
        return None;
    }
    name[name.len() - 10..].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_suffix_is_parsed_from_the_last_ten_digits() {
        assert_eq!(sequence_of("n_0000000042"), Some(42));
        assert_eq!(sequence_of("qn-0000000000"), Some(0));
        assert_eq!(sequence_of("short"), None);
        assert_eq!(sequence_of("n_00000000xx"), None);
    }
}
