use thiserror::Error;

#[derive(Error, Debug)]
pub enum OverseerError {
    #[error("Node '{0}' does not exist")]
    NoNode(String),

    #[error("Node '{0}' already exists")]
    NodeExists(String),

    #[error("Version mismatch on '{path}': expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Node '{0}' has children")]
    NotEmpty(String),

    #[error("Invalid path '{0}'")]
    InvalidPath(String),

    #[error("Session {0} has expired")]
    SessionExpired(u64),

    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store transaction failed at op {index}: {source}")]
    TransactionFailed {
        index: usize,
        #[source]
        source: Box<OverseerError>,
    },

    #[error("Version conflict for {target}: expected {expected:?}")]
    VersionConflict {
        target: String,
        expected: Option<u64>,
    },

    #[error("Fencing token {0} is no longer current")]
    StaleFencingToken(String),

    #[error("Leadership lost")]
    LeadershipLost,

    #[error("Overseer is stopped")]
    OverseerStopped,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl OverseerError {
    /// Transient conditions the processing loop retries after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) | Self::VersionConflict { .. } => true,
            Self::TransactionFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// True when the error means this process can no longer act as a leader.
    pub fn is_fencing(&self) -> bool {
        matches!(
            self,
            Self::LeadershipLost | Self::StaleFencingToken(_) | Self::SessionExpired(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, OverseerError>;

impl<T> From<std::sync::PoisonError<T>> for OverseerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for OverseerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for OverseerError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
