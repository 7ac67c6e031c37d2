//! Error types for hostagent.

/// Result type alias for hostagent operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised inside the agent.
///
/// Handlers return these freely; the dispatcher converts every one of them
/// into a failed [`CommandResult`](hostagent_protocol::CommandResult).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid deployment configuration. Fatal at configuration time.
    #[error("configuration error: {0}")]
    Config(String),

    /// The hypervisor control library rejected a call or is unreachable.
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// The named domain does not exist.
    #[error("domain not found: {0}")]
    DomainNotFound(String),

    /// The request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Live migration failed or was aborted.
    #[error("migration failed: {0}")]
    Migration(String),

    /// Storage pool or heartbeat I/O failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Wire protocol failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] hostagent_protocol::DecodeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn hypervisor(msg: impl Into<String>) -> Self {
        Self::Hypervisor(msg.into())
    }

    pub fn domain_not_found(name: impl Into<String>) -> Self {
        Self::DomainNotFound(name.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn migration(msg: impl Into<String>) -> Self {
        Self::Migration(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}
