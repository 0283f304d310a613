//! Error types for the state-sync reactor.

use {thiserror::Error, trv1_p2p::P2pError};

/// Errors that can occur while serving or requesting snapshots.
#[derive(Error, Debug)]
pub enum StateSyncError {
    /// The application connection failed to answer a query. Contained to
    /// the request that triggered it.
    #[error("application query failed: {0}")]
    App(String),

    /// The p2p layer refused an operation.
    #[error(transparent)]
    P2p(#[from] P2pError),

    /// The reactor is no longer running.
    #[error("reactor stopped")]
    Stopped,
}

/// Convenience result type for state-sync operations.
pub type Result<T> = std::result::Result<T, StateSyncError>;
