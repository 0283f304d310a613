//! Error types for the p2p layer.

use {
    crate::{channel::ChannelId, endpoint::Endpoint, key::PeerId},
    std::time::Duration,
    thiserror::Error,
};

/// Errors that can occur in the p2p layer.
///
/// Only peer-error reports escalate to trust decisions; every variant here
/// is contained to the operation that produced it.
#[derive(Error, Debug)]
pub enum P2pError {
    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection (and therefore every stream on it) has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The remote side refused the connection.
    #[error("connection refused by {0}")]
    ConnectionRefused(Endpoint),

    /// A dial or handshake did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An endpoint was handed to a transport serving another protocol.
    #[error("protocol mismatch: transport serves {expected}, endpoint uses {actual}")]
    ProtocolMismatch {
        /// Protocol of the transport.
        expected: String,
        /// Protocol of the endpoint.
        actual: String,
    },

    /// No transport is registered for the endpoint's protocol.
    #[error("no transport for protocol {0}")]
    UnsupportedProtocol(String),

    /// Two transports were registered for the same protocol.
    #[error("duplicate transport for protocol {0}")]
    DuplicateTransport(String),

    /// The endpoint is malformed or unusable for the requested operation.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Transport-level I/O error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Failed to encode or decode a message.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Message exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The remote broke the multiplexing protocol, e.g. by writing past its
    /// flow-control window.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The remote public key does not belong to the expected peer.
    #[error("authentication failed: expected peer {expected}, got {actual}")]
    AuthenticationFailed {
        /// Peer we dialed.
        expected: PeerId,
        /// Peer derived from the key the connection presented.
        actual: PeerId,
    },

    /// A channel with this ID is already open on the router.
    #[error("channel {0:#04x} is already open")]
    ChannelAlreadyOpen(ChannelId),

    /// The channel queue was closed by its owner.
    #[error("channel closed")]
    ChannelClosed,

    /// The peer already has a live connection.
    #[error("peer already connected: {0}")]
    PeerAlreadyConnected(PeerId),

    /// The peer is banned.
    #[error("peer is banned: {0}")]
    PeerBanned(PeerId),

    /// The remote key is our own key.
    #[error("refusing connection to self")]
    SelfConnection,

    /// The router is at its connection limit.
    #[error("maximum connections reached: {0}")]
    MaxConnectionsReached(usize),

    /// The router is not running.
    #[error("router stopped")]
    RouterStopped,
}

impl P2pError {
    /// Whether this error is the expected outcome of cancellation or
    /// shutdown, as opposed to an abnormal failure worth logging loudly.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Cancelled | Self::RouterStopped)
    }
}

/// Convenience result type for p2p operations.
pub type Result<T> = std::result::Result<T, P2pError>;
