//! Transport, connection and stream contracts.
//!
//! A [`Transport`] dials and accepts [`Connection`]s for one protocol. Each
//! connection is an authenticated-by-key duplex link that multiplexes any
//! number of [`Stream`]s, one per channel. Byte-oriented transports share
//! the [`mux`] implementation; [`memory`] serves in-process nodes and
//! [`tcp`] serves the network.
//!
//! ## Stream framing
//!
//! Each [`Stream::write`] call carries exactly one message and is framed in
//! full before the next write on any stream of the same connection; the
//! receiving side recovers message boundaries from that single frame. This
//! is the legacy multiplexed-connection wire behaviour and the router relies
//! on it. It can be relaxed (e.g. to allow partial writes) once peers that
//! expect one frame per message are no longer supported.
//!
//! ## Flow control
//!
//! Backpressure is per stream: a reader that falls behind stalls writers on
//! its own stream only, never the other streams of the connection.

pub mod memory;
pub mod mux;
pub mod tcp;

use {
    crate::{endpoint::Endpoint, error::Result, key::PublicKey},
    async_trait::async_trait,
    std::sync::Arc,
    tokio_util::sync::CancellationToken,
};

pub use {memory::MemoryNetwork, memory::MemoryTransport, mux::MuxConfig, tcp::TcpTransport};

/// Identifies a stream within one connection. The router uses the channel
/// ID as the stream ID.
pub type StreamId = u16;

/// A logical duplex pipe within a [`Connection`].
#[async_trait]
pub trait Stream: Send + Sync {
    /// The stream ID.
    fn id(&self) -> StreamId;

    /// Write one complete message.
    ///
    /// Must be framed as a single unit: concurrent writes on other streams
    /// of the same connection never interleave with it.
    async fn write(&self, message: &[u8]) -> Result<()>;

    /// Read the next message written by the remote side.
    ///
    /// Fails with [`P2pError::ConnectionClosed`](crate::error::P2pError::ConnectionClosed)
    /// once the connection is closed and no buffered data remains.
    async fn read(&self) -> Result<Vec<u8>>;
}

/// An established link to a remote node.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Our end of the link.
    fn local_endpoint(&self) -> Endpoint;

    /// The remote end of the link.
    fn remote_endpoint(&self) -> Endpoint;

    /// Key material presented by the remote node. The connection does not
    /// judge it; callers compare the derived peer ID with what they expect.
    fn remote_public_key(&self) -> PublicKey;

    /// The stream with the given ID. Repeated calls return the same stream.
    fn stream(&self, id: StreamId) -> Result<Arc<dyn Stream>>;

    /// Wait for the remote side to start a stream we have not opened yet.
    async fn accept_stream(&self) -> Result<StreamId>;

    /// Forget stream `id` and drop whatever it buffered. Data the remote
    /// sends on it afterwards starts it anew and is announced through
    /// [`accept_stream`](Self::accept_stream).
    fn release_stream(&self, id: StreamId);

    /// Close the connection, failing all blocked and future stream I/O.
    fn close(&self);

    /// Whether [`close`](Self::close) was called or the link failed.
    fn is_closed(&self) -> bool;

    /// Resolves once the connection is closed.
    async fn closed(&self);
}

/// Dials and accepts connections for one protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The protocol tag this transport serves, matched against
    /// [`Endpoint::protocol`].
    fn protocol(&self) -> &str;

    /// Addresses the transport listens on. May contain wildcard IPs.
    fn endpoints(&self) -> Vec<Endpoint>;

    /// Wait for the next inbound connection whose handshake completed.
    ///
    /// Handshakes run concurrently, so a slow or silent client never holds
    /// up the ones behind it. Fails with [`P2pError::Cancelled`](crate::error::P2pError::Cancelled)
    /// when `cancel` fires.
    async fn accept(&self, cancel: &CancellationToken) -> Result<Arc<dyn Connection>>;

    /// Open an outbound connection to `endpoint`, whose protocol must match
    /// this transport.
    async fn dial(
        &self,
        cancel: &CancellationToken,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn Connection>>;

    /// Stop listening. Pending and later `accept` calls fail.
    async fn close(&self) -> Result<()>;
}
