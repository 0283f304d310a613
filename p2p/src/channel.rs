//! Typed, peer-addressable message channels.
//!
//! A [`Channel`] is how a reactor talks to the network. It carries exactly
//! one [`Message`] type, bound to a [`ChannelId`], and holds three bounded
//! queues:
//!
//! - **inbound**: envelopes received from peers, `from` always set;
//! - **outbound**: envelopes to send, addressed with `to` or `broadcast`;
//!   envelopes with neither are discarded by the router;
//! - **error**: [`PeerError`] reports, the only way a reactor can
//!   influence how the router treats a peer.
//!
//! All queues are bounded by the configured capacity: a full queue blocks
//! the sender until the consumer catches up.

use {
    crate::{
        error::{P2pError, Result},
        key::PeerId,
        message::Message,
    },
    std::fmt,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
};

/// Numeric channel identifier, bound one-to-one with a message type.
pub type ChannelId = u16;

/// A message plus its routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    /// Sender. Always set on inbound envelopes; ignored on outbound ones
    /// except that a broadcast skips this peer.
    pub from: Option<PeerId>,
    /// Recipient of an outbound envelope. Ignored when `broadcast` is set.
    pub to: Option<PeerId>,
    /// Send to every connected peer.
    pub broadcast: bool,
    /// Payload.
    pub message: M,
}

impl<M> Envelope<M> {
    /// An outbound envelope for a single peer.
    pub fn to(peer: PeerId, message: M) -> Self {
        Self {
            from: None,
            to: Some(peer),
            broadcast: false,
            message,
        }
    }

    /// An outbound envelope for every connected peer.
    pub fn broadcast(message: M) -> Self {
        Self {
            from: None,
            to: None,
            broadcast: true,
            message,
        }
    }

    /// An inbound envelope received from `peer`.
    pub fn inbound(peer: PeerId, message: M) -> Self {
        Self {
            from: Some(peer),
            to: None,
            broadcast: false,
            message,
        }
    }

    /// Whether an outbound envelope names a destination.
    pub fn is_routable(&self) -> bool {
        self.broadcast || self.to.is_some()
    }
}

/// How hard the router should come down on a reported peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Disconnect; repeated reports eventually ban.
    Disconnect,
    /// Disconnect and ban right away.
    Ban,
}

/// A report of peer misbehaviour, sent on a channel's error queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerError {
    /// Offending peer.
    pub peer: PeerId,
    /// Human-readable reason, for logs.
    pub reason: String,
    /// Requested penalty.
    pub severity: Severity,
}

impl PeerError {
    /// A report asking for the peer to be disconnected.
    pub fn new(peer: PeerId, reason: impl Into<String>) -> Self {
        Self {
            peer,
            reason: reason.into(),
            severity: Severity::Disconnect,
        }
    }

    /// A report asking for the peer to be banned.
    pub fn ban(peer: PeerId, reason: impl Into<String>) -> Self {
        Self {
            peer,
            reason: reason.into(),
            severity: Severity::Ban,
        }
    }
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {} ({:?}): {}", self.peer, self.severity, self.reason)
    }
}

/// A bidirectional channel for exchanging `M` messages with peers.
///
/// Closing (or dropping) the channel tells the router to stop delivering on
/// its ID and frees the ID for reuse.
pub struct Channel<M: Message> {
    id: ChannelId,
    inbound: mpsc::Receiver<Envelope<M>>,
    outbound: mpsc::Sender<Envelope<M>>,
    errors: mpsc::Sender<PeerError>,
}

/// The router-facing ends of a [`Channel`]'s queues.
pub struct ChannelParts<M> {
    /// Feeds the channel's inbound queue.
    pub inbound: mpsc::Sender<Envelope<M>>,
    /// Drains the channel's outbound queue.
    pub outbound: mpsc::Receiver<Envelope<M>>,
    /// Drains the channel's error queue.
    pub errors: mpsc::Receiver<PeerError>,
}

impl<M: Message> Channel<M> {
    /// Create a channel with queues of `capacity` entries, returning the
    /// reactor end and the router end.
    ///
    /// Reactors normally get their channel from
    /// [`Router::open_channel`](crate::router::Router::open_channel); calling
    /// this directly is useful for driving a reactor without a network.
    pub fn new(id: ChannelId, capacity: usize) -> (Self, ChannelParts<M>) {
        let capacity = capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (errors_tx, errors_rx) = mpsc::channel(capacity);
        (
            Self {
                id,
                inbound: inbound_rx,
                outbound: outbound_tx,
                errors: errors_tx,
            },
            ChannelParts {
                inbound: inbound_tx,
                outbound: outbound_rx,
                errors: errors_rx,
            },
        )
    }

    /// The channel ID.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Receive the next inbound envelope. Returns `None` once the router has
    /// released the channel.
    pub async fn recv(&mut self) -> Option<Envelope<M>> {
        self.inbound.recv().await
    }

    /// Receive the next inbound envelope, giving up when `cancel` fires.
    pub async fn recv_or_cancel(&mut self, cancel: &CancellationToken) -> Result<Envelope<M>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(P2pError::Cancelled),
            envelope = self.inbound.recv() => envelope.ok_or(P2pError::ChannelClosed),
        }
    }

    /// Enqueue an outbound envelope, waiting while the queue is full.
    pub async fn send(&self, envelope: Envelope<M>) -> Result<()> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| P2pError::ChannelClosed)
    }

    /// Enqueue an outbound envelope, giving up when `cancel` fires.
    pub async fn send_or_cancel(
        &self,
        envelope: Envelope<M>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(P2pError::Cancelled),
            sent = self.outbound.send(envelope) => sent.map_err(|_| P2pError::ChannelClosed),
        }
    }

    /// Report a misbehaving peer to the router.
    pub async fn report(&self, error: PeerError) -> Result<()> {
        self.errors
            .send(error)
            .await
            .map_err(|_| P2pError::ChannelClosed)
    }

    /// Close the channel.
    pub fn close(self) {}
}

impl<M: Message> fmt::Debug for Channel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("message_type", &std::any::type_name::<M>())
            .finish()
    }
}
