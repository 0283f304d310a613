//! TRv1 Peer-to-Peer Layer
//!
//! This crate moves typed messages between nodes.  It handles:
//!
//! - **Transports**: pluggable dial/accept factories for one protocol each:
//!   an in-process [`MemoryTransport`](transport::MemoryTransport) and a
//!   [`TcpTransport`](transport::TcpTransport), both carrying a key exchange
//!   and a stream multiplexer.
//! - **Channels**: typed, bounded, peer-addressable queues, one per message
//!   type, through which reactors talk to the network.
//! - **Routing**: the [`Router`](router::Router) authenticates connections,
//!   wires every open channel onto a stream of every connected peer, fans
//!   out broadcasts, and turns malformed traffic into peer penalties.
//! - **Peer bookkeeping**: the [`PeerStore`](peer_store::PeerStore) keeps
//!   known endpoints, dial backoff and bans across reconnects.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────────┐
//!  │  Reactors (state sync, ...)                      │
//!  │  ← Envelope { from, message }                    │
//!  │  → Envelope { to | broadcast, message }          │
//!  └──────────────┬───────────────────────────────────┘
//!                 │  Channel<M> (bounded tokio mpsc)
//!  ┌──────────────▼───────────────────────────────────┐
//!  │  Router                                          │
//!  │  • per-channel dispatch, per-peer stream tasks   │
//!  │  • dial loop, accept loops, penalty policy       │
//!  └──────┬──────────────────────────┬────────────────┘
//!         │                          │
//!  ┌──────▼──────┐          ┌────────▼─────────┐
//!  │  PeerStore  │          │  Connection      │
//!  │ (endpoints, │          │  (streams muxed  │
//!  │  bans)      │          │   by channel ID) │
//!  └─────────────┘          └────────┬─────────┘
//!                                    │
//!  ┌─────────────────────────────────▼────────────────┐
//!  │  Transport (memory, tcp)                         │
//!  └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]     | `P2pConfig` defaults and dev overrides |
//! | [`key`]        | Public keys and the peer IDs derived from them |
//! | [`endpoint`]   | Transport addresses, parsing and normalization |
//! | [`message`]    | bincode message codec |
//! | [`channel`]    | `Channel`, `Envelope` and peer error reports |
//! | [`transport`]  | Transport/Connection/Stream contract, mux, memory and TCP |
//! | [`peer_store`] | Known peers, dial backoff, bans |
//! | [`router`]     | Connection lifecycle and message routing |
//! | [`error`]      | Crate-wide error enum |

pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod key;
pub mod message;
pub mod peer_store;
pub mod router;
pub mod transport;

pub use {
    channel::{Channel, ChannelId, Envelope, PeerError, Severity},
    config::P2pConfig,
    endpoint::Endpoint,
    error::{P2pError, Result},
    key::{PeerId, PublicKey},
    message::Message,
    peer_store::{PeerStatus, PeerStore},
    router::{PeerUpdate, PeerUpdateStatus, Router},
};
