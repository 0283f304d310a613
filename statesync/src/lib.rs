//! TRv1 State Sync
//!
//! A reactor that lets a fresh node discover and download application
//! snapshots from its peers instead of replaying history.  It handles:
//!
//! - **Serving**: answers snapshot listings and chunk requests from the
//!   local application's snapshot store.
//! - **Discovery**: asks every newly connected peer for its snapshots and
//!   pools the advertisements, forgetting a peer's offers when it leaves.
//! - **Fetching**: sends chunk requests on behalf of a restorer and hands
//!   the responses to it.
//!
//! The reactor runs on two [`trv1_p2p`] channels, [`SNAPSHOT_CHANNEL`] and
//! [`CHUNK_CHANNEL`], and sees peer arrivals through the router's peer
//! update stream.
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`app`]       | `AppConnSnapshot`, the application's snapshot store |
//! | [`messages`]  | Channel IDs and wire messages |
//! | [`snapshots`] | Pool of snapshots advertised by peers |
//! | [`reactor`]   | The reactor task and its handle |
//! | [`config`]    | `StateSyncConfig` |
//! | [`error`]     | Crate-wide error enum |

pub mod app;
pub mod config;
pub mod error;
pub mod messages;
pub mod reactor;
pub mod snapshots;

pub use {
    app::{AppConnSnapshot, Snapshot},
    config::StateSyncConfig,
    error::{Result, StateSyncError},
    messages::{
        ChunkMessage, ChunkRequest, ChunkResponse, SnapshotMessage, SnapshotsResponse,
        CHUNK_CHANNEL, SNAPSHOT_CHANNEL,
    },
    reactor::{Reactor, ReactorHandle, ReceivedChunk},
    snapshots::SnapshotPool,
};
