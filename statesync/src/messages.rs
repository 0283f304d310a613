//! Wire messages of the state-sync channels.
//!
//! Two channels, one enum each:
//!
//! | Channel | ID | Messages |
//! |---------|----|----------|
//! | snapshots | `0x60` | `SnapshotsRequest`, `SnapshotsResponse` |
//! | chunks    | `0x61` | `ChunkRequest`, `ChunkResponse` |
//!
//! A `ChunkResponse` distinguishes three outcomes: `chunk: Some(bytes)`
//! for a non-empty chunk, `chunk: None` with `missing: false` for a chunk
//! that exists but is empty, and `missing: true` for a chunk the peer does
//! not have.

use {
    crate::app::Snapshot,
    serde::{Deserialize, Serialize},
    trv1_p2p::ChannelId,
};

/// Channel for snapshot discovery.
pub const SNAPSHOT_CHANNEL: ChannelId = 0x60;

/// Channel for chunk transfer.
pub const CHUNK_CHANNEL: ChannelId = 0x61;

/// Messages on [`SNAPSHOT_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotMessage {
    /// Ask a peer for the snapshots it can serve.
    SnapshotsRequest,
    /// One snapshot the peer can serve. Sent once per snapshot.
    SnapshotsResponse(SnapshotsResponse),
}

/// Advertisement of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotsResponse {
    pub height: u64,
    pub format: u32,
    pub chunks: u32,
    pub hash: Vec<u8>,
    pub metadata: Vec<u8>,
}

impl From<Snapshot> for SnapshotsResponse {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            height: snapshot.height,
            format: snapshot.format,
            chunks: snapshot.chunks,
            hash: snapshot.hash,
            metadata: snapshot.metadata,
        }
    }
}

impl From<SnapshotsResponse> for Snapshot {
    fn from(response: SnapshotsResponse) -> Self {
        Self {
            height: response.height,
            format: response.format,
            chunks: response.chunks,
            hash: response.hash,
            metadata: response.metadata,
        }
    }
}

/// Messages on [`CHUNK_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkMessage {
    ChunkRequest(ChunkRequest),
    ChunkResponse(ChunkResponse),
}

/// Request for one chunk of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub height: u64,
    pub format: u32,
    pub index: u32,
}

/// Reply to a [`ChunkRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub height: u64,
    pub format: u32,
    pub index: u32,
    /// Chunk contents; `None` for an empty or missing chunk.
    pub chunk: Option<Vec<u8>>,
    /// The peer does not have this chunk.
    pub missing: bool,
}

impl ChunkResponse {
    /// Build the reply to `request` from what the application returned.
    pub fn from_loaded(request: &ChunkRequest, loaded: Option<Vec<u8>>) -> Self {
        let (chunk, missing) = match loaded {
            Some(bytes) if bytes.is_empty() => (None, false),
            Some(bytes) => (Some(bytes), false),
            None => (None, true),
        };
        Self {
            height: request.height,
            format: request.format,
            index: request.index,
            chunk,
            missing,
        }
    }
}
