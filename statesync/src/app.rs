//! Interface to the application's snapshot store.

use {crate::error::Result, async_trait::async_trait};

/// A snapshot the application can serve.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Snapshot {
    pub height: u64,
    pub format: u32,
    /// Number of chunks.
    pub chunks: u32,
    pub hash: Vec<u8>,
    /// Application-defined, opaque to the reactor.
    pub metadata: Vec<u8>,
}

/// Snapshot queries against the application.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AppConnSnapshot: Send + Sync {
    /// All snapshots available locally, in no particular order.
    async fn list_snapshots(&self) -> Result<Vec<Snapshot>>;

    /// One chunk of a snapshot. `Ok(None)` means no such chunk;
    /// `Ok(Some(vec![]))` is a chunk that exists and is empty.
    async fn load_snapshot_chunk(&self, height: u64, format: u32, index: u32)
        -> Result<Option<Vec<u8>>>;
}
