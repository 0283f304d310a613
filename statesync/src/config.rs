//! Configuration for the state-sync reactor.

/// Default cap on snapshot responses per request.
pub const DEFAULT_MAX_ADVERTISED_SNAPSHOTS: usize = 10;

/// Configuration for the state-sync reactor.
#[derive(Debug, Clone)]
pub struct StateSyncConfig {
    /// At most this many snapshots, newest first, are offered in reply to
    /// a snapshots request.
    pub max_advertised_snapshots: usize,

    /// Ask every newly connected peer for its snapshots.
    pub request_snapshots_on_peer_up: bool,
}

impl Default for StateSyncConfig {
    fn default() -> Self {
        Self {
            max_advertised_snapshots: DEFAULT_MAX_ADVERTISED_SNAPSHOTS,
            request_snapshots_on_peer_up: true,
        }
    }
}
