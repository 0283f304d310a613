//! Configuration for the p2p layer.

use std::{net::IpAddr, time::Duration};

/// Configuration for the router, its transports and its queues.
///
/// Controls connection limits, queue capacities, dial pacing and the peer
/// penalty policy.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Maximum number of live peer connections.
    pub max_connections: usize,

    /// Capacity of each channel's inbound, outbound and error queues.
    /// Enqueueing beyond this blocks the sender.
    pub queue_capacity: usize,

    /// Capacity of the per-peer, per-channel outbound queue the router
    /// feeds each stream from.
    pub peer_queue_capacity: usize,

    /// Maximum size of a single encoded message in bytes.
    pub max_message_size: usize,

    /// Interval between dialing rounds over PeerStore candidates.
    pub dial_interval: Duration,

    /// Maximum number of dials in flight at once.
    pub max_concurrent_dials: usize,

    /// How long a single dial may take, handshake included.
    pub dial_timeout: Duration,

    /// How long the key exchange on a fresh connection may take.
    pub handshake_timeout: Duration,

    /// Maximum number of inbound connections in their key exchange at once,
    /// per transport.
    pub max_concurrent_handshakes: usize,

    /// Backoff after the first failed dial to a peer. Doubles per
    /// consecutive failure.
    pub min_retry_backoff: Duration,

    /// Upper bound for the dial backoff.
    pub max_retry_backoff: Duration,

    /// Number of error reports against a peer before it is banned by policy.
    pub max_peer_errors: u32,

    /// How long a policy ban lasts.
    pub ban_duration: Duration,

    /// Address advertised in place of wildcard listen IPs.
    pub external_ip: Option<IpAddr>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            max_connections: 64,
            queue_capacity: 1_024,
            peer_queue_capacity: 256,
            max_message_size: 4_194_304, // 4 MB, snapshot chunks included
            dial_interval: Duration::from_secs(1),
            max_concurrent_dials: 8,
            dial_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            max_concurrent_handshakes: 32,
            min_retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(300),
            max_peer_errors: 3,
            ban_duration: Duration::from_secs(600),
            external_ip: None,
        }
    }
}

impl P2pConfig {
    /// Create a config suitable for local testing with shorter timeouts.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            max_connections: 16,
            queue_capacity: 64,
            peer_queue_capacity: 64,
            max_message_size: 1_048_576,
            dial_interval: Duration::from_millis(20),
            max_concurrent_dials: 4,
            dial_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            max_concurrent_handshakes: 8,
            min_retry_backoff: Duration::from_millis(50),
            max_retry_backoff: Duration::from_millis(500),
            max_peer_errors: 3,
            ban_duration: Duration::from_secs(5),
            external_ip: None,
        }
    }

    /// Backoff before redialing a peer after `failures` consecutive failed
    /// dials.
    pub fn retry_backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let shift = failures.saturating_sub(1).min(16);
        self.min_retry_backoff
            .saturating_mul(2u32.saturating_pow(shift))
            .min(self.max_retry_backoff)
    }
}
