//! Known peers, their addresses and connection state.
//!
//! The [`PeerStore`] is the router's memory of the network: which peers it
//! has heard of, where they can be reached, whether they are connected, how
//! often dialing them has failed and whether they are banned. Entries
//! survive disconnects so that peers can be redialed; they are only removed
//! explicitly.
//!
//! The store is plain data. The router keeps it behind a lock and is its
//! only writer.

use {
    crate::{
        channel::Severity,
        config::P2pConfig,
        endpoint::Endpoint,
        key::PeerId,
    },
    log::{debug, info, warn},
    std::{
        collections::HashMap,
        time::{Duration, Instant},
    },
};

/// Lifecycle state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// An outbound dial is in flight.
    Dialing,
    /// An inbound connection is being set up.
    Accepting,
    /// A connection is up and its key is being checked.
    Authenticating,
    /// Authenticated and registered with the router.
    Connected,
    /// The connection is being torn down.
    Disconnecting,
    /// Not connected. Endpoints are kept for redialing.
    Disconnected,
    /// Refused for dialing and accepting until unbanned or expired.
    Banned,
}

/// Why and for how long a peer is banned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ban {
    /// Until explicitly lifted.
    Permanent,
    /// Until the given instant.
    Until(Instant),
}

impl Ban {
    fn is_active(&self, now: Instant) -> bool {
        match self {
            Self::Permanent => true,
            Self::Until(expires) => *expires > now,
        }
    }
}

/// What the router should do after a peer error was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Penalty {
    /// Disconnect; the peer may reconnect.
    Disconnect,
    /// Disconnect; the peer is now banned.
    Ban,
}

/// Per-peer bookkeeping.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Peer identity.
    pub id: PeerId,
    /// Candidate endpoints for dialing, in the order learned.
    pub endpoints: Vec<Endpoint>,
    /// Endpoint of the live connection, if any.
    pub live_endpoint: Option<Endpoint>,
    /// Lifecycle state.
    pub status: PeerStatus,
    /// Consecutive failed dials.
    pub dial_failures: u32,
    /// Earliest time for the next dial attempt.
    pub next_dial_at: Option<Instant>,
    /// Error reports received since the last ban.
    pub error_count: u32,
    /// Active ban, if any.
    pub ban: Option<Ban>,
}

impl PeerEntry {
    /// A record for a newly learned peer.
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            endpoints: Vec::new(),
            live_endpoint: None,
            status: PeerStatus::Disconnected,
            dial_failures: 0,
            next_dial_at: None,
            error_count: 0,
            ban: None,
        }
    }

    /// Whether the peer has a connection in any stage of setup or use.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            PeerStatus::Dialing
                | PeerStatus::Accepting
                | PeerStatus::Authenticating
                | PeerStatus::Connected
                | PeerStatus::Disconnecting
        )
    }
}

/// Repository of known peers.
#[derive(Debug)]
pub struct PeerStore {
    peers: HashMap<PeerId, PeerEntry>,
    config: P2pConfig,
    max_peer_errors: u32,
}

impl PeerStore {
    /// Create an empty store using the backoff and penalty settings of
    /// `config`.
    pub fn new(config: &P2pConfig) -> Self {
        Self {
            peers: HashMap::new(),
            config: config.clone(),
            max_peer_errors: config.max_peer_errors.max(1),
        }
    }

    /// Number of known peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// The entry for `peer`.
    pub fn get(&self, peer: &PeerId) -> Option<&PeerEntry> {
        self.peers.get(peer)
    }

    /// The status of `peer`, if known.
    pub fn status(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.peers.get(peer).map(|entry| entry.status)
    }

    /// All peers currently marked connected.
    pub fn connected(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self
            .peers
            .values()
            .filter(|entry| entry.status == PeerStatus::Connected)
            .map(|entry| entry.id)
            .collect();
        peers.sort();
        peers
    }

    fn entry(&mut self, peer: PeerId) -> &mut PeerEntry {
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerEntry::new(peer))
    }

    // ── Addresses ───────────────────────────────────────────────────────

    /// Add a candidate endpoint for `peer`, creating the entry if needed.
    /// Returns true if the endpoint was not known yet.
    pub fn add_endpoint(&mut self, peer: PeerId, endpoint: Endpoint) -> bool {
        let entry = self.entry(peer);
        if entry.endpoints.contains(&endpoint) {
            return false;
        }
        debug!("peer {}: new endpoint {}", peer, endpoint);
        entry.endpoints.push(endpoint);
        true
    }

    /// Add several candidate endpoints, as learned from address exchange.
    /// Returns how many were new.
    pub fn add_endpoints(
        &mut self,
        peer: PeerId,
        endpoints: impl IntoIterator<Item = Endpoint>,
    ) -> usize {
        endpoints
            .into_iter()
            .filter(|endpoint| self.add_endpoint(peer, endpoint.clone()))
            .count()
    }

    /// Forget a peer entirely.
    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerEntry> {
        let removed = self.peers.remove(peer);
        if removed.is_some() {
            info!("removed peer {}", peer);
        }
        removed
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Record that `peer` is being dialed.
    pub fn mark_dialing(&mut self, peer: PeerId) {
        self.entry(peer).status = PeerStatus::Dialing;
    }

    /// Record that an inbound connection from `peer` is being set up.
    /// Ignored while another connection to the peer is in progress.
    pub fn mark_accepting(&mut self, peer: PeerId) {
        let entry = self.entry(peer);
        if !entry.is_active() && entry.status != PeerStatus::Banned {
            entry.status = PeerStatus::Accepting;
        }
    }

    /// Record that a dialed connection is up and its key is being checked.
    pub fn mark_authenticating(&mut self, peer: PeerId) {
        let entry = self.entry(peer);
        if entry.status == PeerStatus::Dialing {
            entry.status = PeerStatus::Authenticating;
        }
    }

    /// Roll back an inbound connection that was rejected during setup.
    pub fn abort_accepting(&mut self, peer: &PeerId) {
        if let Some(entry) = self.peers.get_mut(peer) {
            if entry.status == PeerStatus::Accepting {
                entry.status = PeerStatus::Disconnected;
            }
        }
    }

    /// Record a live connection to `peer` at `endpoint`.
    ///
    /// Outbound endpoints become dial candidates; inbound ones are only
    /// remembered as the live address since the remote port is ephemeral.
    pub fn mark_connected(&mut self, peer: PeerId, endpoint: Endpoint, outbound: bool) {
        if outbound {
            self.add_endpoint(peer, endpoint.clone());
        }
        let entry = self.entry(peer);
        entry.status = PeerStatus::Connected;
        entry.live_endpoint = Some(endpoint);
        entry.dial_failures = 0;
        entry.next_dial_at = None;
    }

    /// Record that the connection to `peer` is being torn down.
    pub fn mark_disconnecting(&mut self, peer: &PeerId) {
        if let Some(entry) = self.peers.get_mut(peer) {
            if entry.status == PeerStatus::Connected {
                entry.status = PeerStatus::Disconnecting;
            }
        }
    }

    /// Record that `peer` is no longer connected, keeping its endpoints.
    pub fn mark_disconnected(&mut self, peer: &PeerId) {
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.live_endpoint = None;
            if entry.status != PeerStatus::Banned {
                entry.status = PeerStatus::Disconnected;
            }
        }
    }

    /// Record a failed dial and schedule the next attempt with exponential
    /// backoff.
    pub fn record_dial_failure(&mut self, peer: &PeerId, now: Instant) {
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.dial_failures = entry.dial_failures.saturating_add(1);
            let backoff = self.config.retry_backoff(entry.dial_failures);
            entry.next_dial_at = now.checked_add(backoff);
            if matches!(entry.status, PeerStatus::Dialing | PeerStatus::Authenticating) {
                entry.status = PeerStatus::Disconnected;
            }
            debug!(
                "peer {}: dial failure #{}, next attempt in {:?}",
                peer, entry.dial_failures, backoff
            );
        }
    }

    /// Peers worth dialing now: not active, not banned, with at least one
    /// endpoint and past their backoff. Returns at most `limit` peers with
    /// their candidate endpoints, fewest failures first.
    pub fn dial_candidates(&mut self, now: Instant, limit: usize) -> Vec<(PeerId, Vec<Endpoint>)> {
        self.expire_bans(now);
        let mut candidates: Vec<&PeerEntry> = self
            .peers
            .values()
            .filter(|entry| entry.status == PeerStatus::Disconnected)
            .filter(|entry| !entry.endpoints.is_empty())
            .filter(|entry| entry.next_dial_at.map_or(true, |at| at <= now))
            .collect();
        candidates.sort_by_key(|entry| (entry.dial_failures, entry.id));
        candidates
            .into_iter()
            .take(limit)
            .map(|entry| (entry.id, entry.endpoints.clone()))
            .collect()
    }

    // ── Bans and penalties ──────────────────────────────────────────────

    /// Ban `peer` for `duration`, or permanently when `None`.
    pub fn ban(&mut self, peer: PeerId, duration: Option<Duration>, now: Instant) {
        let ban = match duration.and_then(|duration| now.checked_add(duration)) {
            Some(expires) => Ban::Until(expires),
            None => Ban::Permanent,
        };
        info!("banning peer {} ({:?})", peer, ban);
        let entry = self.entry(peer);
        entry.ban = Some(ban);
        entry.status = PeerStatus::Banned;
        entry.live_endpoint = None;
        entry.error_count = 0;
    }

    /// Lift any ban on `peer`. Returns true if the peer was banned.
    pub fn unban(&mut self, peer: &PeerId) -> bool {
        match self.peers.get_mut(peer) {
            Some(entry) if entry.ban.is_some() => {
                info!("unbanning peer {}", peer);
                entry.ban = None;
                entry.status = PeerStatus::Disconnected;
                entry.dial_failures = 0;
                entry.next_dial_at = None;
                true
            }
            _ => false,
        }
    }

    /// Whether `peer` is banned at `now`.
    pub fn is_banned(&self, peer: &PeerId, now: Instant) -> bool {
        self.peers
            .get(peer)
            .and_then(|entry| entry.ban)
            .is_some_and(|ban| ban.is_active(now))
    }

    /// Lift policy bans that have run out.
    pub fn expire_bans(&mut self, now: Instant) {
        for entry in self.peers.values_mut() {
            if matches!(entry.ban, Some(ban) if !ban.is_active(now)) {
                debug!("ban on peer {} expired", entry.id);
                entry.ban = None;
                entry.status = PeerStatus::Disconnected;
            }
        }
    }

    /// Apply the penalty policy to an error report against `peer`.
    ///
    /// Every report disconnects and delays the next dial by the retry
    /// backoff for the number of reports so far. [`Severity::Ban`] bans for
    /// the configured duration right away; otherwise the peer is banned once
    /// it has accumulated `max_peer_errors` reports.
    pub fn record_error(&mut self, peer: PeerId, severity: Severity, now: Instant) -> Penalty {
        let max_errors = self.max_peer_errors;
        let ban_duration = self.config.ban_duration;
        let backoff = self.config.retry_backoff(
            self.peers
                .get(&peer)
                .map_or(1, |entry| entry.error_count.saturating_add(1)),
        );
        let entry = self.entry(peer);
        entry.error_count = entry.error_count.saturating_add(1);
        if severity == Severity::Ban || entry.error_count >= max_errors {
            warn!(
                "peer {} reached {} error report(s), banning for {:?}",
                peer, entry.error_count, ban_duration
            );
            self.ban(peer, Some(ban_duration), now);
            return Penalty::Ban;
        }
        entry.next_dial_at = now.checked_add(backoff);
        Penalty::Disconnect
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {super::*, crate::key::PublicKey};

    fn test_peer() -> PeerId {
        PublicKey::new_unique().peer_id()
    }

    fn test_endpoint(n: u8) -> Endpoint {
        Endpoint::networked("tcp", std::net::SocketAddr::from(([127, 0, 0, n], 26656)))
    }

    fn store() -> PeerStore {
        PeerStore::new(&P2pConfig::dev_default())
    }

    #[test]
    fn test_add_endpoint_dedups() {
        let mut store = store();
        let peer = test_peer();
        assert!(store.add_endpoint(peer, test_endpoint(1)));
        assert!(!store.add_endpoint(peer, test_endpoint(1)));
        assert_eq!(
            store.add_endpoints(peer, [test_endpoint(1), test_endpoint(2)]),
            1
        );
        assert_eq!(store.get(&peer).unwrap().endpoints.len(), 2);
        assert_eq!(store.status(&peer), Some(PeerStatus::Disconnected));
    }

    #[test]
    fn test_disconnect_retains_endpoints() {
        let mut store = store();
        let peer = test_peer();
        store.add_endpoint(peer, test_endpoint(1));
        store.mark_dialing(peer);
        store.mark_authenticating(peer);
        store.mark_connected(peer, test_endpoint(1), true);
        assert_eq!(store.connected(), vec![peer]);

        store.mark_disconnecting(&peer);
        assert_eq!(store.status(&peer), Some(PeerStatus::Disconnecting));
        store.mark_disconnected(&peer);
        let entry = store.get(&peer).unwrap();
        assert_eq!(entry.status, PeerStatus::Disconnected);
        assert_eq!(entry.endpoints, vec![test_endpoint(1)]);
        assert!(entry.live_endpoint.is_none());
    }

    #[test]
    fn test_inbound_endpoint_is_not_a_dial_candidate() {
        let mut store = store();
        let peer = test_peer();
        store.mark_accepting(peer);
        store.mark_connected(peer, test_endpoint(9), false);
        let entry = store.get(&peer).unwrap();
        assert!(entry.endpoints.is_empty());
        assert_eq!(entry.live_endpoint, Some(test_endpoint(9)));
    }

    #[test]
    fn test_dial_candidates_skip_active_and_backoff() {
        let mut store = store();
        let now = Instant::now();
        let idle = test_peer();
        let connected = test_peer();
        let failing = test_peer();
        let no_address = test_peer();
        store.add_endpoint(idle, test_endpoint(1));
        store.add_endpoint(connected, test_endpoint(2));
        store.mark_connected(connected, test_endpoint(2), true);
        store.add_endpoint(failing, test_endpoint(3));
        store.mark_dialing(failing);
        store.record_dial_failure(&failing, now);
        store.mark_accepting(no_address);
        store.mark_disconnected(&no_address);

        let candidates = store.dial_candidates(now, 10);
        assert_eq!(candidates, vec![(idle, vec![test_endpoint(1)])]);

        // dev backoff after one failure is 50ms
        let later = now + Duration::from_millis(60);
        let ids: Vec<_> = store
            .dial_candidates(later, 10)
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], idle, "fewest failures first");
        assert!(store.dial_candidates(later, 1).len() == 1);
    }

    #[test]
    fn test_dial_failure_backoff_grows() {
        let mut store = store();
        let now = Instant::now();
        let peer = test_peer();
        store.add_endpoint(peer, test_endpoint(1));
        for _ in 0..3 {
            store.record_dial_failure(&peer, now);
        }
        let entry = store.get(&peer).unwrap();
        assert_eq!(entry.dial_failures, 3);
        assert_eq!(entry.next_dial_at, Some(now + Duration::from_millis(200)));

        store.mark_connected(peer, test_endpoint(1), true);
        assert_eq!(store.get(&peer).unwrap().dial_failures, 0);
    }

    #[test]
    fn test_backoff_follows_configured_schedule() {
        let config = P2pConfig {
            min_retry_backoff: Duration::from_millis(30),
            max_retry_backoff: Duration::from_millis(100),
            max_peer_errors: 10,
            ..P2pConfig::dev_default()
        };
        let mut store = PeerStore::new(&config);
        let now = Instant::now();
        let dialed = test_peer();
        let reported = test_peer();
        store.add_endpoint(dialed, test_endpoint(1));
        store.add_endpoint(reported, test_endpoint(2));
        for failures in 1..=4u32 {
            store.record_dial_failure(&dialed, now);
            store.record_error(reported, Severity::Disconnect, now);
            let expected = Some(now + config.retry_backoff(failures));
            assert_eq!(store.get(&dialed).unwrap().next_dial_at, expected);
            assert_eq!(store.get(&reported).unwrap().next_dial_at, expected);
        }
        assert_eq!(
            store.get(&dialed).unwrap().next_dial_at,
            Some(now + Duration::from_millis(100))
        );
    }

    #[test]
    fn test_error_reports_escalate_to_ban() {
        let mut store = store();
        let now = Instant::now();
        let peer = test_peer();
        store.add_endpoint(peer, test_endpoint(1));
        assert_eq!(store.record_error(peer, Severity::Disconnect, now), Penalty::Disconnect);
        assert_eq!(store.record_error(peer, Severity::Disconnect, now), Penalty::Disconnect);
        assert_eq!(
            store.get(&peer).unwrap().next_dial_at,
            Some(now + Duration::from_millis(100))
        );
        assert_eq!(store.get(&peer).unwrap().endpoints, vec![test_endpoint(1)]);
        assert_eq!(store.record_error(peer, Severity::Disconnect, now), Penalty::Ban);
        assert!(store.is_banned(&peer, now));
        assert!(store.dial_candidates(now, 10).is_empty());

        // dev ban lasts 5s
        let later = now + Duration::from_secs(6);
        assert!(!store.is_banned(&peer, later));
        assert_eq!(store.dial_candidates(later, 10).len(), 1);
        assert_eq!(store.get(&peer).unwrap().endpoints, vec![test_endpoint(1)]);
    }

    #[test]
    fn test_ban_severity_is_immediate() {
        let mut store = store();
        let now = Instant::now();
        let peer = test_peer();
        assert_eq!(store.record_error(peer, Severity::Ban, now), Penalty::Ban);
        assert_eq!(store.status(&peer), Some(PeerStatus::Banned));
    }

    #[test]
    fn test_permanent_ban_until_unban() {
        let mut store = store();
        let now = Instant::now();
        let peer = test_peer();
        store.add_endpoint(peer, test_endpoint(1));
        store.ban(peer, None, now);
        assert!(store.is_banned(&peer, now + Duration::from_secs(3_600)));
        store.expire_bans(now + Duration::from_secs(3_600));
        assert_eq!(store.status(&peer), Some(PeerStatus::Banned));

        assert!(store.unban(&peer));
        assert!(!store.unban(&peer));
        assert!(!store.is_banned(&peer, now));
        assert_eq!(store.dial_candidates(now, 10).len(), 1);
    }

    #[test]
    fn test_remove_peer() {
        let mut store = store();
        let peer = test_peer();
        store.add_endpoint(peer, test_endpoint(1));
        assert!(store.remove(&peer).is_some());
        assert_eq!(store.peer_count(), 0);
        assert!(store.remove(&peer).is_none());
    }
}
