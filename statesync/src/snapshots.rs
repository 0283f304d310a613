//! Snapshots advertised by peers.
//!
//! The [`SnapshotPool`] remembers every valid snapshot advertisement and
//! which peers made it, so a restorer can pick the best candidate and know
//! whom to fetch chunks from. A peer's advertisements are forgotten when it
//! disconnects.

use {
    crate::app::Snapshot,
    log::debug,
    std::collections::{BTreeMap, BTreeSet},
    trv1_p2p::PeerId,
};

/// Orders snapshots by height, then format, then hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SnapshotKey {
    height: u64,
    format: u32,
    hash: Vec<u8>,
}

impl From<&Snapshot> for SnapshotKey {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            height: snapshot.height,
            format: snapshot.format,
            hash: snapshot.hash.clone(),
        }
    }
}

#[derive(Debug)]
struct PooledSnapshot {
    snapshot: Snapshot,
    peers: BTreeSet<PeerId>,
}

/// Snapshot advertisements keyed by snapshot, with their advertisers.
#[derive(Debug, Default)]
pub struct SnapshotPool {
    snapshots: BTreeMap<SnapshotKey, PooledSnapshot>,
}

impl SnapshotPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Record that `peer` offers `snapshot`. Returns true if no peer had
    /// offered it before.
    pub fn add(&mut self, peer: PeerId, snapshot: Snapshot) -> bool {
        let key = SnapshotKey::from(&snapshot);
        let mut added = false;
        let entry = self.snapshots.entry(key).or_insert_with(|| {
            added = true;
            PooledSnapshot {
                snapshot,
                peers: BTreeSet::new(),
            }
        });
        entry.peers.insert(peer);
        if added {
            debug!(
                "discovered snapshot height={} format={} from {}",
                entry.snapshot.height, entry.snapshot.format, peer
            );
        }
        added
    }

    /// Forget everything `peer` advertised. Snapshots nobody else offers
    /// are dropped.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.snapshots.retain(|_, pooled| {
            pooled.peers.remove(peer);
            !pooled.peers.is_empty()
        });
    }

    /// The snapshot with the highest height, then format.
    pub fn best(&self) -> Option<Snapshot> {
        self.snapshots
            .values()
            .next_back()
            .map(|pooled| pooled.snapshot.clone())
    }

    /// Peers offering `snapshot`, sorted.
    pub fn peers(&self, snapshot: &Snapshot) -> Vec<PeerId> {
        self.snapshots
            .get(&SnapshotKey::from(snapshot))
            .map(|pooled| pooled.peers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All snapshots, best first.
    pub fn ranked(&self) -> Vec<Snapshot> {
        self.snapshots
            .values()
            .rev()
            .map(|pooled| pooled.snapshot.clone())
            .collect()
    }
}
