//! Node identities.
//!
//! A node is identified on the network by a [`PeerId`], derived from the
//! public key its connections present: the first 20 bytes of the SHA-256
//! digest of the key. The ID is therefore stable across reconnects and can
//! be checked against the key material of any new connection.

use {
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    std::{fmt, str::FromStr},
};

/// Length of an encoded public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of a peer ID.
pub const PEER_ID_LEN: usize = 20;

/// A node's public key, as exchanged during the connection handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// Wrap raw key bytes.
    pub const fn new(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// The peer ID this key maps to.
    pub fn peer_id(&self) -> PeerId {
        let digest = Sha256::digest(self.0);
        let mut id = [0u8; PEER_ID_LEN];
        id.copy_from_slice(&digest[..PEER_ID_LEN]);
        PeerId(id)
    }

    /// A distinct key for tests, generated from a process-wide counter.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn new_unique() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        bytes[..8].copy_from_slice(&n.to_le_bytes());
        Self(bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// Opaque, stable identifier of a node, derived from its public key.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Wrap raw ID bytes.
    pub const fn new(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw ID bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl From<&PublicKey> for PeerId {
    fn from(key: &PublicKey) -> Self {
        key.peer_id()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; PEER_ID_LEN];
        hex::decode_to_slice(s, &mut id)?;
        Ok(Self(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_is_stable_and_distinct() {
        let a = PublicKey::new_unique();
        let b = PublicKey::new_unique();
        assert_eq!(a.peer_id(), a.peer_id());
        assert_ne!(a.peer_id(), b.peer_id());
        assert_eq!(PeerId::from(&a), a.peer_id());
    }

    #[test]
    fn test_peer_id_known_value() {
        // sha256 of 32 zero bytes starts with 66687aadf862bd77...
        let id = PublicKey::new([0u8; PUBLIC_KEY_LEN]).peer_id();
        assert!(id.to_string().starts_with("66687aadf862bd77"));
    }

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = PublicKey::new_unique().peer_id();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("zz".parse::<PeerId>().is_err());
    }
}
