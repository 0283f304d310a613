//! Message encoding.
//!
//! Every channel carries exactly one message type. Messages are encoded with
//! bincode, the compact wire representation used across the node; a decoded
//! message is always a complete value of the channel's type, so a payload
//! that fails to decode is treated as peer misbehaviour by the router.

use {
    crate::error::{P2pError, Result},
    serde::{de::DeserializeOwned, Serialize},
    std::fmt::Debug,
};

/// A typed message carried on a [`Channel`](crate::channel::Channel).
///
/// Implemented for any serde type; enum types are the usual way to carry
/// several request/response variants on one channel.
pub trait Message: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Encode this message for the wire.
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(P2pError::Serialization)
    }

    /// Encode this message, refusing payloads above `max_size` bytes.
    fn encode_bounded(&self, max_size: usize) -> Result<Vec<u8>> {
        let payload = self.encode()?;
        if payload.len() > max_size {
            return Err(P2pError::MessageTooLarge {
                size: payload.len(),
                max: max_size,
            });
        }
        Ok(payload)
    }

    /// Decode a message from a complete payload.
    fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(P2pError::Serialization)
    }
}

impl<T> Message for T where T: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {}
