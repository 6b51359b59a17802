//! Envelope and payload encoding
//!
//! The core treats serialization as a pluggable capability: fibers encode a
//! whole [`Envelope`] through an [`EnvelopeCodec`] before handing bytes to the
//! transport, and handlers see typed payloads decoded with bincode.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use strand_types::{CoreError, Envelope, Result};

/// Converts envelopes to and from transport bytes
pub trait EnvelopeCodec: Send + Sync + 'static {
    fn encode(&self, envelope: &Envelope) -> Result<Bytes>;
    fn decode(&self, bytes: &[u8]) -> Result<Envelope>;
}

/// Default codec backed by bincode
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl EnvelopeCodec for BincodeCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Bytes> {
        bincode::serialize(envelope)
            .map(Bytes::from)
            .map_err(|e| CoreError::codec(format!("envelope encode failed: {}", e)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        bincode::deserialize(bytes)
            .map_err(|e| CoreError::codec(format!("envelope decode failed: {}", e)))
    }
}

/// Serialize a typed payload
pub fn encode_payload<M: Serialize>(message: &M) -> Result<Bytes> {
    bincode::serialize(message)
        .map(Bytes::from)
        .map_err(|e| CoreError::codec(format!("payload encode failed: {}", e)))
}

/// Deserialize a typed payload
pub fn decode_payload<M: DeserializeOwned>(bytes: &[u8]) -> Result<M> {
    bincode::deserialize(bytes).map_err(|e| CoreError::codec(format!("payload decode failed: {}", e)))
}
