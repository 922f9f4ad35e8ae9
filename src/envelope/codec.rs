//! Wire codec for envelopes (bitcode over serde).

use super::Envelope;
use crate::error::CodecError;

/// Serialize an envelope to its wire form.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    bitcode::serialize(envelope).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Deserialize an envelope from its wire form.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    Ok(bitcode::deserialize(bytes)?)
}
