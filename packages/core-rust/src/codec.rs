//! Wire codec: envelopes and batches to/from `MsgPack` bytes.
//!
//! All wire payloads go through `rmp_serde::to_vec_named()` so field names
//! travel with the data and the format stays self-describing across
//! independently-deployed services. `decode_batch(encode_batch(b))`
//! preserves envelope ids, headers, message type names, and payload bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Address;
use crate::envelope::Envelope;

/// A typed application message that can travel inside an envelope.
///
/// `NAME` is the logical type name used for routing, rule matching, and
/// handler resolution on the receiving node. The receiving side resolves
/// the concrete payload type from its own registry by this name; the
/// sender's type information never crosses the wire.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    const NAME: &'static str;
}

/// Error raised while encoding or decoding wire payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("outgoing batch for {0} contains no envelopes")]
    EmptyBatch(Address),
}

/// The document framed onto the wire: an ordered batch of envelopes.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBatch {
    envelopes: Vec<Envelope>,
}

/// Encodes a batch of envelopes into a wire payload.
///
/// # Errors
///
/// Returns `CodecError::Encode` if `MsgPack` serialization fails.
pub fn encode_batch(envelopes: &[Envelope]) -> Result<Vec<u8>, CodecError> {
    let batch = WireBatch {
        envelopes: envelopes.to_vec(),
    };
    Ok(rmp_serde::to_vec_named(&batch)?)
}

/// Decodes a wire payload back into envelopes.
///
/// # Errors
///
/// Returns `CodecError::Decode` if the payload is not a valid batch.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Envelope>, CodecError> {
    let batch: WireBatch = rmp_serde::from_slice(bytes)?;
    Ok(batch.envelopes)
}

/// Encodes a typed message into envelope payload bytes.
///
/// # Errors
///
/// Returns `CodecError::Encode` if `MsgPack` serialization fails.
pub fn encode_message<M: Message>(message: &M) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Decodes envelope payload bytes into a typed message.
///
/// # Errors
///
/// Returns `CodecError::Decode` if the payload does not match `M`.
pub fn decode_message<M: Message>(payload: &[u8]) -> Result<M, CodecError> {
    Ok(rmp_serde::from_slice(payload)?)
}

// ---------------------------------------------------------------------------
// OutgoingBatch
// ---------------------------------------------------------------------------

/// A destination plus the envelopes headed there, with the wire payload
/// computed once at construction.
///
/// Immutable after construction: the sender task transmits `data` as-is.
/// A ping batch carries no application envelopes and an empty payload;
/// the transport frames it as a reserved zero-length frame. A real batch
/// always holds at least one envelope, so its payload is never empty and
/// the two cannot be confused on the wire.
#[derive(Debug, Clone)]
pub struct OutgoingBatch {
    destination: Address,
    envelopes: Vec<Envelope>,
    data: Vec<u8>,
    is_ping: bool,
}

impl OutgoingBatch {
    /// Builds a batch, stamping `destination` on every envelope and
    /// serializing the payload once.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::EmptyBatch` for an empty envelope list and
    /// `CodecError::Encode` if serialization fails.
    pub fn new(destination: Address, mut envelopes: Vec<Envelope>) -> Result<Self, CodecError> {
        if envelopes.is_empty() {
            return Err(CodecError::EmptyBatch(destination));
        }
        for envelope in &mut envelopes {
            envelope.destination = Some(destination.clone());
        }
        let data = encode_batch(&envelopes)?;
        Ok(Self {
            destination,
            envelopes,
            data,
            is_ping: false,
        })
    }

    /// Builds the liveness-probe batch for a destination.
    #[must_use]
    pub fn for_ping(destination: Address) -> Self {
        Self {
            destination,
            envelopes: Vec::new(),
            data: Vec::new(),
            is_ping: true,
        }
    }

    /// The batch's destination.
    #[must_use]
    pub fn destination(&self) -> &Address {
        &self.destination
    }

    /// The envelopes in transmission order.
    #[must_use]
    pub fn envelopes(&self) -> &[Envelope] {
        &self.envelopes
    }

    /// Consumes the batch, returning its envelopes.
    #[must_use]
    pub fn into_envelopes(self) -> Vec<Envelope> {
        self.envelopes
    }

    /// The serialized wire payload.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether this batch is a liveness probe.
    #[must_use]
    pub fn is_ping(&self) -> bool {
        self.is_ping
    }
}

impl std::fmt::Display for OutgoingBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "outgoing batch to {} with {} messages",
            self.destination,
            self.envelopes.len()
        )
    }
}
