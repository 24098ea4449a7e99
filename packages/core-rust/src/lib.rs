//! Courier Core — envelope model, wire codec, addresses, message-type rules,
//! and capability manifests.

pub mod address;
pub mod capabilities;
pub mod codec;
pub mod envelope;
pub mod rules;

pub use address::{Address, AddressError};
pub use capabilities::{CapabilityError, ServiceCapabilities};
pub use codec::{
    decode_batch, decode_message, encode_batch, encode_message, CodecError, Message, OutgoingBatch,
};
pub use envelope::{
    now_ms, Envelope, EnvelopeStatus, Headers, DEFAULT_MAX_ATTEMPTS, PING_MESSAGE_TYPE,
};
pub use rules::{MessageTypeRule, MessageTypeRules, RulePhase};
