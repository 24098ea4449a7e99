//! Typed failure taxonomy for the runtime.
//!
//! These variants classify how an envelope failed, which the error policy
//! and operators both care about. Handler errors themselves stay
//! `anyhow::Error`; this enum covers the runtime's own failure modes.

use courier_core::{Address, CodecError};
use thiserror::Error;
use uuid::Uuid;

/// Runtime failure classification.
#[derive(Debug, Error)]
pub enum CourierError {
    /// No handler is registered for the message type. Reported and
    /// dead-lettered; distinct from a poison message because no attempt
    /// was made.
    #[error("no handler registered for message type '{0}'")]
    NoHandlerFor(String),

    /// The payload could not be decoded or its type resolved locally.
    /// Dead-lettered immediately; retrying cannot fix a decode failure.
    #[error("serialization failure: {0}")]
    Serialization(#[from] CodecError),

    /// A destination stayed unreachable past the reconnect budget.
    #[error("destination {destination} unreachable after {attempts} attempts: {reason}")]
    TransportFailure {
        destination: Address,
        attempts: u32,
        reason: String,
    },

    /// The delivery window closed before execution began.
    #[error("delivery window expired for envelope {0}")]
    Expired(Uuid),

    /// Capability validation mismatches, fatal only when configured so.
    #[error("capability validation failed: {0:?}")]
    Validation(Vec<String>),

    /// Lifecycle misuse, e.g. a second `start()`.
    #[error("{0}")]
    Lifecycle(String),
}

impl CourierError {
    /// Whether retrying could ever succeed for this failure.
    ///
    /// Serialization and expiry failures are permanent: the bytes will not
    /// decode differently tomorrow and a closed window stays closed.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Serialization(_) | Self::Expired(_) | Self::NoHandlerFor(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_failures_are_flagged() {
        assert!(CourierError::NoHandlerFor("Message1".to_string()).is_permanent());
        assert!(CourierError::Expired(Uuid::new_v4()).is_permanent());
        assert!(!CourierError::TransportFailure {
            destination: Address::tcp("localhost", 2201),
            attempts: 3,
            reason: "connection refused".to_string(),
        }
        .is_permanent());
    }

    #[test]
    fn transport_failure_message_names_destination() {
        let err = CourierError::TransportFailure {
            destination: Address::tcp("localhost", 2201),
            attempts: 3,
            reason: "connection refused".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("tcp://localhost:2201"));
        assert!(text.contains("3 attempts"));
    }

    #[test]
    fn downcasts_through_anyhow() {
        let err: anyhow::Error = CourierError::NoHandlerFor("Message1".to_string()).into();
        assert!(err.is::<CourierError>());
    }
}
