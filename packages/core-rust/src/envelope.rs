//! Envelope: the unit of transmission, retry, and persistence.
//!
//! An [`Envelope`] wraps one application message together with the routing,
//! retry, and scheduling metadata the runtime needs. The payload itself is
//! opaque to the runtime; only `message_type` is inspected, for handler
//! resolution and rule matching.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::address::Address;

/// Message type name carried by liveness-probe envelopes.
pub const PING_MESSAGE_TYPE: &str = "courier.ping";

/// Default retry ceiling applied when the sender does not override it.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Milliseconds since the Unix epoch.
///
/// All envelope timestamps (`deliver_by`, `scheduled_time`) use this scale
/// so they survive serialization without timezone or precision surprises.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// EnvelopeStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of an envelope.
///
/// Transitions: `Created -> Queued -> InTransit -> Executing ->
/// {Completed, Failed}`; a failed envelope moves to `Queued` (requeue),
/// `Scheduled` (retry later), or `DeadLettered` depending on the error
/// policy. `Completed` and `DeadLettered` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeStatus {
    Created,
    Scheduled,
    Queued,
    InTransit,
    Executing,
    Completed,
    Failed,
    DeadLettered,
}

impl EnvelopeStatus {
    /// Whether this status ends the envelope's lifecycle.
    ///
    /// A terminal envelope must never re-enter the worker queue.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::DeadLettered)
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Ordered string-to-string header map with last-write-wins semantics.
///
/// Insertion order is preserved on iteration and on the wire. `set` on an
/// existing key replaces the value in place, keeping the key's original
/// position, so rules that overwrite a header do not reorder it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    pairs: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a header, replacing any existing value for the key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((key, value)),
        }
    }

    /// Returns the value for a key, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterates pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// Serialized as a map (not a pair list) so the wire form reads naturally in
// MsgPack and JSON tooling. MsgPack maps keep entry order, so round-trips
// preserve insertion order.
impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.pairs.len()))?;
        for (k, v) in &self.pairs {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of string headers")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
                let mut headers = Headers::new();
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    headers.set(key, value);
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Wrapper around one message instance carrying routing, retry, and
/// scheduling metadata.
///
/// `id` is assigned once at creation and never reassigned. `attempts` only
/// increases. Terminal statuses (`Completed`, `DeadLettered`) are final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Globally unique identity, assigned at creation.
    pub id: Uuid,
    /// Logical type name used for routing and rule matching.
    pub message_type: String,
    /// Encoded application payload, opaque to the runtime.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Ordered string headers; last write wins per key.
    pub headers: Headers,
    /// Node id of the envelope's creator.
    pub source: Option<String>,
    /// Target address; `None` for purely local delivery.
    pub destination: Option<Address>,
    /// Current lifecycle status.
    pub status: EnvelopeStatus,
    /// Number of failed delivery attempts so far. Never decremented.
    pub attempts: u32,
    /// Ceiling after which further failures dead-letter the envelope.
    pub max_attempts: u32,
    /// Absolute deadline (ms since epoch); past it the envelope is
    /// discarded without invoking a handler. Checked both before
    /// transmission and before execution.
    pub deliver_by: Option<u64>,
    /// Absolute time (ms since epoch) before which the envelope must not
    /// be dispatched to a worker.
    pub scheduled_time: Option<u64>,
    /// Propagated across a causal chain of sends for tracing.
    pub correlation_id: Option<Uuid>,
}

impl Envelope {
    /// Creates a fresh envelope around an encoded payload.
    #[must_use]
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            payload,
            headers: Headers::new(),
            source: None,
            destination: None,
            status: EnvelopeStatus::Created,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            deliver_by: None,
            scheduled_time: None,
            correlation_id: None,
        }
    }

    /// Creates the envelope used for a liveness probe.
    ///
    /// Ping envelopes never reach a handler; the transport recognizes
    /// them and carries them as a reserved zero-payload frame.
    #[must_use]
    pub fn for_ping() -> Self {
        Self::new(PING_MESSAGE_TYPE, Vec::new())
    }

    /// Whether the envelope has reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `deliver_by` has passed at time `now` (ms since epoch).
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.deliver_by.is_some_and(|deadline| deadline < now)
    }

    /// Whether `scheduled_time` is still in the future at time `now`.
    #[must_use]
    pub fn is_deferred(&self, now: u64) -> bool {
        self.scheduled_time.is_some_and(|due| due > now)
    }

    /// Sets `deliver_by` to `window` from now.
    pub fn deliver_within(&mut self, window: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        let window_ms = window.as_millis() as u64;
        self.deliver_by = Some(now_ms() + window_ms);
    }

    /// Defers delivery until `delay` from now and marks the envelope
    /// `Scheduled`.
    pub fn schedule_after(&mut self, delay: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        let delay_ms = delay.as_millis() as u64;
        self.scheduled_time = Some(now_ms() + delay_ms);
        self.status = EnvelopeStatus::Scheduled;
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "envelope {} ({})", self.id, self.message_type)?;
        if let Some(destination) = &self.destination {
            write!(f, " -> {destination}")?;
        }
        Ok(())
    }
}
