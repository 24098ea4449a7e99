//! Durable envelope journal.
//!
//! The store persists an envelope's identity, payload, and status across
//! the Created-to-terminal lifecycle, for both the outbox (outgoing) and
//! inbox (incoming) flows. On restart, `load_outstanding` resumes
//! in-flight work. Status transitions are linearizable per envelope id:
//! exactly one terminal status ever wins, no matter how many workers race.

use async_trait::async_trait;
use courier_core::{Envelope, EnvelopeStatus};
use uuid::Uuid;

mod memory;
mod null;

pub use memory::InMemoryEnvelopeStore;
pub use null::NullEnvelopeStore;

/// Persisted journal of envelopes and their status.
///
/// Used as `Arc<dyn DurabilityStore>`, shared by workers, the scheduler,
/// and the transport senders. Every status-changing method returns whether
/// the transition was applied; a transition on an envelope that already
/// reached a terminal status returns `Ok(false)` and changes nothing.
#[async_trait]
pub trait DurabilityStore: Send + Sync + 'static {
    /// Inserts or updates an envelope's full state.
    ///
    /// A terminal envelope is never overwritten; the call is a no-op then.
    async fn persist(&self, envelope: &Envelope) -> anyhow::Result<()>;

    /// Transitions an envelope to `status`.
    ///
    /// Returns `Ok(false)` if the envelope is unknown or already terminal.
    async fn update_status(&self, id: Uuid, status: EnvelopeStatus) -> anyhow::Result<bool>;

    /// Marks an envelope `Completed`.
    async fn mark_complete(&self, id: Uuid) -> anyhow::Result<bool>;

    /// Marks an envelope `Failed`, recording the error for later
    /// classification and operator inspection.
    async fn mark_failed(&self, id: Uuid, error: &str) -> anyhow::Result<bool>;

    /// Loads every non-terminal envelope, for recovery at startup.
    async fn load_outstanding(&self) -> anyhow::Result<Vec<Envelope>>;

    /// Returns the stored envelope, if known.
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Envelope>>;

    /// Returns the last recorded failure for an envelope, if any.
    async fn failure_reason(&self, id: Uuid) -> anyhow::Result<Option<String>>;

    /// Whether this store actually journals envelopes.
    ///
    /// `false` only for the explicit no-op store; deployments choose that
    /// trade consciously, never by accident.
    fn is_durable(&self) -> bool;
}
