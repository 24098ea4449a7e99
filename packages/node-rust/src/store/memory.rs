//! In-memory [`DurabilityStore`] backed by a `DashMap`.
//!
//! `DashMap`'s per-entry locking serializes concurrent transitions on the
//! same envelope id, so two workers racing to complete and fail the same
//! envelope resolve to exactly one terminal status.

use async_trait::async_trait;
use courier_core::{Envelope, EnvelopeStatus};
use dashmap::DashMap;
use uuid::Uuid;

use super::DurabilityStore;

#[derive(Debug, Clone)]
struct StoredEnvelope {
    envelope: Envelope,
    last_error: Option<String>,
}

/// In-memory envelope journal.
///
/// Journals within the process lifetime: restart recovery works across a
/// runtime stop/start in the same process, not across a crash. Use a
/// persistent implementation of the same trait when crash durability
/// matters.
#[derive(Debug, Default)]
pub struct InMemoryEnvelopeStore {
    envelopes: DashMap<Uuid, StoredEnvelope>,
}

impl InMemoryEnvelopeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of journaled envelopes, terminal included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    /// Whether the journal is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

#[async_trait]
impl DurabilityStore for InMemoryEnvelopeStore {
    async fn persist(&self, envelope: &Envelope) -> anyhow::Result<()> {
        match self.envelopes.entry(envelope.id) {
            dashmap::Entry::Occupied(mut entry) => {
                if entry.get().envelope.is_terminal() {
                    tracing::warn!(
                        envelope = %envelope.id,
                        "refusing to overwrite terminal envelope"
                    );
                    return Ok(());
                }
                entry.get_mut().envelope = envelope.clone();
            }
            dashmap::Entry::Vacant(entry) => {
                entry.insert(StoredEnvelope {
                    envelope: envelope.clone(),
                    last_error: None,
                });
            }
        }
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: EnvelopeStatus) -> anyhow::Result<bool> {
        let Some(mut entry) = self.envelopes.get_mut(&id) else {
            return Ok(false);
        };
        if entry.envelope.is_terminal() {
            return Ok(false);
        }
        entry.envelope.status = status;
        Ok(true)
    }

    async fn mark_complete(&self, id: Uuid) -> anyhow::Result<bool> {
        self.update_status(id, EnvelopeStatus::Completed).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> anyhow::Result<bool> {
        let Some(mut entry) = self.envelopes.get_mut(&id) else {
            return Ok(false);
        };
        if entry.envelope.is_terminal() {
            return Ok(false);
        }
        entry.envelope.status = EnvelopeStatus::Failed;
        entry.last_error = Some(error.to_string());
        Ok(true)
    }

    async fn load_outstanding(&self) -> anyhow::Result<Vec<Envelope>> {
        Ok(self
            .envelopes
            .iter()
            .filter(|entry| !entry.envelope.is_terminal())
            .map(|entry| entry.envelope.clone())
            .collect())
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<Envelope>> {
        Ok(self.envelopes.get(&id).map(|entry| entry.envelope.clone()))
    }

    async fn failure_reason(&self, id: Uuid) -> anyhow::Result<Option<String>> {
        Ok(self
            .envelopes
            .get(&id)
            .and_then(|entry| entry.last_error.clone()))
    }

    fn is_durable(&self) -> bool {
        true
    }
}
