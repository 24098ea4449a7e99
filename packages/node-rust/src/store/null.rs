//! No-op [`DurabilityStore`] for non-durable deployments.
//!
//! Trades crash-safety for simplicity: nothing is journaled, so a crash
//! loses in-flight work. Selecting this store is an explicit configuration
//! decision; `is_durable()` reports `false` and startup logs the choice.

use async_trait::async_trait;
use courier_core::{Envelope, EnvelopeStatus};
use uuid::Uuid;

use super::DurabilityStore;

/// Envelope store that journals nothing.
///
/// All writes succeed immediately without side effects; transitions
/// always report applied so the runtime's flow control is unaffected.
#[derive(Debug, Default)]
pub struct NullEnvelopeStore;

impl NullEnvelopeStore {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DurabilityStore for NullEnvelopeStore {
    async fn persist(&self, _envelope: &Envelope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update_status(&self, _id: Uuid, _status: EnvelopeStatus) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn mark_complete(&self, _id: Uuid) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn mark_failed(&self, _id: Uuid, _error: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn load_outstanding(&self) -> anyhow::Result<Vec<Envelope>> {
        Ok(Vec::new())
    }

    async fn get(&self, _id: Uuid) -> anyhow::Result<Option<Envelope>> {
        Ok(None)
    }

    async fn failure_reason(&self, _id: Uuid) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    fn is_durable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_succeed_and_reads_are_empty() {
        let store = NullEnvelopeStore::new();
        let envelope = Envelope::new("Message1", Vec::new());

        store.persist(&envelope).await.unwrap();
        assert!(store.mark_complete(envelope.id).await.unwrap());
        assert!(store.mark_failed(envelope.id, "boom").await.unwrap());

        assert!(store.get(envelope.id).await.unwrap().is_none());
        assert!(store.failure_reason(envelope.id).await.unwrap().is_none());
        assert!(store.load_outstanding().await.unwrap().is_empty());
    }

    #[test]
    fn reports_not_durable() {
        assert!(!NullEnvelopeStore::new().is_durable());
    }
}
