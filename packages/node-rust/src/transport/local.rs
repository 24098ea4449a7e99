//! In-process delivery for `local://` destinations.
//!
//! Bypasses sockets entirely: envelopes are journaled and fed straight
//! into the local worker queue, in batch order.

use std::sync::Arc;

use courier_core::{EnvelopeStatus, OutgoingBatch};
use tokio::sync::mpsc;

use crate::store::DurabilityStore;

/// Delivers a batch addressed to a local queue.
///
/// # Errors
///
/// Fails when the store rejects the journal write or the worker queue has
/// shut down.
pub(crate) async fn deliver(
    store: &Arc<dyn DurabilityStore>,
    dispatch_tx: &mpsc::Sender<courier_core::Envelope>,
    batch: OutgoingBatch,
) -> anyhow::Result<()> {
    for mut envelope in batch.into_envelopes() {
        envelope.status = EnvelopeStatus::Queued;
        store.persist(&envelope).await?;
        dispatch_tx
            .send(envelope)
            .await
            .map_err(|_| anyhow::anyhow!("worker queue closed"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use courier_core::{Address, Envelope};

    use super::*;
    use crate::store::InMemoryEnvelopeStore;

    #[tokio::test]
    async fn delivers_in_batch_order_and_journals() {
        let store: Arc<dyn DurabilityStore> = Arc::new(InMemoryEnvelopeStore::new());
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(16);

        let first = Envelope::new("Message1", Vec::new());
        let second = Envelope::new("Message2", Vec::new());
        let batch = OutgoingBatch::new(
            Address::local("replies"),
            vec![first.clone(), second.clone()],
        )
        .unwrap();

        deliver(&store, &dispatch_tx, batch).await.unwrap();

        let a = dispatch_rx.recv().await.unwrap();
        let b = dispatch_rx.recv().await.unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
        assert_eq!(a.status, EnvelopeStatus::Queued);
        assert!(store.get(first.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn closed_queue_is_an_error() {
        let store: Arc<dyn DurabilityStore> = Arc::new(InMemoryEnvelopeStore::new());
        let (dispatch_tx, dispatch_rx) = mpsc::channel(16);
        drop(dispatch_rx);

        let batch = OutgoingBatch::new(
            Address::local("replies"),
            vec![Envelope::new("Message1", Vec::new())],
        )
        .unwrap();

        assert!(deliver(&store, &dispatch_tx, batch).await.is_err());
    }
}
