//! Message context: one logical unit of work, with a transactional outbox.
//!
//! Before a transaction is enlisted, sends route immediately (journal +
//! transport). After [`MessageContext::enlist`], sends buffer in the
//! `outstanding` list and only move on [`MessageContext::commit`];
//! [`MessageContext::rollback`] discards them unsent. That is the
//! at-least-once guarantee: an envelope is recorded atomically with the
//! unit of work that produced it, so "effect committed but message lost"
//! cannot happen.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{
    encode_message, Address, Envelope, EnvelopeStatus, Message, OutgoingBatch, now_ms,
};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::node::RuntimeInner;
use crate::store::DurabilityStore;

/// The application's unit of work, as seen by the outbox.
///
/// `persist` is called once at commit time with every buffered envelope,
/// before any of them reach the transport, so implementations can record
/// them atomically with the application's own state changes.
#[async_trait]
pub trait EnvelopeTransaction: Send + Sync {
    async fn persist(&self, envelopes: &[Envelope]) -> anyhow::Result<()>;
}

/// Transaction that records committed envelopes in memory.
///
/// For tests and non-durable deployments.
#[derive(Debug, Default)]
pub struct InMemoryEnvelopeTransaction {
    persisted: Mutex<Vec<Envelope>>,
}

impl InMemoryEnvelopeTransaction {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Envelopes persisted through this transaction so far.
    #[must_use]
    pub fn persisted(&self) -> Vec<Envelope> {
        self.persisted.lock().clone()
    }
}

#[async_trait]
impl EnvelopeTransaction for InMemoryEnvelopeTransaction {
    async fn persist(&self, envelopes: &[Envelope]) -> anyhow::Result<()> {
        self.persisted.lock().extend_from_slice(envelopes);
        Ok(())
    }
}

/// Send surface for one unit of work.
///
/// Handlers receive one per inbound envelope (cascading sends inherit the
/// inbound correlation id); ad-hoc contexts come from
/// [`CourierNode::context`](crate::node::CourierNode::context).
pub struct MessageContext {
    runtime: Arc<RuntimeInner>,
    correlation_id: Option<Uuid>,
    transaction: Option<Arc<dyn EnvelopeTransaction>>,
    outstanding: Vec<Envelope>,
}

impl MessageContext {
    pub(crate) fn new(runtime: Arc<RuntimeInner>) -> Self {
        Self {
            runtime,
            correlation_id: None,
            transaction: None,
            outstanding: Vec::new(),
        }
    }

    /// Context for processing one inbound envelope.
    ///
    /// Sends made here continue the inbound envelope's causal chain.
    pub(crate) fn for_envelope(runtime: Arc<RuntimeInner>, inbound: &Envelope) -> Self {
        Self {
            runtime,
            correlation_id: inbound.correlation_id.or(Some(inbound.id)),
            transaction: None,
            outstanding: Vec::new(),
        }
    }

    /// Sends a message to a destination.
    ///
    /// Builds the envelope (payload encoding, message-type rules, source
    /// and correlation stamping), then either routes it immediately or,
    /// once a transaction is enlisted, buffers it until commit. Returns
    /// the envelope id.
    ///
    /// # Errors
    ///
    /// Fails on payload encoding or, when routing immediately, on journal
    /// or transport handoff failure.
    pub async fn send<M: Message>(
        &mut self,
        destination: Address,
        message: &M,
    ) -> anyhow::Result<Uuid> {
        let envelope = self.build_envelope(message, Some(destination))?;
        self.stage(envelope).await
    }

    /// Sends a message for in-process handling, with no destination.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`send`](MessageContext::send).
    pub async fn send_local<M: Message>(&mut self, message: &M) -> anyhow::Result<Uuid> {
        let envelope = self.build_envelope(message, None)?;
        self.stage(envelope).await
    }

    /// Publishes a message, routing by the node's publish rules.
    ///
    /// A rule with a fixed destination wins; otherwise a local
    /// subscription handles the type in-process. With no route at all the
    /// message is dropped with a warning and `Ok(None)` is returned.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`send`](MessageContext::send).
    pub async fn publish<M: Message>(&mut self, message: &M) -> anyhow::Result<Option<Uuid>> {
        let destination = self
            .runtime
            .config
            .publish_rules
            .iter()
            .find(|rule| rule.message_type == M::NAME)
            .and_then(|rule| rule.destination.clone());

        if let Some(destination) = destination {
            return Ok(Some(self.send(destination, message).await?));
        }

        let subscribed_locally = self
            .runtime
            .config
            .subscriptions
            .iter()
            .any(|subscription| subscription.message_type == M::NAME);
        if subscribed_locally {
            return Ok(Some(self.send_local(message).await?));
        }

        tracing::warn!(message_type = M::NAME, "no known subscriber, message dropped");
        Ok(None)
    }

    /// Enlists this context in a transaction.
    ///
    /// From here on, sends buffer in `outstanding` until commit.
    pub fn enlist(&mut self, transaction: Arc<dyn EnvelopeTransaction>) {
        self.transaction = Some(transaction);
    }

    /// Whether a transaction is enlisted.
    #[must_use]
    pub fn is_enlisted(&self) -> bool {
        self.transaction.is_some()
    }

    /// Envelopes buffered since enlistment, in send order.
    #[must_use]
    pub fn outstanding(&self) -> &[Envelope] {
        &self.outstanding
    }

    /// Commits the unit of work: persists buffered envelopes through the
    /// transaction, then routes them.
    ///
    /// # Errors
    ///
    /// Fails when the transaction's persist fails (nothing is routed
    /// then) or when routing an envelope fails.
    pub async fn commit(&mut self) -> anyhow::Result<()> {
        let Some(transaction) = self.transaction.take() else {
            return Ok(());
        };
        let outstanding = std::mem::take(&mut self.outstanding);

        transaction.persist(&outstanding).await?;
        for envelope in outstanding {
            self.route_now(envelope).await?;
        }
        Ok(())
    }

    /// Rolls the unit of work back: buffered envelopes are discarded and
    /// never transmitted.
    pub fn rollback(&mut self) {
        let discarded = self.outstanding.len();
        self.outstanding.clear();
        self.transaction = None;
        if discarded > 0 {
            tracing::debug!(discarded, "rolled back outstanding envelopes");
        }
    }

    fn build_envelope<M: Message>(
        &self,
        message: &M,
        destination: Option<Address>,
    ) -> anyhow::Result<Envelope> {
        let payload = encode_message(message)?;
        let mut envelope = Envelope::new(M::NAME, payload);
        envelope.max_attempts = self.runtime.config.default_max_attempts;
        envelope.source = Some(self.runtime.config.node_id.clone());
        envelope.destination = destination;
        envelope.correlation_id = Some(self.correlation_id.unwrap_or(envelope.id));

        self.runtime.rules.read().apply(&mut envelope);
        Ok(envelope)
    }

    async fn stage(&mut self, envelope: Envelope) -> anyhow::Result<Uuid> {
        let id = envelope.id;
        if self.transaction.is_some() {
            self.outstanding.push(envelope);
        } else {
            self.route_now(envelope).await?;
        }
        Ok(id)
    }

    /// Routes one envelope: journal, then transport or local queue.
    async fn route_now(&self, mut envelope: Envelope) -> anyhow::Result<()> {
        // Delivery-window check before transmission; an envelope born
        // expired never reaches the wire.
        if envelope.is_expired(now_ms()) {
            envelope.status = EnvelopeStatus::DeadLettered;
            self.runtime.store.persist(&envelope).await?;
            self.runtime.events.discarded_expired(&envelope);
            return Ok(());
        }

        match envelope.destination.clone() {
            Some(destination) if !self.runtime.is_local_destination(&destination) => {
                envelope.status = EnvelopeStatus::InTransit;
                self.runtime.store.persist(&envelope).await?;
                let batch = OutgoingBatch::new(destination, vec![envelope])?;
                self.runtime.senders.send(batch).await
            }
            _ => {
                envelope.status = EnvelopeStatus::Queued;
                self.runtime.store.persist(&envelope).await?;
                self.runtime
                    .dispatch_tx
                    .send(envelope)
                    .await
                    .map_err(|_| anyhow::anyhow!("worker queue closed"))
            }
        }
    }
}
