//! Outbound delivery: one dedicated sender per destination.
//!
//! Each TCP destination gets exactly one connection, owned by a dedicated
//! task; batches queued for that destination transmit in enqueue order.
//! No ordering exists across destinations, and a failure on one
//! destination never blocks another. On send failure the sender reconnects
//! with jittered exponential backoff; once the consecutive-failure budget
//! is spent, the batch's envelopes are handed back for failure
//! classification. An idle connection is probed with a ping frame.

use std::sync::Arc;

use bytes::Bytes;
use courier_core::{Address, Envelope, OutgoingBatch};
use dashmap::DashMap;
use futures_util::SinkExt;
use rand::Rng;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::config::TransportConfig;
use crate::store::DurabilityStore;
use crate::transport::{framing, local};

/// An envelope whose transmission exhausted the reconnect budget.
///
/// The node's failure loop marks these `Failed` in the store and runs them
/// through the error policy as transport failures.
pub(crate) struct FailedDelivery {
    pub(crate) envelope: Envelope,
    pub(crate) destination: Address,
    pub(crate) attempts: u32,
    pub(crate) reason: String,
}

/// Registry of per-destination sender tasks.
///
/// Senders spawn lazily on the first batch for a destination and exit on
/// shutdown. Local destinations bypass the registry and feed the worker
/// queue directly.
pub(crate) struct SenderRegistry {
    config: TransportConfig,
    store: Arc<dyn DurabilityStore>,
    dispatch_tx: mpsc::Sender<Envelope>,
    failure_tx: mpsc::UnboundedSender<FailedDelivery>,
    shutdown: watch::Receiver<bool>,
    senders: DashMap<Address, mpsc::Sender<OutgoingBatch>>,
}

impl SenderRegistry {
    pub(crate) fn new(
        config: TransportConfig,
        store: Arc<dyn DurabilityStore>,
        dispatch_tx: mpsc::Sender<Envelope>,
        failure_tx: mpsc::UnboundedSender<FailedDelivery>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            dispatch_tx,
            failure_tx,
            shutdown,
            senders: DashMap::new(),
        }
    }

    /// Queues a batch for its destination, spawning the sender on first use.
    ///
    /// # Errors
    ///
    /// Fails when the destination's queue is gone (shutdown) or, for local
    /// destinations, when the worker queue rejects the delivery.
    pub(crate) async fn send(&self, batch: OutgoingBatch) -> anyhow::Result<()> {
        if batch.destination().is_local() {
            return local::deliver(&self.store, &self.dispatch_tx, batch).await;
        }

        let destination = batch.destination().clone();
        let tx = self.sender_for(&destination);
        if let Err(rejected) = tx.send(batch).await {
            // The task may have exited after an earlier shutdown signal
            // raced this send; try one fresh sender before giving up.
            self.senders.remove(&destination);
            let tx = self.sender_for(&destination);
            tx.send(rejected.0)
                .await
                .map_err(|_| anyhow::anyhow!("sender for {destination} is not accepting batches"))?;
        }
        Ok(())
    }

    /// Number of live destination senders.
    #[cfg(test)]
    pub(crate) fn sender_count(&self) -> usize {
        self.senders.len()
    }

    fn sender_for(&self, destination: &Address) -> mpsc::Sender<OutgoingBatch> {
        // Entry locking makes spawn-on-first-use atomic: exactly one task
        // ever owns a destination's connection.
        self.senders
            .entry(destination.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.config.outbound_channel_capacity);
                let sender = DestinationSender {
                    destination: destination.clone(),
                    config: self.config.clone(),
                    store: Arc::clone(&self.store),
                    failure_tx: self.failure_tx.clone(),
                    shutdown: self.shutdown.clone(),
                };
                tokio::spawn(sender.run(rx));
                tx
            })
            .clone()
    }
}

/// Owns the single outbound connection to one destination.
struct DestinationSender {
    destination: Address,
    config: TransportConfig,
    store: Arc<dyn DurabilityStore>,
    failure_tx: mpsc::UnboundedSender<FailedDelivery>,
    shutdown: watch::Receiver<bool>,
}

type Connection = Framed<TcpStream, LengthDelimitedCodec>;

impl DestinationSender {
    async fn run(mut self, mut rx: mpsc::Receiver<OutgoingBatch>) {
        let mut connection: Option<Connection> = None;
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                batch = rx.recv() => {
                    let Some(batch) = batch else { break };
                    self.transmit(&mut connection, batch).await;
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(self.config.ping_interval) => {
                    self.keep_alive(&mut connection).await;
                }
            }
        }
        tracing::debug!(destination = %self.destination, "destination sender stopped");
    }

    /// Transmits one batch, reconnecting with backoff on failure.
    async fn transmit(&mut self, connection: &mut Option<Connection>, batch: OutgoingBatch) {
        let mut failures = 0_u32;
        loop {
            match self.try_send(connection, &batch).await {
                Ok(()) => {
                    metrics::counter!("courier_batches_sent_total").increment(1);
                    if !batch.is_ping() {
                        self.complete(&batch).await;
                    }
                    return;
                }
                Err(error) => {
                    *connection = None;
                    failures += 1;
                    if failures >= self.config.max_connection_retries {
                        self.give_up(batch, failures, &error);
                        return;
                    }
                    let delay = self.backoff_delay(failures);
                    tracing::warn!(
                        destination = %self.destination,
                        failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "send failed, reconnecting"
                    );
                    tokio::select! {
                        _ = self.shutdown.changed() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn try_send(
        &self,
        connection: &mut Option<Connection>,
        batch: &OutgoingBatch,
    ) -> anyhow::Result<()> {
        if connection.is_none() {
            let addr = self
                .destination
                .socket_addr()
                .ok_or_else(|| anyhow::anyhow!("{} is not a tcp destination", self.destination))?;
            let stream = TcpStream::connect(&addr).await?;
            tracing::debug!(destination = %self.destination, "connected");
            *connection = Some(Framed::new(
                stream,
                framing::wire_codec(self.config.max_frame_bytes),
            ));
        }
        if let Some(framed) = connection.as_mut() {
            framed.send(Bytes::copy_from_slice(batch.data())).await?;
        }
        Ok(())
    }

    /// Completes the outbox entries for a transmitted batch.
    async fn complete(&self, batch: &OutgoingBatch) {
        for envelope in batch.envelopes() {
            if let Err(error) = self.store.mark_complete(envelope.id).await {
                tracing::warn!(
                    envelope = %envelope.id,
                    error = %error,
                    "failed to complete transmitted envelope"
                );
            }
        }
    }

    /// Hands a batch back for failure classification after the reconnect
    /// budget is spent.
    fn give_up(&self, batch: OutgoingBatch, attempts: u32, error: &anyhow::Error) {
        metrics::counter!("courier_transport_failures_total").increment(1);
        tracing::error!(
            destination = %self.destination,
            attempts,
            error = %error,
            "destination unreachable, returning batch for classification"
        );
        for envelope in batch.into_envelopes() {
            let _ = self.failure_tx.send(FailedDelivery {
                envelope,
                destination: self.destination.clone(),
                attempts,
                reason: error.to_string(),
            });
        }
    }

    async fn keep_alive(&mut self, connection: &mut Option<Connection>) {
        let Some(framed) = connection.as_mut() else {
            return;
        };
        tracing::trace!(destination = %self.destination, "idle, sending ping");
        if framed.send(Bytes::new()).await.is_err() {
            tracing::debug!(destination = %self.destination, "ping failed, dropping connection");
            *connection = None;
        }
    }

    fn backoff_delay(&self, failures: u32) -> Duration {
        let doubled = self
            .config
            .reconnect_initial_backoff
            .saturating_mul(2_u32.saturating_pow(failures.saturating_sub(1)));
        let capped = doubled.min(self.config.reconnect_max_backoff);
        capped.mul_f64(rand::rng().random_range(0.5..1.5))
    }
}
