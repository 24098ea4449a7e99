//! Worker queue: bounded-concurrency envelope dispatch.
//!
//! One receive loop pulls envelopes off the dispatch channel; a semaphore
//! bounds how many handler executions run at once, each in its own task.
//! One envelope's failure never aborts sibling executions. The dispatch
//! loop also routes: envelopes addressed elsewhere (a requeued outbound
//! envelope, a scheduled retry of a remote send) go back to the transport
//! instead of a local handler.

use std::sync::Arc;

use courier_core::{now_ms, CodecError, Envelope, EnvelopeStatus, OutgoingBatch};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::context::MessageContext;
use crate::error::CourierError;
use crate::node::RuntimeInner;
use crate::policy::ErrorAction;
use crate::store::DurabilityStore;
use crate::transport::FailedDelivery;

/// Spawns the dispatch loop feeding the bounded worker pool.
pub(crate) fn spawn_dispatch_loop(
    runtime: Arc<RuntimeInner>,
    mut rx: mpsc::Receiver<Envelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let permits = Arc::new(Semaphore::new(runtime.config.effective_worker_count()));
        let mut shutdown = runtime.shutdown.subscribe();
        loop {
            let envelope = tokio::select! {
                _ = shutdown.changed() => break,
                envelope = rx.recv() => envelope,
            };
            let Some(envelope) = envelope else { break };

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                let _permit = permit;
                let _guard = runtime.shutdown.execution_guard();
                execute(&runtime, envelope).await;
            });
        }
        tracing::debug!("dispatch loop stopped");
    })
}

/// Runs one envelope to an outcome.
async fn execute(runtime: &Arc<RuntimeInner>, mut envelope: Envelope) {
    if envelope.is_terminal() {
        tracing::error!(envelope = %envelope.id, "terminal envelope reached the worker queue");
        return;
    }

    // Envelopes addressed to another node are transmissions, not local
    // executions.
    if let Some(destination) = envelope.destination.clone() {
        if !runtime.is_local_destination(&destination) {
            forward(runtime, envelope, destination).await;
            return;
        }
    }

    // Delivery-window check before execution: expired envelopes dead-letter
    // with no handler invoked and no error recorded.
    if envelope.is_expired(now_ms()) {
        metrics::counter!("courier_messages_expired_total").increment(1);
        let _ = runtime
            .store
            .update_status(envelope.id, EnvelopeStatus::DeadLettered)
            .await;
        runtime.events.discarded_expired(&envelope);
        return;
    }

    let Some(invoker) = runtime.handlers.resolve(&envelope.message_type) else {
        let reason = CourierError::NoHandlerFor(envelope.message_type.clone()).to_string();
        runtime.events.no_handler_for(&envelope);
        let _ = runtime.store.mark_failed(envelope.id, &reason).await;
        let _ = runtime
            .store
            .update_status(envelope.id, EnvelopeStatus::DeadLettered)
            .await;
        runtime.events.moved_to_error_queue(&envelope, &reason);
        return;
    };

    envelope.status = EnvelopeStatus::Executing;
    let _ = runtime
        .store
        .update_status(envelope.id, EnvelopeStatus::Executing)
        .await;
    runtime.events.execution_started(&envelope);

    let context = MessageContext::for_envelope(Arc::clone(runtime), &envelope);
    let result = invoker(envelope.clone(), context).await;

    runtime.events.execution_finished(&envelope);

    match result {
        Ok(()) => {
            metrics::counter!("courier_messages_completed_total").increment(1);
            let _ = runtime.store.mark_complete(envelope.id).await;
            envelope.status = EnvelopeStatus::Completed;
            runtime.events.message_succeeded(&envelope);
        }
        Err(error) => {
            metrics::counter!("courier_messages_failed_total").increment(1);
            runtime.events.message_failed(&envelope, &error);
            handle_failure(runtime, envelope, &error).await;
        }
    }
}

/// Hands an outbound envelope back to its destination sender.
async fn forward(runtime: &Arc<RuntimeInner>, mut envelope: Envelope, destination: courier_core::Address) {
    if envelope.is_expired(now_ms()) {
        let _ = runtime
            .store
            .update_status(envelope.id, EnvelopeStatus::DeadLettered)
            .await;
        runtime.events.discarded_expired(&envelope);
        return;
    }
    envelope.status = EnvelopeStatus::InTransit;
    let _ = runtime
        .store
        .update_status(envelope.id, EnvelopeStatus::InTransit)
        .await;
    match OutgoingBatch::new(destination, vec![envelope]) {
        Ok(batch) => {
            if let Err(error) = runtime.senders.send(batch).await {
                tracing::warn!(error = %error, "failed to hand envelope to transport");
            }
        }
        Err(error) => tracing::error!(error = %error, "failed to rebuild outgoing batch"),
    }
}

/// Applies the error policy to a failed envelope.
///
/// Serialization failures skip the policy entirely: retrying cannot fix a
/// payload that does not decode, so they dead-letter immediately.
pub(crate) async fn handle_failure(
    runtime: &Arc<RuntimeInner>,
    mut envelope: Envelope,
    error: &anyhow::Error,
) {
    if matches!(
        error.downcast_ref::<CourierError>(),
        Some(CourierError::Serialization(_))
    ) || error.is::<CodecError>()
    {
        let reason = error.to_string();
        let _ = runtime.store.mark_failed(envelope.id, &reason).await;
        let _ = runtime
            .store
            .update_status(envelope.id, EnvelopeStatus::DeadLettered)
            .await;
        metrics::counter!("courier_messages_dead_lettered_total").increment(1);
        runtime.events.moved_to_error_queue(&envelope, &reason);
        return;
    }

    let action = runtime.policy.decide(error, &envelope);
    match action {
        ErrorAction::Requeue => {
            let reason = error.to_string();
            let _ = runtime.store.mark_failed(envelope.id, &reason).await;
            envelope.attempts += 1;
            envelope.status = EnvelopeStatus::Queued;
            let _ = runtime.store.persist(&envelope).await;
            if runtime.dispatch_tx.send(envelope).await.is_err() {
                tracing::warn!("worker queue closed, requeued envelope stays in the store");
            }
        }
        ErrorAction::RetryAfter(delay) => {
            let reason = error.to_string();
            let _ = runtime.store.mark_failed(envelope.id, &reason).await;
            envelope.attempts += 1;
            envelope.schedule_after(delay);
            let _ = runtime.store.persist(&envelope).await;
            runtime.scheduler.enqueue(envelope);
        }
        ErrorAction::MoveToErrorQueue => {
            let reason = error.to_string();
            let _ = runtime.store.mark_failed(envelope.id, &reason).await;
            let _ = runtime
                .store
                .update_status(envelope.id, EnvelopeStatus::DeadLettered)
                .await;
            metrics::counter!("courier_messages_dead_lettered_total").increment(1);
            runtime.events.moved_to_error_queue(&envelope, &reason);
        }
        ErrorAction::Discard => {
            // Terminal with no persisted failure record.
            let _ = runtime
                .store
                .update_status(envelope.id, EnvelopeStatus::DeadLettered)
                .await;
            tracing::debug!(envelope = %envelope.id, "discarded by error policy");
        }
    }
}

/// Drains transport failures back through the error policy.
pub(crate) fn spawn_failure_loop(
    runtime: Arc<RuntimeInner>,
    mut rx: mpsc::UnboundedReceiver<FailedDelivery>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = runtime.shutdown.subscribe();
        loop {
            let failed = tokio::select! {
                _ = shutdown.changed() => break,
                failed = rx.recv() => failed,
            };
            let Some(failed) = failed else { break };

            let error: anyhow::Error = CourierError::TransportFailure {
                destination: failed.destination,
                attempts: failed.attempts,
                reason: failed.reason,
            }
            .into();
            handle_failure(&runtime, failed.envelope, &error).await;
        }
    })
}
