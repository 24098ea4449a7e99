//! Message event observation.
//!
//! The dispatcher marks execution boundaries and terminal outcomes through
//! a [`MessageEventListener`] so external observers (logging, tracking,
//! metrics) can watch without being wired into the execution path. The
//! default listener logs through `tracing`; [`TrackingEventListener`]
//! records events for tests and diagnostics.

use std::sync::Arc;

use courier_core::Envelope;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Observer for envelope execution events.
///
/// One listener instance is shared by all workers; implementations must be
/// cheap and non-blocking. Used as `Arc<dyn MessageEventListener>`.
pub trait MessageEventListener: Send + Sync {
    /// A worker is about to invoke the handler for this envelope.
    fn execution_started(&self, envelope: &Envelope);

    /// The handler invocation returned, successfully or not.
    fn execution_finished(&self, envelope: &Envelope);

    /// The handler completed and the envelope was marked complete.
    fn message_succeeded(&self, envelope: &Envelope);

    /// The handler failed; the error policy decides what happens next.
    fn message_failed(&self, envelope: &Envelope, error: &anyhow::Error);

    /// No handler is registered for the envelope's message type.
    fn no_handler_for(&self, envelope: &Envelope);

    /// The envelope reached the error queue and will not be retried.
    fn moved_to_error_queue(&self, envelope: &Envelope, reason: &str);

    /// The envelope's delivery window expired before execution.
    fn discarded_expired(&self, envelope: &Envelope);
}

/// Default listener: structured logs through `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl MessageEventListener for TracingEventListener {
    fn execution_started(&self, envelope: &Envelope) {
        tracing::debug!(
            envelope = %envelope.id,
            message_type = %envelope.message_type,
            attempts = envelope.attempts,
            "execution started"
        );
    }

    fn execution_finished(&self, envelope: &Envelope) {
        tracing::debug!(envelope = %envelope.id, "execution finished");
    }

    fn message_succeeded(&self, envelope: &Envelope) {
        tracing::info!(
            envelope = %envelope.id,
            message_type = %envelope.message_type,
            "message handled"
        );
    }

    fn message_failed(&self, envelope: &Envelope, error: &anyhow::Error) {
        tracing::warn!(
            envelope = %envelope.id,
            message_type = %envelope.message_type,
            attempts = envelope.attempts,
            error = %error,
            "message handler failed"
        );
    }

    fn no_handler_for(&self, envelope: &Envelope) {
        tracing::error!(
            envelope = %envelope.id,
            message_type = %envelope.message_type,
            "no handler registered"
        );
    }

    fn moved_to_error_queue(&self, envelope: &Envelope, reason: &str) {
        tracing::error!(
            envelope = %envelope.id,
            message_type = %envelope.message_type,
            reason,
            "moved to error queue"
        );
    }

    fn discarded_expired(&self, envelope: &Envelope) {
        tracing::info!(
            envelope = %envelope.id,
            message_type = %envelope.message_type,
            "delivery window expired, discarded"
        );
    }
}

// ---------------------------------------------------------------------------
// TrackingEventListener
// ---------------------------------------------------------------------------

/// Recording listener used by tests and diagnostics.
///
/// Buffers every event and wakes waiters so a test can await "a handler
/// received a `Message1`" instead of sleeping.
#[derive(Default)]
pub struct TrackingEventListener {
    executed: Mutex<Vec<Envelope>>,
    succeeded: Mutex<Vec<Envelope>>,
    failed: Mutex<Vec<(Envelope, String)>>,
    dead_lettered: Mutex<Vec<(Envelope, String)>>,
    missing_handlers: Mutex<Vec<Envelope>>,
    expired: Mutex<Vec<Envelope>>,
    notify: Notify,
}

impl TrackingEventListener {
    /// Creates a shareable tracking listener.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Waits until a handler has started executing an envelope of the
    /// given type, returning it.
    ///
    /// Wrap in `tokio::time::timeout` to bound the wait.
    pub async fn wait_for(&self, message_type: &str) -> Envelope {
        loop {
            // Register the waiter before checking so an event landing in
            // between cannot be missed.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Some(envelope) = self.find_executed(message_type) {
                return envelope;
            }
            notified.await;
        }
    }

    /// Waits until an envelope of the given type reaches the error queue.
    pub async fn wait_for_dead_letter(&self, message_type: &str) -> (Envelope, String) {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            let found = self
                .dead_lettered
                .lock()
                .iter()
                .find(|(envelope, _)| envelope.message_type == message_type)
                .cloned();
            if let Some(entry) = found {
                return entry;
            }
            notified.await;
        }
    }

    /// Envelopes whose handler started, oldest first.
    #[must_use]
    pub fn executed(&self) -> Vec<Envelope> {
        self.executed.lock().clone()
    }

    /// Number of handler executions seen for a type.
    #[must_use]
    pub fn executed_count(&self, message_type: &str) -> usize {
        self.executed
            .lock()
            .iter()
            .filter(|envelope| envelope.message_type == message_type)
            .count()
    }

    /// Envelopes that completed successfully.
    #[must_use]
    pub fn succeeded(&self) -> Vec<Envelope> {
        self.succeeded.lock().clone()
    }

    /// Handler failures seen so far, with the error text.
    #[must_use]
    pub fn failures(&self) -> Vec<(Envelope, String)> {
        self.failed.lock().clone()
    }

    /// Envelopes that reached the error queue, with the recorded reason.
    #[must_use]
    pub fn dead_lettered(&self) -> Vec<(Envelope, String)> {
        self.dead_lettered.lock().clone()
    }

    /// Envelopes reported as having no registered handler.
    #[must_use]
    pub fn missing_handlers(&self) -> Vec<Envelope> {
        self.missing_handlers.lock().clone()
    }

    /// Envelopes discarded because their delivery window expired.
    #[must_use]
    pub fn expired(&self) -> Vec<Envelope> {
        self.expired.lock().clone()
    }

    fn find_executed(&self, message_type: &str) -> Option<Envelope> {
        self.executed
            .lock()
            .iter()
            .find(|envelope| envelope.message_type == message_type)
            .cloned()
    }
}

impl MessageEventListener for TrackingEventListener {
    fn execution_started(&self, envelope: &Envelope) {
        self.executed.lock().push(envelope.clone());
        self.notify.notify_waiters();
    }

    fn execution_finished(&self, _envelope: &Envelope) {}

    fn message_succeeded(&self, envelope: &Envelope) {
        self.succeeded.lock().push(envelope.clone());
        self.notify.notify_waiters();
    }

    fn message_failed(&self, envelope: &Envelope, error: &anyhow::Error) {
        self.failed.lock().push((envelope.clone(), error.to_string()));
        self.notify.notify_waiters();
    }

    fn no_handler_for(&self, envelope: &Envelope) {
        self.missing_handlers.lock().push(envelope.clone());
        self.notify.notify_waiters();
    }

    fn moved_to_error_queue(&self, envelope: &Envelope, reason: &str) {
        self.dead_lettered
            .lock()
            .push((envelope.clone(), reason.to_string()));
        self.notify.notify_waiters();
    }

    fn discarded_expired(&self, envelope: &Envelope) {
        self.expired.lock().push(envelope.clone());
        self.notify.notify_waiters();
    }
}
