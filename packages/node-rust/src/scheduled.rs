//! Scheduled redelivery: envelopes deferred to a future time.
//!
//! Holds envelopes whose `scheduled_time` lies ahead in a min-heap by due
//! time. A single loop wakes at the next due time or on insert, whichever
//! comes sooner, and re-enqueues released envelopes into the worker queue
//! as `Queued`. Entries found terminal at release time (cancelled in
//! place) are skipped. Store failures are logged and retried on a later
//! tick; they never terminate the loop.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use courier_core::{now_ms, Envelope, EnvelopeStatus};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use uuid::Uuid;

use crate::store::DurabilityStore;

/// Delay before re-attempting a release that failed on the store.
const RELEASE_RETRY_DELAY_MS: u64 = 1_000;

struct ScheduledEntry {
    due: u64,
    envelope: Envelope,
}

// Min-heap by due time on top of std's max-heap.
impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.envelope.id.cmp(&self.envelope.id))
    }
}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.envelope.id == other.envelope.id
    }
}

impl Eq for ScheduledEntry {}

/// Timer-driven owner of deferred envelopes.
///
/// Shared as `Arc`: the error policy hands it `RetryAfter` envelopes and
/// the node's startup recovery reloads `Scheduled` envelopes into it.
pub struct ScheduledJobProcessor {
    store: Arc<dyn DurabilityStore>,
    dispatch_tx: mpsc::Sender<Envelope>,
    queue: Mutex<BinaryHeap<ScheduledEntry>>,
    wake: Notify,
}

impl ScheduledJobProcessor {
    /// Creates a processor releasing into the given worker queue.
    #[must_use]
    pub fn new(store: Arc<dyn DurabilityStore>, dispatch_tx: mpsc::Sender<Envelope>) -> Arc<Self> {
        Arc::new(Self {
            store,
            dispatch_tx,
            queue: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
        })
    }

    /// Takes ownership of a deferred envelope until its due time.
    ///
    /// An envelope without a `scheduled_time` is due immediately.
    pub fn enqueue(&self, envelope: Envelope) {
        if envelope.is_terminal() {
            tracing::error!(envelope = %envelope.id, "refusing to schedule terminal envelope");
            return;
        }
        let due = envelope.scheduled_time.unwrap_or_else(now_ms);
        self.queue.lock().push(ScheduledEntry { due, envelope });
        // Wake the loop in case this entry is due sooner than its current
        // sleep target.
        self.wake.notify_waiters();
    }

    /// Number of envelopes currently held.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Cancels a scheduled envelope by dead-lettering it in place.
    ///
    /// The heap entry stays; the release loop skips it once it observes
    /// the terminal status.
    pub async fn cancel(&self, id: Uuid) -> anyhow::Result<bool> {
        self.store
            .update_status(id, EnvelopeStatus::DeadLettered)
            .await
    }

    /// Reloads `Scheduled`-status envelopes from the durability store.
    ///
    /// Called at startup so deferred work survives a restart. Returns how
    /// many envelopes were restored.
    ///
    /// # Errors
    ///
    /// Propagates store failures; startup decides whether that is fatal.
    pub async fn reload(&self) -> anyhow::Result<usize> {
        let outstanding = self.store.load_outstanding().await?;
        let mut restored = 0_usize;
        for envelope in outstanding {
            if envelope.status == EnvelopeStatus::Scheduled {
                self.enqueue(envelope);
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::info!(restored, "reloaded scheduled envelopes");
        }
        Ok(restored)
    }

    /// Runs the scheduling loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            // Register the waker before reading the heap so an insert
            // between peek and select cannot be missed.
            let mut inserted = std::pin::pin!(self.wake.notified());
            inserted.as_mut().enable();
            let next_due = self.queue.lock().peek().map(|entry| entry.due);

            tokio::select! {
                _ = shutdown.changed() => break,
                () = &mut inserted => {}
                () = sleep_until_due(next_due) => {
                    self.release_due().await;
                }
            }
        }
        tracing::debug!("scheduled job processor stopped");
    }

    /// Releases every entry whose due time has passed.
    async fn release_due(&self) {
        let now = now_ms();
        loop {
            let entry = {
                let mut queue = self.queue.lock();
                match queue.peek() {
                    Some(entry) if entry.due <= now => queue.pop(),
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };

            if let Err(error) = self.release(entry.envelope.clone()).await {
                tracing::warn!(
                    envelope = %entry.envelope.id,
                    error = %error,
                    "failed to release scheduled envelope, will retry"
                );
                self.queue.lock().push(ScheduledEntry {
                    due: now + RELEASE_RETRY_DELAY_MS,
                    envelope: entry.envelope,
                });
            }
        }
    }

    async fn release(&self, mut envelope: Envelope) -> anyhow::Result<()> {
        // Skip entries cancelled (or otherwise finished) since scheduling.
        if let Some(stored) = self.store.get(envelope.id).await? {
            if stored.is_terminal() {
                tracing::debug!(envelope = %envelope.id, "skipping terminal scheduled entry");
                return Ok(());
            }
        }

        envelope.status = EnvelopeStatus::Queued;
        envelope.scheduled_time = None;
        self.store
            .update_status(envelope.id, EnvelopeStatus::Queued)
            .await?;

        metrics::counter!("courier_scheduled_released_total").increment(1);
        self.dispatch_tx
            .send(envelope)
            .await
            .map_err(|_| anyhow::anyhow!("worker queue closed"))
    }
}

async fn sleep_until_due(next_due: Option<u64>) {
    match next_due {
        Some(due) => {
            let now = now_ms();
            if due > now {
                tokio::time::sleep(Duration::from_millis(due - now)).await;
            }
        }
        // Nothing queued: sleep until an insert wakes us.
        None => std::future::pending().await,
    }
}
