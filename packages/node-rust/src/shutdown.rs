//! Process-wide cancellation and drain tracking.
//!
//! One [`ShutdownController`] per node: runtime loops (transport, scheduler,
//! dispatcher) hold a watch receiver and exit promptly when shutdown is
//! signalled, while in-flight handler executions are tracked with RAII
//! guards so `stop` can wait for them up to a bounded grace period.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Node lifecycle state.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The node is wiring itself up; nothing is accepted yet.
    Starting,
    /// The node is accepting and executing envelopes.
    Ready,
    /// Shutdown was signalled; in-flight executions are finishing.
    Draining,
    /// All in-flight work drained (or was abandoned to the store).
    Stopped,
}

/// Coordinates graceful shutdown across every runtime loop.
///
/// In-flight handler executions take an [`ExecutionGuard`]; the atomic
/// counter behind the guards is what `drain` polls. Envelope state for
/// abandoned executions stays in the durability store, so a drain timeout
/// loses nothing — the work resumes on the next start.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: ArcSwap<NodeState>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: ArcSwap::from_pointee(NodeState::Starting),
        }
    }

    /// Marks the node ready to accept work.
    pub fn set_ready(&self) {
        self.state.store(Arc::new(NodeState::Ready));
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        **self.state.load()
    }

    /// Returns a receiver that flips to `true` when shutdown is triggered.
    ///
    /// Every runtime loop selects on this alongside its main work.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Whether shutdown has been triggered.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.signal.borrow()
    }

    /// Signals shutdown and transitions to `Draining`.
    pub fn trigger(&self) {
        self.state.store(Arc::new(NodeState::Draining));
        // Receivers may already be gone; that is fine.
        let _ = self.signal.send(true);
    }

    /// Takes an RAII guard counting one in-flight handler execution.
    ///
    /// The count decrements when the guard drops, panicking handlers
    /// included, since Drop runs during unwinding.
    #[must_use]
    pub fn execution_guard(&self) -> ExecutionGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        ExecutionGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Number of executions currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight executions to finish, up to `grace`.
    ///
    /// Returns `true` and transitions to `Stopped` when everything
    /// drained. Returns `false` when the grace period expired with work
    /// still running; the state stays `Draining` and the remaining work
    /// is abandoned to the durability store.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(NodeState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one in-flight handler execution.
#[derive(Debug)]
pub struct ExecutionGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_states_transition_in_order() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), NodeState::Starting);

        controller.set_ready();
        assert_eq!(controller.state(), NodeState::Ready);

        controller.trigger();
        assert_eq!(controller.state(), NodeState::Draining);
        assert!(controller.is_shutting_down());
    }

    #[test]
    fn guards_track_in_flight_executions() {
        let controller = ShutdownController::new();
        assert_eq!(controller.in_flight(), 0);

        let first = controller.execution_guard();
        let second = controller.execution_guard();
        assert_eq!(controller.in_flight(), 2);

        drop(first);
        assert_eq!(controller.in_flight(), 1);
        drop(second);
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test]
    async fn subscribers_observe_trigger() {
        let controller = ShutdownController::new();
        let mut rx = controller.subscribe();
        assert!(!*rx.borrow());

        controller.trigger();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn drain_succeeds_with_no_work() {
        let controller = ShutdownController::new();
        controller.set_ready();
        controller.trigger();

        assert!(controller.drain(Duration::from_secs(1)).await);
        assert_eq!(controller.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let controller = Arc::new(ShutdownController::new());
        controller.set_ready();

        let guard = controller.execution_guard();
        controller.trigger();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        assert!(controller.drain(Duration::from_secs(2)).await);
        assert_eq!(controller.state(), NodeState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_with_stuck_work() {
        let controller = ShutdownController::new();
        controller.set_ready();
        let _stuck = controller.execution_guard();
        controller.trigger();

        assert!(!controller.drain(Duration::from_millis(50)).await);
        // Abandoned work leaves the node Draining, never falsely Stopped.
        assert_eq!(controller.state(), NodeState::Draining);
    }
}
