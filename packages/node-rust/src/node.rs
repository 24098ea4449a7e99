//! Node runtime: wiring and lifecycle.
//!
//! [`CourierNode`] owns everything a running node needs: the durability
//! store, handler registry, rule registries, transport, scheduler, and
//! worker pool. `start()` negotiates capabilities, recovers outstanding
//! work from the store, binds the listener, and spawns the runtime loops;
//! `stop(grace)` signals shutdown, drains in-flight executions, and
//! abandons whatever remains to the store for the next start. Each is
//! invoked once, in that order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use courier_core::{
    Address, Envelope, EnvelopeStatus, MessageTypeRule, MessageTypeRules, ServiceCapabilities,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::context::MessageContext;
use crate::error::CourierError;
use crate::events::{MessageEventListener, TracingEventListener};
use crate::handler::HandlerRegistry;
use crate::policy::ErrorPolicy;
use crate::scheduled::ScheduledJobProcessor;
use crate::shutdown::{NodeState, ShutdownController};
use crate::store::{DurabilityStore, InMemoryEnvelopeStore};
use crate::transport::{self, SenderRegistry};
use crate::worker;

/// Shared state every runtime loop and context hangs off.
pub(crate) struct RuntimeInner {
    pub(crate) config: NodeConfig,
    pub(crate) store: Arc<dyn DurabilityStore>,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) events: Arc<dyn MessageEventListener>,
    pub(crate) policy: Arc<ErrorPolicy>,
    pub(crate) rules: Arc<RwLock<MessageTypeRules>>,
    pub(crate) dispatch_tx: mpsc::Sender<Envelope>,
    pub(crate) scheduler: Arc<ScheduledJobProcessor>,
    pub(crate) senders: SenderRegistry,
    pub(crate) shutdown: Arc<ShutdownController>,
}

impl RuntimeInner {
    /// Whether an address is served by this node's own worker queue.
    pub(crate) fn is_local_destination(&self, address: &Address) -> bool {
        address.is_local() || Some(address) == self.config.listen_address.as_ref()
    }
}

/// One running instance of the messaging runtime.
pub struct CourierNode {
    config: NodeConfig,
    store: Arc<dyn DurabilityStore>,
    events: Arc<dyn MessageEventListener>,
    handlers: Arc<HandlerRegistry>,
    policy: Arc<ErrorPolicy>,
    rules: Arc<RwLock<MessageTypeRules>>,
    shutdown: Arc<ShutdownController>,
    runtime: OnceLock<Arc<RuntimeInner>>,
    capabilities: OnceLock<ServiceCapabilities>,
    bound_addr: OnceLock<SocketAddr>,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CourierNode {
    /// Creates a node with the default in-memory envelope journal.
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryEnvelopeStore::new()))
    }

    /// Creates a node with an explicit durability store.
    ///
    /// Passing [`NullEnvelopeStore`](crate::store::NullEnvelopeStore) is
    /// how a deployment opts out of durability; the choice is logged at
    /// startup.
    #[must_use]
    pub fn with_store(config: NodeConfig, store: Arc<dyn DurabilityStore>) -> Self {
        Self {
            config,
            store,
            events: Arc::new(TracingEventListener),
            handlers: Arc::new(HandlerRegistry::new()),
            policy: Arc::new(ErrorPolicy::new()),
            rules: Arc::new(RwLock::new(MessageTypeRules::new())),
            shutdown: Arc::new(ShutdownController::new()),
            runtime: OnceLock::new(),
            capabilities: OnceLock::new(),
            bound_addr: OnceLock::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the event listener. Call before `start()`.
    #[must_use]
    pub fn with_event_listener(mut self, events: Arc<dyn MessageEventListener>) -> Self {
        self.events = events;
        self
    }

    /// The handler registry, for startup-time registration.
    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// The error policy, for startup-time rule registration.
    #[must_use]
    pub fn policy(&self) -> &ErrorPolicy {
        &self.policy
    }

    /// Registers a message-type rule.
    pub fn add_rule(&self, rule: MessageTypeRule) {
        self.rules.write().add(rule);
    }

    /// The capability manifest, available once started.
    #[must_use]
    pub fn capabilities(&self) -> Option<&ServiceCapabilities> {
        self.capabilities.get()
    }

    /// The actually-bound listen address, once started with a TCP
    /// listener. Resolves an OS-assigned port when configured with port 0.
    #[must_use]
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.get().copied()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> NodeState {
        self.shutdown.state()
    }

    /// The durability store backing this node.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DurabilityStore> {
        &self.store
    }

    /// Creates a message context for an ad-hoc unit of work.
    ///
    /// # Errors
    ///
    /// Fails before `start()`.
    pub fn context(&self) -> anyhow::Result<MessageContext> {
        let inner = self
            .runtime
            .get()
            .ok_or_else(|| CourierError::Lifecycle("node is not started".to_string()))?;
        Ok(MessageContext::new(Arc::clone(inner)))
    }

    /// Starts the node.
    ///
    /// # Errors
    ///
    /// Fails on a second call, on capability validation errors when those
    /// are configured fatal, on store recovery failure, and on listener
    /// bind failure.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CourierError::Lifecycle("node already started".to_string()).into());
        }

        if !self.store.is_durable() {
            tracing::info!("durability disabled by configuration, envelopes are not journaled");
        }

        let capabilities = negotiate_capabilities(&self.config);
        if capabilities.has_errors() {
            if self.config.fail_on_validation_errors {
                return Err(CourierError::Validation(capabilities.errors.clone()).into());
            }
            for error in &capabilities.errors {
                tracing::warn!(error = %error, "capability validation");
            }
        }
        let _ = self.capabilities.set(capabilities);

        let (dispatch_tx, dispatch_rx) =
            mpsc::channel(self.config.transport.dispatch_channel_capacity);
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let scheduler = ScheduledJobProcessor::new(Arc::clone(&self.store), dispatch_tx.clone());
        let senders = SenderRegistry::new(
            self.config.transport.clone(),
            Arc::clone(&self.store),
            dispatch_tx.clone(),
            failure_tx,
            self.shutdown.subscribe(),
        );

        let inner = Arc::new(RuntimeInner {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            handlers: Arc::clone(&self.handlers),
            events: Arc::clone(&self.events),
            policy: Arc::clone(&self.policy),
            rules: Arc::clone(&self.rules),
            dispatch_tx,
            scheduler: Arc::clone(&scheduler),
            senders,
            shutdown: Arc::clone(&self.shutdown),
        });
        if self.runtime.set(Arc::clone(&inner)).is_err() {
            return Err(CourierError::Lifecycle("node already started".to_string()).into());
        }

        self.recover(&inner).await?;

        if let Some(listen) = &self.config.listen_address {
            if !listen.is_local() {
                let (listener, bound) = transport::listener::bind(listen).await?;
                let _ = self.bound_addr.set(bound);
                self.tasks
                    .lock()
                    .push(transport::listener::spawn(Arc::clone(&inner), listener));
            }
        }
        self.tasks
            .lock()
            .push(worker::spawn_dispatch_loop(Arc::clone(&inner), dispatch_rx));
        self.tasks
            .lock()
            .push(tokio::spawn(scheduler.run(self.shutdown.subscribe())));
        self.tasks
            .lock()
            .push(worker::spawn_failure_loop(Arc::clone(&inner), failure_rx));

        self.shutdown.set_ready();
        tracing::info!(
            service = %self.config.service_name,
            node = %self.config.node_id,
            "courier node started"
        );
        Ok(())
    }

    /// Resumes in-flight work left in the store by an earlier run.
    ///
    /// `Scheduled` envelopes go back to the scheduler; every other
    /// non-terminal envelope re-enters the worker queue.
    async fn recover(&self, inner: &Arc<RuntimeInner>) -> anyhow::Result<()> {
        let restored = inner.scheduler.reload().await?;

        let mut requeued = 0_usize;
        for mut envelope in self.store.load_outstanding().await? {
            if envelope.status == EnvelopeStatus::Scheduled {
                continue;
            }
            envelope.status = EnvelopeStatus::Queued;
            let _ = self
                .store
                .update_status(envelope.id, EnvelopeStatus::Queued)
                .await;
            if inner.dispatch_tx.send(envelope).await.is_err() {
                break;
            }
            requeued += 1;
        }

        if restored > 0 || requeued > 0 {
            tracing::info!(restored, requeued, "recovered outstanding envelopes");
        }
        Ok(())
    }

    /// Stops the node, draining in-flight executions up to `grace`.
    ///
    /// Returns whether everything drained; on `false` the remaining work
    /// was abandoned to the durability store for the next start.
    ///
    /// # Errors
    ///
    /// Fails when called before `start()` or a second time.
    pub async fn stop(&self, grace: Duration) -> anyhow::Result<bool> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(CourierError::Lifecycle("node was never started".to_string()).into());
        }
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(CourierError::Lifecycle("node already stopped".to_string()).into());
        }

        self.shutdown.trigger();
        let drained = self.shutdown.drain(grace).await;
        if !drained {
            tracing::warn!(
                in_flight = self.shutdown.in_flight(),
                "grace period expired, abandoning in-flight work to the store"
            );
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(Duration::from_millis(250), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        tracing::info!(drained, "courier node stopped");
        Ok(drained)
    }
}

/// Builds the capability manifest from the publish/subscribe configuration.
///
/// With validation enabled, a publish rule that names no destination and
/// has no matching subscription records a mismatch instead of failing
/// startup.
fn negotiate_capabilities(config: &NodeConfig) -> ServiceCapabilities {
    let subscriptions: Vec<String> = config
        .subscriptions
        .iter()
        .map(|subscription| subscription.message_type.clone())
        .collect();
    let published: Vec<String> = config
        .publish_rules
        .iter()
        .map(|rule| rule.message_type.clone())
        .collect();

    let mut errors = Vec::new();
    if config.validate_capabilities {
        for rule in &config.publish_rules {
            if rule.destination.is_none() && !subscriptions.contains(&rule.message_type) {
                errors.push(format!(
                    "no known subscriber for published message type '{}'",
                    rule.message_type
                ));
            }
        }
    }

    ServiceCapabilities {
        service_name: config.service_name.clone(),
        subscriptions,
        published,
        errors,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Runtime harness for in-crate component tests.

    use super::*;
    use crate::transport::FailedDelivery;

    pub(crate) struct TestHarness {
        pub(crate) inner: Arc<RuntimeInner>,
        pub(crate) dispatch_rx: mpsc::Receiver<Envelope>,
        #[allow(dead_code)]
        pub(crate) failure_rx: mpsc::UnboundedReceiver<FailedDelivery>,
    }

    pub(crate) fn runtime() -> TestHarness {
        runtime_with(|_| {})
    }

    pub(crate) fn runtime_with(configure: impl FnOnce(&mut NodeConfig)) -> TestHarness {
        let mut config = NodeConfig::default();
        configure(&mut config);
        build(config, Arc::new(TracingEventListener))
    }

    pub(crate) fn runtime_with_events(events: Arc<dyn MessageEventListener>) -> TestHarness {
        build(NodeConfig::default(), events)
    }

    /// A context whose runtime loops are not running; for tests that only
    /// exercise envelope construction. The channel receivers are leaked so
    /// sends keep succeeding for the life of the test process.
    pub(crate) fn standalone_context() -> MessageContext {
        let harness = runtime();
        Box::leak(Box::new(harness.dispatch_rx));
        Box::leak(Box::new(harness.failure_rx));
        MessageContext::new(harness.inner)
    }

    fn build(config: NodeConfig, events: Arc<dyn MessageEventListener>) -> TestHarness {
        let store: Arc<dyn DurabilityStore> = Arc::new(InMemoryEnvelopeStore::new());
        let shutdown = Arc::new(ShutdownController::new());
        let (dispatch_tx, dispatch_rx) =
            mpsc::channel(config.transport.dispatch_channel_capacity);
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let scheduler = ScheduledJobProcessor::new(Arc::clone(&store), dispatch_tx.clone());
        let senders = SenderRegistry::new(
            config.transport.clone(),
            Arc::clone(&store),
            dispatch_tx.clone(),
            failure_tx,
            shutdown.subscribe(),
        );
        let inner = Arc::new(RuntimeInner {
            config,
            store,
            handlers: Arc::new(HandlerRegistry::new()),
            events,
            policy: Arc::new(ErrorPolicy::new()),
            rules: Arc::new(RwLock::new(MessageTypeRules::new())),
            dispatch_tx,
            scheduler,
            senders,
            shutdown,
        });
        TestHarness {
            inner,
            dispatch_rx,
            failure_rx,
        }
    }
}
