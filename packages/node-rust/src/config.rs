//! Node configuration types.
//!
//! Plain structs passed into [`CourierNode::new`](crate::node::CourierNode):
//! there is no fluent builder layer. Publish and subscribe declarations live
//! here too; the capability negotiator reads them at startup.

use std::time::Duration;

use courier_core::Address;
use uuid::Uuid;

/// Top-level configuration for one running node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Logical service name, used in the capability manifest.
    pub service_name: String,
    /// Unique id of this node; stamped as `source` on outgoing envelopes.
    pub node_id: String,
    /// Address to accept inbound envelopes on. `None` for send-only nodes.
    pub listen_address: Option<Address>,
    /// Maximum handler executions in flight at once. 0 means use the
    /// machine's available parallelism.
    pub worker_count: usize,
    /// Retry ceiling applied to outgoing envelopes unless a rule overrides it.
    pub default_max_attempts: u32,
    /// Whether to cross-check publish rules against subscriptions at startup.
    pub validate_capabilities: bool,
    /// Whether capability validation errors abort startup instead of being
    /// recorded in the manifest.
    pub fail_on_validation_errors: bool,
    /// Message types this node publishes, with optional fixed destinations.
    pub publish_rules: Vec<PublishRule>,
    /// Message types this node consumes.
    pub subscriptions: Vec<Subscription>,
    /// Stream transport tuning.
    pub transport: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            service_name: "courier".to_string(),
            node_id: Uuid::new_v4().to_string(),
            listen_address: None,
            worker_count: 0,
            default_max_attempts: courier_core::DEFAULT_MAX_ATTEMPTS,
            validate_capabilities: true,
            fail_on_validation_errors: false,
            publish_rules: Vec::new(),
            subscriptions: Vec::new(),
            transport: TransportConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Effective worker count, resolving 0 to available parallelism.
    #[must_use]
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count > 0 {
            return self.worker_count;
        }
        std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
    }
}

/// Declaration that this node publishes a message type.
///
/// When `destination` is set, [`MessageContext::publish`] routes matching
/// messages there. A rule without a destination and without a matching
/// subscription anywhere is a capability validation error.
///
/// [`MessageContext::publish`]: crate::context::MessageContext::publish
#[derive(Debug, Clone)]
pub struct PublishRule {
    pub message_type: String,
    pub destination: Option<Address>,
}

impl PublishRule {
    /// Publishes a type with no fixed destination.
    #[must_use]
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            destination: None,
        }
    }

    /// Publishes a type to a fixed destination.
    #[must_use]
    pub fn to(message_type: impl Into<String>, destination: Address) -> Self {
        Self {
            message_type: message_type.into(),
            destination: Some(destination),
        }
    }
}

/// Declaration that this node consumes a message type.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub message_type: String,
}

impl Subscription {
    #[must_use]
    pub fn to(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
        }
    }
}

/// Stream transport tuning knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// First reconnect delay after a send failure.
    pub reconnect_initial_backoff: Duration,
    /// Ceiling for the jittered exponential reconnect backoff.
    pub reconnect_max_backoff: Duration,
    /// Consecutive connection failures tolerated before a batch's envelopes
    /// are returned to the durability store as failed.
    pub max_connection_retries: u32,
    /// Idle time after which the sender probes the connection with a ping.
    pub ping_interval: Duration,
    /// Bounded capacity of each per-destination outbound queue.
    pub outbound_channel_capacity: usize,
    /// Bounded capacity of the local dispatch queue.
    pub dispatch_channel_capacity: usize,
    /// Maximum accepted wire frame size in bytes.
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_backoff: Duration::from_millis(100),
            reconnect_max_backoff: Duration::from_secs(5),
            max_connection_retries: 3,
            ping_interval: Duration::from_secs(30),
            outbound_channel_capacity: 256,
            dispatch_channel_capacity: 1024,
            max_frame_bytes: 16 * 1024 * 1024, // 16 MB
        }
    }
}
