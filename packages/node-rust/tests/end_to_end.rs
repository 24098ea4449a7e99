//! Cross-node scenarios over the TCP transport: send, requeue, scheduled
//! retry, envelope customization, and capability manifests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{now_ms, Address, EnvelopeStatus, Message, MessageTypeRule};
use courier_node::{
    CourierNode, DurabilityStore, ErrorAction, ErrorRule, InMemoryEnvelopeTransaction,
    MessageContext, MessageHandler, NodeConfig, TrackingEventListener,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Serialize, Deserialize)]
struct Message1 {
    text: String,
}

impl Message for Message1 {
    const NAME: &'static str = "Message1";
}

#[derive(Debug, Serialize, Deserialize)]
struct Message2 {
    text: String,
}

impl Message for Message2 {
    const NAME: &'static str = "Message2";
}

#[derive(Debug, Serialize, Deserialize)]
struct MySpecialMessage;

impl Message for MySpecialMessage {
    const NAME: &'static str = "MySpecialMessage";
}

#[derive(Debug, Error)]
#[error("attempted to divide by zero")]
struct DivideByZeroError;

#[derive(Debug, Error)]
#[error("the operation timed out")]
struct TimeoutError;

struct Message1Consumer;

#[async_trait]
impl MessageHandler<Message1> for Message1Consumer {
    async fn handle(&self, _message: Message1, _context: &mut MessageContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fails with a divide-by-zero on the first attempt, then succeeds.
struct FlakyMessage2Consumer {
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl MessageHandler<Message2> for FlakyMessage2Consumer {
    async fn handle(&self, _message: Message2, _context: &mut MessageContext) -> anyhow::Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(anyhow::Error::new(DivideByZeroError));
        }
        Ok(())
    }
}

struct AlwaysTimingOutConsumer;

#[async_trait]
impl MessageHandler<Message2> for AlwaysTimingOutConsumer {
    async fn handle(&self, _message: Message2, _context: &mut MessageContext) -> anyhow::Result<()> {
        Err(anyhow::Error::new(TimeoutError))
    }
}

struct Receiver {
    node: CourierNode,
    tracker: Arc<TrackingEventListener>,
    address: Address,
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Starts a receiver listening on an OS-assigned port.
async fn start_receiver() -> Receiver {
    init_tracing();
    let tracker = TrackingEventListener::new();
    let config = NodeConfig {
        service_name: "receiver".to_string(),
        listen_address: Some(Address::tcp("127.0.0.1", 0)),
        ..NodeConfig::default()
    };
    let node = CourierNode::new(config)
        .with_event_listener(Arc::clone(&tracker) as Arc<dyn courier_node::MessageEventListener>);
    node.start().await.unwrap();
    let bound = node.listen_addr().unwrap();
    let address = Address::tcp("127.0.0.1", bound.port());
    Receiver {
        node,
        tracker,
        address,
    }
}

async fn start_sender() -> CourierNode {
    init_tracing();
    let node = CourierNode::new(NodeConfig {
        service_name: "sender".to_string(),
        ..NodeConfig::default()
    });
    node.start().await.unwrap();
    node
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn can_send_from_one_node_to_another() {
    let receiver = start_receiver().await;
    receiver.node.handlers().register::<Message1, _>(Message1Consumer);
    let sender = start_sender().await;

    let mut context = sender.context().unwrap();
    context
        .send(
            receiver.address.clone(),
            &Message1 {
                text: "hello".to_string(),
            },
        )
        .await
        .unwrap();

    let envelope = tokio::time::timeout(
        Duration::from_secs(5),
        receiver.tracker.wait_for(Message1::NAME),
    )
    .await
    .expect("receiver handled the message");

    assert_eq!(envelope.message_type, Message1::NAME);
    assert_eq!(receiver.tracker.executed_count(Message1::NAME), 1);

    sender.stop(Duration::from_secs(2)).await.unwrap();
    receiver.node.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn tags_the_envelope_with_the_source() {
    let receiver = start_receiver().await;
    receiver.node.handlers().register::<Message1, _>(Message1Consumer);

    let sender_config = NodeConfig {
        service_name: "sender".to_string(),
        ..NodeConfig::default()
    };
    let sender_node_id = sender_config.node_id.clone();
    let sender = CourierNode::new(sender_config);
    sender.start().await.unwrap();

    let mut context = sender.context().unwrap();
    context
        .send(
            receiver.address.clone(),
            &Message1 {
                text: "from a".to_string(),
            },
        )
        .await
        .unwrap();

    let envelope = tokio::time::timeout(
        Duration::from_secs(5),
        receiver.tracker.wait_for(Message1::NAME),
    )
    .await
    .unwrap();

    assert_eq!(envelope.source.as_deref(), Some(sender_node_id.as_str()));
    assert!(envelope.correlation_id.is_some());

    sender.stop(Duration::from_secs(2)).await.unwrap();
    receiver.node.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn can_apply_requeue_mechanics() {
    let receiver = start_receiver().await;
    let attempts = Arc::new(AtomicU32::new(0));
    receiver.node.handlers().register::<Message2, _>(FlakyMessage2Consumer {
        attempts: Arc::clone(&attempts),
    });
    receiver
        .node
        .policy()
        .add(ErrorRule::for_error::<DivideByZeroError>(ErrorAction::Requeue));
    let sender = start_sender().await;

    let mut context = sender.context().unwrap();
    context
        .send(
            receiver.address.clone(),
            &Message2 {
                text: "retry me".to_string(),
            },
        )
        .await
        .unwrap();

    let tracker = Arc::clone(&receiver.tracker);
    wait_until(move || !tracker.succeeded().is_empty()).await;

    // Failed once, requeued immediately, then handled.
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(receiver.tracker.executed_count(Message2::NAME), 2);
    let succeeded = receiver.tracker.succeeded();
    assert_eq!(succeeded[0].attempts, 1);

    sender.stop(Duration::from_secs(2)).await.unwrap();
    receiver.node.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn timeout_failures_reach_scheduled_with_the_configured_delay() {
    let receiver = start_receiver().await;
    receiver
        .node
        .handlers()
        .register::<Message2, _>(AlwaysTimingOutConsumer);
    receiver.node.policy().add(ErrorRule::for_error::<TimeoutError>(
        ErrorAction::RetryAfter(Duration::from_secs(10)),
    ));
    let sender = start_sender().await;

    let mut context = sender.context().unwrap();
    let sent_at = now_ms();
    context
        .send(
            receiver.address.clone(),
            &Message2 {
                text: "slow".to_string(),
            },
        )
        .await
        .unwrap();

    let envelope = tokio::time::timeout(
        Duration::from_secs(5),
        receiver.tracker.wait_for(Message2::NAME),
    )
    .await
    .unwrap();

    let id = envelope.id;
    let mut stored = None;
    for _ in 0..250 {
        let current = receiver.node.store().get(id).await.unwrap();
        if current
            .as_ref()
            .is_some_and(|envelope| envelope.status == EnvelopeStatus::Scheduled)
        {
            stored = current;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let stored = stored.expect("envelope reached Scheduled");
    assert_eq!(stored.attempts, 1);
    let due = stored.scheduled_time.expect("scheduled for retry");
    assert!(due >= sent_at + 9_000, "due {due} too early for {sent_at}");
    assert!(due <= now_ms() + 10_500, "due {due} too late");

    sender.stop(Duration::from_secs(2)).await.unwrap();
    receiver.node.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn exhausted_retries_move_the_envelope_to_the_error_queue() {
    let receiver = start_receiver().await;
    receiver
        .node
        .handlers()
        .register::<Message2, _>(AlwaysTimingOutConsumer);
    // Short delay so all three retry cycles finish inside the test.
    receiver.node.policy().add(ErrorRule::for_error::<TimeoutError>(
        ErrorAction::RetryAfter(Duration::from_millis(50)),
    ));
    let sender = start_sender().await;

    let mut context = sender.context().unwrap();
    context
        .send(
            receiver.address.clone(),
            &Message2 {
                text: "poison".to_string(),
            },
        )
        .await
        .unwrap();

    let (dead, reason) = tokio::time::timeout(
        Duration::from_secs(10),
        receiver.tracker.wait_for_dead_letter(Message2::NAME),
    )
    .await
    .expect("poison message dead-lettered");

    // max_attempts = 3: the initial execution plus three retry cycles.
    assert_eq!(dead.attempts, 3);
    assert_eq!(receiver.tracker.executed_count(Message2::NAME), 4);
    assert!(reason.contains("timed out"));
    let stored = receiver.node.store().get(dead.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EnvelopeStatus::DeadLettered);

    sender.stop(Duration::from_secs(2)).await.unwrap();
    receiver.node.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn type_rules_customize_outgoing_envelopes() {
    let sender = CourierNode::new(NodeConfig {
        service_name: "sender".to_string(),
        ..NodeConfig::default()
    });
    sender.add_rule(
        MessageTypeRule::set_header(MySpecialMessage::NAME, "special", "true")
            .in_attribute_phase(),
    );
    sender.add_rule(MessageTypeRule::deliver_within(
        MySpecialMessage::NAME,
        Duration::from_secs(5),
    ));
    sender.start().await.unwrap();

    // Enlist so the envelope pools up instead of going out.
    let mut context = sender.context().unwrap();
    context.enlist(InMemoryEnvelopeTransaction::new());
    let before = now_ms();
    context
        .send(Address::tcp("localhost", 2001), &MySpecialMessage)
        .await
        .unwrap();

    let outgoing = &context.outstanding()[0];
    assert_eq!(outgoing.headers.get("special"), Some("true"));
    let deadline = outgoing.deliver_by.expect("delivery window stamped");
    assert!(deadline >= before + 5_000);
    assert!(deadline <= now_ms() + 5_000);

    sender.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn capability_manifest_survives_a_file_roundtrip() {
    use courier_node::{PublishRule, Subscription};

    let config = NodeConfig {
        service_name: "AppWithSubscriptions".to_string(),
        subscriptions: vec![Subscription::to("Message1"), Subscription::to("Message2")],
        publish_rules: vec![
            PublishRule::new("Message3"),
            PublishRule::new("Message4"),
            PublishRule::new("Message5"),
        ],
        ..NodeConfig::default()
    };
    let node = CourierNode::new(config);
    node.start().await.unwrap();

    let services = node.capabilities().unwrap();
    assert!(!services.errors.is_empty());
    assert!(!services.subscriptions.is_empty());
    assert!(!services.published.is_empty());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("services.json");
    services.write_to_file(&path).unwrap();

    let services2 = courier_core::ServiceCapabilities::read_from_file(&path).unwrap();
    assert_eq!(services2.service_name, services.service_name);
    assert_eq!(services2.subscriptions.len(), 2);
    assert_eq!(services2.published.len(), services.published.len());
    assert_eq!(services2.errors.len(), services.errors.len());

    node.stop(Duration::from_secs(2)).await.unwrap();
}
