//! Relay behaviour over the in-memory broker and store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jwt_security::AuthenticatedIdentity;
use messaging_service::broker::{queue_name, routing_key, EXCHANGE_NAME};
use messaging_service::error::BrokerResult;
use messaging_service::{
    Broker, BrokerError, BrokerHandle, Consumer, Delivery, InMemoryMessageStore, LiveConnection,
    MemoryBroker, MessageHandler, MessageRecord, MessageRelay, MessageStore, NotificationHub,
    Notifier, RelayError, NEW_MESSAGE_NOTICE,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

const WAIT: Duration = Duration::from_secs(5);

fn identity(user_id: &str) -> AuthenticatedIdentity {
    AuthenticatedIdentity::new(user_id, Some(format!("{}-name", user_id)))
}

/// Notifier that records every call
#[derive(Default)]
struct RecordingNotifier {
    calls: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: &str, message: &str) -> usize {
        self.calls
            .lock()
            .await
            .push((user_id.to_string(), message.to_string()));
        0
    }
}

/// Forwards every message to a channel; fails the first `failures` calls.
struct ChannelHandler {
    tx: UnboundedSender<MessageRecord>,
    calls: AtomicUsize,
    failures: usize,
}

impl ChannelHandler {
    fn new(failures: usize) -> (Arc<Self>, UnboundedReceiver<MessageRecord>) {
        let (tx, rx) = unbounded_channel();
        (
            Arc::new(Self {
                tx,
                calls: AtomicUsize::new(0),
                failures,
            }),
            rx,
        )
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn on_message(&self, message: MessageRecord) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.tx.send(message)?;
        if call < self.failures {
            anyhow::bail!("handler failure #{}", call + 1);
        }
        Ok(())
    }
}

/// Memory broker whose publish always fails
struct UnreachableBroker {
    inner: MemoryBroker,
}

#[async_trait]
impl Broker for UnreachableBroker {
    async fn assert_exchange(&self, name: &str, durable: bool) -> BrokerResult<()> {
        self.inner.assert_exchange(name, durable).await
    }

    async fn assert_queue(&self, name: &str, durable: bool) -> BrokerResult<()> {
        self.inner.assert_queue(name, durable).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, key: &str) -> BrokerResult<()> {
        self.inner.bind_queue(queue, exchange, key).await
    }

    async fn publish(&self, _: &str, _: &str, _: &[u8]) -> BrokerResult<()> {
        Err(BrokerError::Unavailable("connection reset".to_string()))
    }

    async fn consume(&self, queue: &str) -> BrokerResult<Box<dyn Consumer>> {
        self.inner.consume(queue).await
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        self.inner.ack(delivery).await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> BrokerResult<()> {
        self.inner.nack(delivery, requeue).await
    }

    async fn cancel(&self, queue: &str, tag: &str) -> BrokerResult<()> {
        self.inner.cancel(queue, tag).await
    }
}

struct Harness {
    relay: MessageRelay,
    broker: MemoryBroker,
    store: Arc<InMemoryMessageStore>,
    notifier: Arc<RecordingNotifier>,
}

fn harness() -> Harness {
    let broker = MemoryBroker::new();
    let store = Arc::new(InMemoryMessageStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let relay = MessageRelay::new(
        store.clone(),
        Arc::new(BrokerHandle::from_broker(Arc::new(broker.clone()))),
        notifier.clone(),
    )
    .with_retry_backoff(Duration::from_millis(10));
    Harness {
        relay,
        broker,
        store,
        notifier,
    }
}

async fn recv(rx: &mut UnboundedReceiver<MessageRecord>) -> MessageRecord {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("handler channel closed")
}

async fn wait_for_acks(broker: &MemoryBroker, queue: &str, expected: u64) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while broker.acked_total(queue).await < expected {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for ack");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn send_stores_message_and_notifies_receiver() {
    let h = harness();

    let report = h.relay.send(&identity("u1"), "u2", "hi").await.unwrap();

    let stored = h.store.find_by_receiver("u2").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sender_id, "u1");
    assert_eq!(stored[0].receiver_id, "u2");
    assert_eq!(stored[0].content, "hi");
    assert_eq!(stored[0], report.message);

    let calls = h.notifier.calls.lock().await.clone();
    assert_eq!(calls, vec![("u2".to_string(), NEW_MESSAGE_NOTICE.to_string())]);
}

#[tokio::test]
async fn inbox_contains_every_sent_message() {
    let h = harness();
    h.relay.send(&identity("u1"), "u2", "one").await.unwrap();
    h.relay.send(&identity("u3"), "u2", "two").await.unwrap();
    h.relay.send(&identity("u2"), "u1", "reply").await.unwrap();

    let inbox = h.relay.inbox(&identity("u2")).await.unwrap();
    let pairs: Vec<(&str, &str)> = inbox
        .iter()
        .map(|m| (m.sender_id.as_str(), m.content.as_str()))
        .collect();
    assert_eq!(pairs, vec![("u1", "one"), ("u3", "two")]);
}

#[tokio::test]
async fn listener_receives_deep_equal_record_and_acks_once() {
    let h = harness();
    let (handler, mut rx) = ChannelHandler::new(0);
    let subscription = h.relay.listen(&identity("u2"), handler.clone()).await.unwrap();
    assert_eq!(subscription.queue(), "user-u2-queue");

    let report = h.relay.send(&identity("u1"), "u2", "hi").await.unwrap();
    assert!(report.delivery_result().is_ok());

    let delivered = recv(&mut rx).await;
    assert_eq!(delivered, report.message);

    wait_for_acks(&h.broker, "user-u2-queue", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.calls(), 1);
    assert_eq!(h.broker.acked_total("user-u2-queue").await, 1);
    assert_eq!(h.broker.unacked_count("user-u2-queue").await, 0);
    assert_eq!(h.broker.ready_count("user-u2-queue").await, 0);

    subscription.cancel().await.unwrap();
}

#[tokio::test]
async fn messages_for_other_users_never_reach_listener() {
    let h = harness();
    let (handler, mut rx) = ChannelHandler::new(0);
    let _subscription = h.relay.listen(&identity("u2"), handler).await.unwrap();
    let (other, mut other_rx) = ChannelHandler::new(0);
    let _other_subscription = h.relay.listen(&identity("u3"), other).await.unwrap();

    h.relay.send(&identity("u1"), "u3", "for u3").await.unwrap();
    h.relay.send(&identity("u1"), "u2", "for u2").await.unwrap();

    assert_eq!(recv(&mut rx).await.content, "for u2");
    assert_eq!(recv(&mut other_rx).await.content, "for u3");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() {
    let h = harness();
    let (handler, mut rx) = ChannelHandler::new(0);
    let _subscription = h.relay.listen(&identity("u2"), handler).await.unwrap();

    for content in ["a", "b", "c"] {
        h.relay.send(&identity("u1"), "u2", content).await.unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(recv(&mut rx).await.content);
    }
    assert_eq!(received, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn listening_twice_keeps_one_queue_and_one_consumer() {
    let h = harness();
    let (first, _rx1) = ChannelHandler::new(0);
    let (second, _rx2) = ChannelHandler::new(0);

    let subscription = h.relay.listen(&identity("u2"), first).await.unwrap();
    let err = h.relay.listen(&identity("u2"), second.clone()).await.err().unwrap();
    assert!(matches!(
        err,
        RelayError::Broker(BrokerError::ConsumerAlreadyRegistered { ref queue }) if queue == "user-u2-queue"
    ));
    assert_eq!(err.status_code(), 409);
    assert_eq!(h.broker.queue_names().await, vec!["user-u2-queue".to_string()]);

    subscription.cancel().await.unwrap();
    assert!(!h.broker.has_consumer("user-u2-queue").await);

    let again = h.relay.listen(&identity("u2"), second).await.unwrap();
    assert_eq!(h.broker.queue_names().await, vec!["user-u2-queue".to_string()]);
    again.cancel().await.unwrap();
}

#[tokio::test]
async fn messages_queued_while_not_listening_are_delivered_later() {
    let h = harness();
    let (handler, _rx) = ChannelHandler::new(0);
    let subscription = h.relay.listen(&identity("u2"), handler).await.unwrap();
    subscription.cancel().await.unwrap();

    let report = h.relay.send(&identity("u1"), "u2", "while away").await.unwrap();
    assert_eq!(h.broker.ready_count("user-u2-queue").await, 1);

    let (handler, mut rx) = ChannelHandler::new(0);
    let _subscription = h.relay.listen(&identity("u2"), handler).await.unwrap();
    assert_eq!(recv(&mut rx).await, report.message);
}

#[tokio::test]
async fn handler_failure_leads_to_redelivery_until_success() {
    let h = harness();
    let (handler, mut rx) = ChannelHandler::new(2);
    let _subscription = h.relay.listen(&identity("u2"), handler.clone()).await.unwrap();

    let report = h.relay.send(&identity("u1"), "u2", "retry me").await.unwrap();

    for _ in 0..3 {
        assert_eq!(recv(&mut rx).await.id, report.message.id);
    }
    wait_for_acks(&h.broker, "user-u2-queue", 1).await;
    assert_eq!(handler.calls(), 3);
    assert_eq!(h.broker.dead_letter_count("user-u2-queue").await, 0);
}

#[tokio::test]
async fn unparseable_payload_is_dead_lettered() {
    let h = harness();
    let (handler, mut rx) = ChannelHandler::new(0);
    let _subscription = h.relay.listen(&identity("u2"), handler.clone()).await.unwrap();

    h.broker
        .publish(EXCHANGE_NAME, &routing_key("u2"), b"{not json")
        .await
        .unwrap();
    let report = h.relay.send(&identity("u1"), "u2", "valid").await.unwrap();

    assert_eq!(recv(&mut rx).await, report.message);
    assert_eq!(h.broker.dead_letter_count(&queue_name("u2")).await, 1);
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn publish_failure_keeps_message_stored_and_reports_delivery_failed() {
    let store = Arc::new(InMemoryMessageStore::new());
    let hub = NotificationHub::new();
    let (connection, mut live_rx) = LiveConnection::new();
    hub.join(&connection, "u2");

    let broker = Arc::new(UnreachableBroker {
        inner: MemoryBroker::new(),
    });
    let relay = MessageRelay::new(
        store.clone(),
        Arc::new(BrokerHandle::from_broker(broker)),
        Arc::new(hub),
    );

    let report = relay.send(&identity("u1"), "u2", "hi").await.unwrap();

    assert!(matches!(report.published, Err(BrokerError::Unavailable(_))));
    let err = report.delivery_result().unwrap_err();
    assert!(matches!(err, RelayError::DeliveryFailed { message_id } if message_id == report.message.id));

    assert_eq!(report.notified_connections, 1);
    assert_eq!(live_rx.recv().await.unwrap().message, NEW_MESSAGE_NOTICE);
    assert_eq!(store.find_by_receiver("u2").await.unwrap(), vec![report.message]);
}

#[tokio::test]
async fn cancel_while_handler_blocked_requeues_delivery() {
    struct StuckHandler {
        tx: UnboundedSender<MessageRecord>,
    }

    #[async_trait]
    impl MessageHandler for StuckHandler {
        async fn on_message(&self, message: MessageRecord) -> anyhow::Result<()> {
            self.tx.send(message)?;
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    let h = harness();
    let (tx, mut rx) = unbounded_channel();
    let subscription = h
        .relay
        .listen(&identity("u2"), Arc::new(StuckHandler { tx }))
        .await
        .unwrap();

    h.relay.send(&identity("u1"), "u2", "first").await.unwrap();
    h.relay.send(&identity("u1"), "u2", "second").await.unwrap();
    assert_eq!(recv(&mut rx).await.content, "first");

    // One delivery in flight per queue: the second waits behind the stuck one
    assert_eq!(h.broker.unacked_count("user-u2-queue").await, 1);
    assert_eq!(h.broker.ready_count("user-u2-queue").await, 1);

    subscription.cancel().await.unwrap();
    assert_eq!(h.broker.unacked_count("user-u2-queue").await, 0);
    assert_eq!(h.broker.ready_count("user-u2-queue").await, 2);

    let (handler, mut rx) = ChannelHandler::new(0);
    let _subscription = h.relay.listen(&identity("u2"), handler).await.unwrap();
    assert_eq!(recv(&mut rx).await.content, "first");
    assert_eq!(recv(&mut rx).await.content, "second");
}
