//! Send and listen orchestration over the message store, the broker channel
//! and the live notification channel.

use async_trait::async_trait;
use jwt_security::AuthenticatedIdentity;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{
    queue_name, routing_key, Broker, BrokerHandle, Consumer, Delivery, EXCHANGE_NAME,
};
use crate::error::{BrokerError, BrokerResult, RelayError, RelayResult};
use crate::metrics::{self, DeliveryOutcome};
use crate::models::{MessageRecord, NewMessage};
use crate::notification::Notifier;
use crate::services::MessageStore;

/// Live notification text pushed on every send
pub const NEW_MESSAGE_NOTICE: &str = "You have a new message.";

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const CONSUMER_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Callback invoked once per delivered message.
///
/// Returning `Ok` acknowledges the delivery. Returning `Err` hands it back to
/// the broker for redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: MessageRecord) -> anyhow::Result<()>;
}

/// Handler that only logs what it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn on_message(&self, message: MessageRecord) -> anyhow::Result<()> {
        info!(
            message_id = %message.id,
            sender_id = %message.sender_id,
            receiver_id = %message.receiver_id,
            "Message received"
        );
        Ok(())
    }
}

/// Outcome of [`MessageRelay::send`]. The message is always stored; the
/// broker publish and the live notification are reported separately.
#[derive(Debug)]
pub struct SendReport {
    pub message: MessageRecord,
    pub published: Result<(), BrokerError>,
    /// Live connections that received the notice
    pub notified_connections: usize,
}

impl SendReport {
    /// Collapse a failed publish into [`RelayError::DeliveryFailed`].
    pub fn delivery_result(&self) -> RelayResult<&MessageRecord> {
        match self.published {
            Ok(()) => Ok(&self.message),
            Err(_) => Err(RelayError::DeliveryFailed {
                message_id: self.message.id,
            }),
        }
    }
}

/// Running consumer for one user's queue.
///
/// Dropping the value detaches the consumer, which keeps running for the
/// life of the process; call [`cancel`](Self::cancel) to stop it.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    shutdown: Arc<Notify>,
    task: JoinHandle<BrokerResult<()>>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Stop consuming and release the queue. A delivery whose handler is
    /// still running is left unacknowledged and becomes available again.
    pub async fn cancel(self) -> RelayResult<()> {
        self.shutdown.notify_one();
        match self.task.await {
            Ok(result) => result.map_err(RelayError::from),
            Err(join_err) => Err(BrokerError::ConsumerTask(join_err.to_string()).into()),
        }
    }
}

pub struct MessageRelay {
    store: Arc<dyn MessageStore>,
    broker: Arc<BrokerHandle>,
    notifier: Arc<dyn Notifier>,
    retry_backoff: Duration,
}

impl MessageRelay {
    pub fn new(
        store: Arc<dyn MessageStore>,
        broker: Arc<BrokerHandle>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            broker,
            notifier,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Delay before a failed delivery is handed back to the broker.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Store a message, publish it to the receiver's queue and notify the
    /// receiver's live connections.
    ///
    /// Only a store failure aborts the send. Publish and notify outcomes are
    /// carried in the [`SendReport`].
    pub async fn send(
        &self,
        sender: &AuthenticatedIdentity,
        receiver_id: &str,
        content: &str,
    ) -> RelayResult<SendReport> {
        if receiver_id.trim().is_empty() {
            return Err(RelayError::Validation("receiver id is required".to_string()));
        }
        if content.trim().is_empty() {
            return Err(RelayError::Validation("message content is empty".to_string()));
        }

        let message = self
            .store
            .create(NewMessage {
                sender_id: sender.user_id.clone(),
                receiver_id: receiver_id.to_string(),
                content: content.to_string(),
            })
            .await?;
        metrics::record_message_persisted();

        let published = self.publish(&message).await;
        metrics::record_publish(published.is_ok());
        match &published {
            Ok(()) => debug!(message_id = %message.id, receiver_id, "Message published"),
            Err(err) => warn!(
                message_id = %message.id,
                receiver_id,
                error = %err,
                "Message stored but not published"
            ),
        }

        let notified_connections = self.notifier.notify(receiver_id, NEW_MESSAGE_NOTICE).await;

        Ok(SendReport {
            message,
            published,
            notified_connections,
        })
    }

    async fn publish(&self, message: &MessageRecord) -> BrokerResult<()> {
        let body = serde_json::to_vec(message)?;
        let broker = self.broker.get().await?;
        broker
            .publish(EXCHANGE_NAME, &routing_key(&message.receiver_id), &body)
            .await
    }

    /// Declare the caller's queue and start delivering its messages to
    /// `handler`, one at a time.
    pub async fn listen(
        &self,
        identity: &AuthenticatedIdentity,
        handler: Arc<dyn MessageHandler>,
    ) -> RelayResult<Subscription> {
        let broker = self.broker.get().await?;
        let queue = queue_name(&identity.user_id);

        broker.assert_exchange(EXCHANGE_NAME, true).await?;
        broker.assert_queue(&queue, true).await?;
        broker
            .bind_queue(&queue, EXCHANGE_NAME, &routing_key(&identity.user_id))
            .await?;

        let consumer = broker.consume(&queue).await?;
        let consumer_tag = consumer.tag().to_string();
        let shutdown = Arc::new(Notify::new());

        info!(user_id = %identity.user_id, queue = %queue, consumer_tag = %consumer_tag, "Listening for messages");

        let task = tokio::spawn(consume_loop(
            broker,
            consumer,
            handler,
            shutdown.clone(),
            self.retry_backoff,
        ));

        Ok(Subscription {
            queue,
            consumer_tag,
            shutdown,
            task,
        })
    }

    /// Stored messages addressed to the caller, oldest first. Bypasses the broker.
    pub async fn inbox(&self, identity: &AuthenticatedIdentity) -> RelayResult<Vec<MessageRecord>> {
        Ok(self.store.find_by_receiver(&identity.user_id).await?)
    }
}

async fn consume_loop(
    broker: Arc<dyn Broker>,
    mut consumer: Box<dyn Consumer>,
    handler: Arc<dyn MessageHandler>,
    shutdown: Arc<Notify>,
    retry_backoff: Duration,
) -> BrokerResult<()> {
    let queue = consumer.queue().to_string();
    let tag = consumer.tag().to_string();

    loop {
        let next = tokio::select! {
            _ = shutdown.notified() => break,
            next = consumer.next_delivery() => next,
        };

        let delivery = match next {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                info!(queue = %queue, consumer_tag = %tag, "Consumer closed by broker");
                break;
            }
            Err(err) => {
                error!(queue = %queue, error = %err, "Failed to read from queue");
                tokio::time::sleep(CONSUMER_ERROR_BACKOFF).await;
                continue;
            }
        };

        tokio::select! {
            _ = shutdown.notified() => break,
            _ = process_delivery(broker.as_ref(), handler.as_ref(), delivery, retry_backoff) => {}
        }
    }

    broker.cancel(&queue, &tag).await
}

async fn process_delivery(
    broker: &dyn Broker,
    handler: &dyn MessageHandler,
    delivery: Delivery,
    retry_backoff: Duration,
) {
    let message: MessageRecord = match serde_json::from_slice(&delivery.body) {
        Ok(message) => message,
        Err(err) => {
            warn!(queue = %delivery.queue, error = %err, "Dead-lettering unparseable payload");
            if let Err(err) = broker.nack(&delivery, false).await {
                error!(queue = %delivery.queue, error = %err, "Failed to dead-letter delivery");
            }
            metrics::record_delivery(DeliveryOutcome::DeadLettered);
            return;
        }
    };
    let message_id = message.id;

    match handler.on_message(message).await {
        Ok(()) => {
            if let Err(err) = broker.ack(&delivery).await {
                error!(message_id = %message_id, error = %err, "Failed to acknowledge delivery");
                return;
            }
            metrics::record_delivery(DeliveryOutcome::Acked);
        }
        Err(err) => {
            warn!(
                message_id = %message_id,
                redelivered = delivery.redelivered,
                error = %err,
                "Handler failed, requeueing delivery"
            );
            tokio::time::sleep(retry_backoff).await;
            if let Err(err) = broker.nack(&delivery, true).await {
                error!(message_id = %message_id, error = %err, "Failed to requeue delivery");
                return;
            }
            metrics::record_delivery(DeliveryOutcome::Requeued);
        }
    }
}
