//! Durable exchange/queue channel carrying messages to their recipients.
//!
//! The topology is a single direct exchange ([`EXCHANGE_NAME`]) and one
//! durable queue per user, bound under that user's id. Queue name and routing
//! key are pure functions of the user id, so a message published for one user
//! can never land in another user's queue.
//!
//! Routing keys are not empty. Each queue is bound under its user id and every
//! publish carries the receiver's id, because an empty key on a direct
//! exchange would copy each message into every bound queue. External
//! consumers that bind their own queues must bind under the user id too.

pub mod memory;
pub mod redis_streams;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::{BrokerError, BrokerResult};

pub use self::memory::MemoryBroker;
pub use self::redis_streams::RedisBroker;

/// The one exchange every message goes through
pub const EXCHANGE_NAME: &str = "chat-exchange";

/// Durable queue holding `user_id`'s pending messages
pub fn queue_name(user_id: &str) -> String {
    format!("user-{}-queue", user_id)
}

/// Binding and publish key of `user_id`'s queue; never the empty string
pub fn routing_key(user_id: &str) -> String {
    user_id.to_string()
}

/// A message handed to a consumer, awaiting ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned id, unique per hand-out
    pub tag: String,
    pub queue: String,
    pub body: Vec<u8>,
    /// Set when this payload was handed out before and not acknowledged
    pub redelivered: bool,
}

/// AMQP-style broker operations used by the relay.
///
/// Declarations are idempotent: asserting an existing exchange or queue with
/// the same durability is a no-op, a different durability is a
/// [`BrokerError::PreconditionFailed`]. Exchanges are always direct.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn assert_exchange(&self, name: &str, durable: bool) -> BrokerResult<()>;

    async fn assert_queue(&self, name: &str, durable: bool) -> BrokerResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    /// Route `body` to every queue bound under `routing_key`. Unroutable
    /// messages are dropped.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> BrokerResult<()>;

    /// Register the single consumer of `queue`.
    ///
    /// Fails with [`BrokerError::ConsumerAlreadyRegistered`] while another
    /// consumer holds the queue.
    async fn consume(&self, queue: &str) -> BrokerResult<Box<dyn Consumer>>;

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()>;

    /// Give a delivery back. `requeue = false` dead-letters it.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> BrokerResult<()>;

    /// Release the consumer registration. Unacknowledged deliveries become
    /// available again.
    async fn cancel(&self, queue: &str, consumer_tag: &str) -> BrokerResult<()>;
}

/// Stream of deliveries for one registered consumer.
#[async_trait]
pub trait Consumer: Send {
    fn tag(&self) -> &str;

    fn queue(&self) -> &str;

    /// Wait for the next delivery. `None` once the consumer was cancelled.
    async fn next_delivery(&mut self) -> BrokerResult<Option<Delivery>>;
}

/// How the process-wide broker is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerConfig {
    Memory,
    Redis { url: String },
}

enum BrokerSource {
    Config(BrokerConfig),
    Instance(Arc<dyn Broker>),
}

/// Process-wide broker connection, initialised lazily and at most once.
///
/// Concurrent first callers of [`get`](Self::get) share one initialisation,
/// which also asserts [`EXCHANGE_NAME`].
pub struct BrokerHandle {
    source: BrokerSource,
    cell: OnceCell<Arc<dyn Broker>>,
}

impl BrokerHandle {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            source: BrokerSource::Config(config),
            cell: OnceCell::new(),
        }
    }

    /// Wrap an already connected broker; the exchange is still asserted on first use.
    pub fn from_broker(broker: Arc<dyn Broker>) -> Self {
        Self {
            source: BrokerSource::Instance(broker),
            cell: OnceCell::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get(&self) -> BrokerResult<Arc<dyn Broker>> {
        self.cell
            .get_or_try_init(|| self.initialize())
            .await
            .map(Arc::clone)
    }

    async fn initialize(&self) -> BrokerResult<Arc<dyn Broker>> {
        let broker: Arc<dyn Broker> = match &self.source {
            BrokerSource::Instance(broker) => broker.clone(),
            BrokerSource::Config(BrokerConfig::Memory) => Arc::new(MemoryBroker::new()),
            BrokerSource::Config(BrokerConfig::Redis { url }) => {
                Arc::new(RedisBroker::connect(url).await?)
            }
        };

        broker.assert_exchange(EXCHANGE_NAME, true).await?;
        info!(exchange = EXCHANGE_NAME, "Broker channel initialized");
        Ok(broker)
    }
}

impl From<BrokerConfig> for BrokerHandle {
    fn from(config: BrokerConfig) -> Self {
        Self::new(config)
    }
}

pub(crate) fn require_non_empty(value: &str, what: &str) -> BrokerResult<()> {
    if value.trim().is_empty() {
        return Err(BrokerError::PreconditionFailed(format!("{} name is empty", what)));
    }
    Ok(())
}
