//! In-process broker with AMQP delivery semantics.
//!
//! Queues survive for the lifetime of the broker value. Each queue hands out
//! at most one unacknowledged delivery at a time.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{require_non_empty, Broker, Consumer, Delivery};
use crate::error::{BrokerError, BrokerResult};

#[derive(Debug, Clone)]
struct Pending {
    body: Vec<u8>,
    redelivered: bool,
}

struct QueueState {
    durable: bool,
    ready: VecDeque<Pending>,
    /// delivery tag -> payload handed out
    unacked: HashMap<String, Pending>,
    consumer: Option<String>,
    dead_letters: Vec<Vec<u8>>,
    acked_total: u64,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumer: None,
            dead_letters: Vec::new(),
            acked_total: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Put every unacknowledged payload back at the head of the queue.
    fn requeue_unacked(&mut self) {
        for (_, mut pending) in self.unacked.drain() {
            pending.redelivered = true;
            self.ready.push_front(pending);
        }
    }
}

#[derive(Default)]
struct State {
    /// exchange name -> durable
    exchanges: HashMap<String, bool>,
    /// (exchange, routing key) -> bound queues
    bindings: HashMap<(String, String), HashSet<String>>,
    queues: HashMap<String, QueueState>,
    exchange_assertions: usize,
}

impl State {
    fn queue_mut(&mut self, name: &str) -> BrokerResult<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
    }

    fn take_unacked(&mut self, delivery: &Delivery) -> BrokerResult<(&mut QueueState, Pending)> {
        let queue = self.queue_mut(&delivery.queue)?;
        let pending = queue
            .unacked
            .remove(&delivery.tag)
            .ok_or_else(|| BrokerError::UnknownDelivery(delivery.tag.clone()))?;
        Ok((queue, pending))
    }
}

/// Broker kept entirely in memory. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().await.exchanges.contains_key(name)
    }

    /// Number of `assert_exchange` calls seen so far
    pub async fn exchange_assertions(&self) -> usize {
        self.state.lock().await.exchange_assertions
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting to be handed out
    pub async fn ready_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len()).await
    }

    pub async fn unacked_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.unacked.len()).await
    }

    pub async fn acked_total(&self, queue: &str) -> u64 {
        self.with_queue(queue, |q| q.acked_total).await
    }

    pub async fn dead_letter_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.dead_letters.len()).await
    }

    pub async fn has_consumer(&self, queue: &str) -> bool {
        self.with_queue(queue, |q| q.consumer.is_some()).await
    }

    async fn with_queue<T: Default>(&self, queue: &str, f: impl FnOnce(&QueueState) -> T) -> T {
        self.state.lock().await.queues.get(queue).map(f).unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn assert_exchange(&self, name: &str, durable: bool) -> BrokerResult<()> {
        require_non_empty(name, "exchange")?;
        let mut state = self.state.lock().await;
        state.exchange_assertions += 1;

        match state.exchanges.get(name) {
            Some(existing) if *existing != durable => Err(BrokerError::PreconditionFailed(
                format!("exchange '{}' already declared with durable={}", name, existing),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), durable);
                debug!(exchange = name, durable, "Exchange declared");
                Ok(())
            }
        }
    }

    async fn assert_queue(&self, name: &str, durable: bool) -> BrokerResult<()> {
        require_non_empty(name, "queue")?;
        let mut state = self.state.lock().await;

        match state.queues.get(name) {
            Some(existing) if existing.durable != durable => {
                Err(BrokerError::PreconditionFailed(format!(
                    "queue '{}' already declared with durable={}",
                    name, existing.durable
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(name.to_string(), QueueState::new(durable));
                debug!(queue = name, durable, "Queue declared");
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }

        state
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }

        let targets: Vec<String> = state
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default();

        if targets.is_empty() {
            warn!(exchange, routing_key, "Unroutable message dropped");
            return Ok(());
        }

        for name in targets {
            let queue = state.queue_mut(&name)?;
            queue.ready.push_back(Pending {
                body: body.to_vec(),
                redelivered: false,
            });
            queue.notify.notify_one();
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BrokerResult<Box<dyn Consumer>> {
        let mut state = self.state.lock().await;
        let queue_state = state.queue_mut(queue)?;

        if queue_state.consumer.is_some() {
            return Err(BrokerError::ConsumerAlreadyRegistered {
                queue: queue.to_string(),
            });
        }

        let tag = format!("ctag-{}", Uuid::new_v4());
        queue_state.consumer = Some(tag.clone());
        let notify = queue_state.notify.clone();

        Ok(Box::new(MemoryConsumer {
            state: self.state.clone(),
            queue: queue.to_string(),
            tag,
            notify,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        let (queue, _) = state.take_unacked(delivery)?;
        queue.acked_total += 1;
        queue.notify.notify_one();
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        let (queue, mut pending) = state.take_unacked(delivery)?;

        if requeue {
            pending.redelivered = true;
            queue.ready.push_front(pending);
        } else {
            queue.dead_letters.push(pending.body);
        }
        queue.notify.notify_one();
        Ok(())
    }

    async fn cancel(&self, queue: &str, consumer_tag: &str) -> BrokerResult<()> {
        let mut state = self.state.lock().await;
        let queue_state = state.queue_mut(queue)?;

        if queue_state.consumer.as_deref() == Some(consumer_tag) {
            queue_state.consumer = None;
            queue_state.requeue_unacked();
            queue_state.notify.notify_one();
            debug!(queue, consumer_tag, "Consumer cancelled");
        }
        Ok(())
    }
}

struct MemoryConsumer {
    state: Arc<Mutex<State>>,
    queue: String,
    tag: String,
    notify: Arc<Notify>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn next_delivery(&mut self) -> BrokerResult<Option<Delivery>> {
        loop {
            {
                let mut state = self.state.lock().await;
                let queue = state.queue_mut(&self.queue)?;

                if queue.consumer.as_deref() != Some(self.tag.as_str()) {
                    return Ok(None);
                }

                // prefetch of one
                if queue.unacked.is_empty() {
                    if let Some(pending) = queue.ready.pop_front() {
                        let tag = Uuid::new_v4().to_string();
                        queue.unacked.insert(tag.clone(), pending.clone());
                        return Ok(Some(Delivery {
                            tag,
                            queue: self.queue.clone(),
                            body: pending.body,
                            redelivered: pending.redelivered,
                        }));
                    }
                }
            }

            self.notify.notified().await;
        }
    }
}
