//! Redis Streams realisation of the broker
//!
//! - exchange: hash `broker:exchange:<name>` (kind, durable)
//! - queue: stream `<queue>` with consumer group [`CONSUMER_GROUP`]
//! - binding: set `broker:exchange:<name>:bindings:<routing-key>`
//! - ack: XACK then XDEL, in one script
//! - requeue / dead-letter: XACK, XADD a copy flagged redelivered, XDEL, in
//!   one script
//! - dead letters: stream `<queue>:dead`
//! - single consumer: `SET broker:consumer:<queue> <tag> NX PX <ttl>`, kept
//!   alive by a background task for as long as the consumer exists
//!
//! Entries a crashed consumer read but never acknowledged stay in the group's
//! pending list and are handed out again, flagged redelivered, before new ones.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamReadReply};
use redis::{Client, RedisError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{require_non_empty, Broker, Consumer, Delivery};
use crate::error::{BrokerError, BrokerResult};

/// Consumer group every queue stream is read through
pub const CONSUMER_GROUP: &str = "chat-relay";

/// Group member name; one consumer per queue, so a fixed name lets a new
/// consumer pick up its predecessor's pending entries
const CONSUMER_NAME: &str = "relay";

const DEFAULT_CONSUMER_LOCK_TTL: Duration = Duration::from_secs(30);
const READ_BLOCK_MS: u64 = 2000;

const FIELD_BODY: &str = "body";
const FIELD_REDELIVERED: &str = "redelivered";

const REFRESH_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

// KEYS[1] queue; ARGV group, entry id
const ACK_SCRIPT: &str = r#"
local acked = redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
if acked == 1 then
    redis.call('XDEL', KEYS[1], ARGV[2])
end
return acked
"#;

// KEYS[1] queue, KEYS[2] target stream; ARGV group, entry id, body field,
// body, redelivered field
const SETTLE_SCRIPT: &str = r#"
local acked = redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
if acked == 0 then
    return 0
end
redis.call('XADD', KEYS[2], '*', ARGV[3], ARGV[4], ARGV[5], '1')
redis.call('XDEL', KEYS[1], ARGV[2])
return 1
"#;

fn exchange_key(name: &str) -> String {
    format!("broker:exchange:{}", name)
}

fn queue_meta_key(name: &str) -> String {
    format!("broker:queue:{}", name)
}

fn binding_key(exchange: &str, routing_key: &str) -> String {
    format!("broker:exchange:{}:bindings:{}", exchange, routing_key)
}

fn consumer_lock_key(queue: &str) -> String {
    format!("broker:consumer:{}", queue)
}

fn dead_letter_key(queue: &str) -> String {
    format!("{}:dead", queue)
}

fn durable_flag(durable: bool) -> &'static str {
    if durable {
        "1"
    } else {
        "0"
    }
}

fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP")
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().max(1) as u64
}

/// Compare a stored declaration against the requested one.
fn check_declared(
    what: &str,
    stored_durable: Option<&str>,
    stored_kind: Option<&str>,
    durable: bool,
    kind: &str,
) -> BrokerResult<()> {
    if stored_kind != Some(kind) {
        return Err(BrokerError::PreconditionFailed(format!(
            "{} already declared with kind={}",
            what,
            stored_kind.unwrap_or_default()
        )));
    }
    if stored_durable != Some(durable_flag(durable)) {
        return Err(BrokerError::PreconditionFailed(format!(
            "{} already declared with durable={}",
            what,
            stored_durable.unwrap_or_default()
        )));
    }
    Ok(())
}

/// Declare `key` with the given durability and kind unless it exists; any
/// difference from the stored declaration is a precondition failure.
async fn declare(
    conn: &mut ConnectionManager,
    key: &str,
    kind: &str,
    durable: bool,
    what: &str,
) -> BrokerResult<()> {
    let _: bool = redis::cmd("HSETNX")
        .arg(key)
        .arg("durable")
        .arg(durable_flag(durable))
        .query_async(conn)
        .await?;
    let _: bool = redis::cmd("HSETNX")
        .arg(key)
        .arg("kind")
        .arg(kind)
        .query_async(conn)
        .await?;

    let (stored_durable, stored_kind): (Option<String>, Option<String>) = redis::cmd("HMGET")
        .arg(key)
        .arg("durable")
        .arg("kind")
        .query_async(conn)
        .await?;

    check_declared(
        what,
        stored_durable.as_deref(),
        stored_kind.as_deref(),
        durable,
        kind,
    )
}

async fn exists(conn: &mut ConnectionManager, key: &str) -> BrokerResult<bool> {
    let count: i64 = redis::cmd("EXISTS").arg(key).query_async(conn).await?;
    Ok(count > 0)
}

async fn xadd(conn: &mut ConnectionManager, stream: &str, body: &[u8]) -> BrokerResult<String> {
    let id: String = redis::cmd("XADD")
        .arg(stream)
        .arg("*")
        .arg(FIELD_BODY)
        .arg(body)
        .arg(FIELD_REDELIVERED)
        .arg(durable_flag(false))
        .query_async(conn)
        .await?;
    Ok(id)
}

/// Extend `queue`'s consumer lock if `tag` still owns it.
async fn refresh_lock(
    conn: &mut ConnectionManager,
    queue: &str,
    tag: &str,
    ttl: Duration,
) -> BrokerResult<bool> {
    let refreshed: i64 = redis::cmd("EVAL")
        .arg(REFRESH_LOCK_SCRIPT)
        .arg(1)
        .arg(consumer_lock_key(queue))
        .arg(tag)
        .arg(millis(ttl))
        .query_async(conn)
        .await?;
    Ok(refreshed == 1)
}

async fn release_lock(conn: &mut ConnectionManager, queue: &str, tag: &str) -> BrokerResult<bool> {
    let released: i64 = redis::cmd("EVAL")
        .arg(RELEASE_LOCK_SCRIPT)
        .arg(1)
        .arg(consumer_lock_key(queue))
        .arg(tag)
        .query_async(conn)
        .await?;
    Ok(released == 1)
}

/// Background refresh of a consumer lock. Aborted when dropped.
struct LockKeepalive {
    handle: JoinHandle<()>,
}

impl LockKeepalive {
    fn spawn(mut conn: ConnectionManager, queue: String, tag: String, ttl: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl / 3);
            // first tick completes immediately; the lock was just taken
            interval.tick().await;

            loop {
                interval.tick().await;
                match refresh_lock(&mut conn, &queue, &tag, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(queue = %queue, consumer_tag = %tag, "Consumer lock no longer held");
                        break;
                    }
                    Err(e) => {
                        warn!(queue = %queue, consumer_tag = %tag, error = %e, "Failed to refresh consumer lock");
                    }
                }
            }
        });

        Self { handle }
    }
}

impl Drop for LockKeepalive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Broker backed by Redis Streams consumer groups.
#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
    lock_ttl: Duration,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> BrokerResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!("Redis broker connection established");
        Ok(Self {
            client,
            conn,
            lock_ttl: DEFAULT_CONSUMER_LOCK_TTL,
        })
    }

    /// How long a consumer lock survives without its keepalive, e.g. after the
    /// owning process dies. Refreshed every third of this period.
    pub fn with_consumer_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl.max(Duration::from_millis(3));
        self
    }

    /// Entries currently stored in `queue`, handed out or not
    pub async fn queue_len(&self, queue: &str) -> BrokerResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("XLEN").arg(queue).query_async(&mut conn).await?;
        Ok(len)
    }

    /// Entries dead-lettered from `queue`
    pub async fn dead_letter_len(&self, queue: &str) -> BrokerResult<usize> {
        self.queue_len(&dead_letter_key(queue)).await
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn assert_exchange(&self, name: &str, durable: bool) -> BrokerResult<()> {
        require_non_empty(name, "exchange")?;
        let mut conn = self.conn.clone();
        declare(
            &mut conn,
            &exchange_key(name),
            "direct",
            durable,
            &format!("exchange '{}'", name),
        )
        .await
    }

    async fn assert_queue(&self, name: &str, durable: bool) -> BrokerResult<()> {
        require_non_empty(name, "queue")?;
        let mut conn = self.conn.clone();
        declare(
            &mut conn,
            &queue_meta_key(name),
            "stream",
            durable,
            &format!("queue '{}'", name),
        )
        .await?;

        let created: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(name)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                debug!(queue = name, "Queue stream and consumer group created");
                Ok(())
            }
            Err(err) if is_busy_group(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        if !exists(&mut conn, &exchange_key(exchange)).await? {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }
        if !exists(&mut conn, &queue_meta_key(queue)).await? {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }

        let _: i64 = redis::cmd("SADD")
            .arg(binding_key(exchange, routing_key))
            .arg(queue)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        if !exists(&mut conn, &exchange_key(exchange)).await? {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }

        let queues: Vec<String> = redis::cmd("SMEMBERS")
            .arg(binding_key(exchange, routing_key))
            .query_async(&mut conn)
            .await?;

        if queues.is_empty() {
            warn!(exchange, routing_key, "Unroutable message dropped");
            return Ok(());
        }

        for queue in queues {
            let entry_id = xadd(&mut conn, &queue, body).await?;
            debug!(queue = %queue, entry_id = %entry_id, "Message enqueued");
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BrokerResult<Box<dyn Consumer>> {
        let mut conn = self.conn.clone();
        if !exists(&mut conn, &queue_meta_key(queue)).await? {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }

        // opened before the lock is taken so a failure here leaves nothing held;
        // BLOCK reads must not stall the shared connection
        let read_conn = self.client.get_multiplexed_async_connection().await?;

        let tag = format!("ctag-{}", Uuid::new_v4());
        let acquired: Option<String> = redis::cmd("SET")
            .arg(consumer_lock_key(queue))
            .arg(&tag)
            .arg("NX")
            .arg("PX")
            .arg(millis(self.lock_ttl))
            .query_async(&mut conn)
            .await?;

        if acquired.is_none() {
            return Err(BrokerError::ConsumerAlreadyRegistered {
                queue: queue.to_string(),
            });
        }

        let keepalive =
            LockKeepalive::spawn(self.conn.clone(), queue.to_string(), tag.clone(), self.lock_ttl);

        Ok(Box::new(RedisConsumer {
            conn: read_conn,
            queue: queue.to_string(),
            tag,
            draining_pending: true,
            _keepalive: keepalive,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let acked: i64 = redis::cmd("EVAL")
            .arg(ACK_SCRIPT)
            .arg(1)
            .arg(&delivery.queue)
            .arg(CONSUMER_GROUP)
            .arg(&delivery.tag)
            .query_async(&mut conn)
            .await?;

        if acked == 0 {
            return Err(BrokerError::UnknownDelivery(delivery.tag.clone()));
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> BrokerResult<()> {
        let target = if requeue {
            delivery.queue.clone()
        } else {
            dead_letter_key(&delivery.queue)
        };

        let mut conn = self.conn.clone();
        let settled: i64 = redis::cmd("EVAL")
            .arg(SETTLE_SCRIPT)
            .arg(2)
            .arg(&delivery.queue)
            .arg(&target)
            .arg(CONSUMER_GROUP)
            .arg(&delivery.tag)
            .arg(FIELD_BODY)
            .arg(delivery.body.as_slice())
            .arg(FIELD_REDELIVERED)
            .query_async(&mut conn)
            .await?;

        if settled == 0 {
            return Err(BrokerError::UnknownDelivery(delivery.tag.clone()));
        }
        Ok(())
    }

    async fn cancel(&self, queue: &str, consumer_tag: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let released = release_lock(&mut conn, queue, consumer_tag).await?;
        debug!(queue, consumer_tag, released, "Consumer released");
        Ok(())
    }
}

struct RedisConsumer {
    conn: MultiplexedConnection,
    queue: String,
    tag: String,
    /// Still replaying entries read but not acknowledged by an earlier consumer
    draining_pending: bool,
    _keepalive: LockKeepalive,
}

impl RedisConsumer {
    async fn still_owner(&mut self) -> BrokerResult<bool> {
        let owner: Option<String> = redis::cmd("GET")
            .arg(consumer_lock_key(&self.queue))
            .query_async(&mut self.conn)
            .await?;
        Ok(owner.as_deref() == Some(self.tag.as_str()))
    }

    async fn read(&mut self, start_id: &str, block: bool) -> BrokerResult<Option<StreamId>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(CONSUMER_GROUP)
            .arg(CONSUMER_NAME)
            .arg("COUNT")
            .arg(1);
        if block {
            cmd.arg("BLOCK").arg(READ_BLOCK_MS);
        }
        cmd.arg("STREAMS").arg(&self.queue).arg(start_id);

        let reply: Option<StreamReadReply> = cmd.query_async(&mut self.conn).await?;
        Ok(reply.and_then(|reply| {
            reply
                .keys
                .into_iter()
                .flat_map(|key| key.ids.into_iter())
                .next()
        }))
    }

    fn to_delivery(&self, entry: StreamId, from_pending: bool) -> Delivery {
        let body: Vec<u8> = entry.get(FIELD_BODY).unwrap_or_default();
        let flagged = entry
            .get::<String>(FIELD_REDELIVERED)
            .map(|v| v == "1")
            .unwrap_or(false);

        Delivery {
            tag: entry.id,
            queue: self.queue.clone(),
            body,
            redelivered: from_pending || flagged,
        }
    }
}

#[async_trait]
impl Consumer for RedisConsumer {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn next_delivery(&mut self) -> BrokerResult<Option<Delivery>> {
        loop {
            if !self.still_owner().await? {
                warn!(queue = %self.queue, consumer_tag = %self.tag, "Consumer lock lost");
                return Ok(None);
            }

            if self.draining_pending {
                match self.read("0", false).await? {
                    Some(entry) => return Ok(Some(self.to_delivery(entry, true))),
                    None => self.draining_pending = false,
                }
            }

            if let Some(entry) = self.read(">", true).await? {
                return Ok(Some(self.to_delivery(entry, false)));
            }
        }
    }
}
