//! Redis Streams binding
//!
//! A DLQ is a stream read through a consumer group. Entry layout:
//!
//! | Field | Content |
//! |-------|---------|
//! | `envelope` | JSON envelope bytes |
//! | `routing_key` | routing key, informational |
//! | anything else | message headers |
//!
//! Settled entries are acked and deleted so `XLEN` is the queue depth.
//! Entries another consumer left pending longer than `claim_idle_time`
//! are taken over with `XAUTOCLAIM` (Redis 7+).

use super::{Broker, Channel, Publisher, Readiness};
use crate::envelope::{
    DELIVERY_ATTEMPT_HEADER, Delivery, FIRST_SEEN_HEADER, Headers, OutboundMessage,
};
use crate::error::{BrokerError, PublishError};
use crate::routing::Destination;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Body field of a stream entry
pub const ENVELOPE_FIELD: &str = "envelope";

/// Routing key field of a stream entry
pub const ROUTING_KEY_FIELD: &str = "routing_key";

// XREADGROUP reply: streams -> entries -> fields (nil for deleted entries)
type StreamFields = Vec<(String, Vec<u8>)>;
type StreamEntries = Vec<(String, Option<StreamFields>)>;
type ReadGroupReply = Option<Vec<(String, StreamEntries)>>;
// XAUTOCLAIM reply: next cursor, claimed entries, ids deleted while pending
type AutoClaimReply = (String, StreamEntries, Vec<String>);

/// Redis Streams broker settings
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Consumer group shared by all daemon instances
    pub consumer_group: String,

    /// This instance's consumer name within the group
    pub consumer_name: String,

    /// Wait between reads while a DLQ is empty
    pub poll_interval: Duration,

    /// Pending entries idle this long are claimed from whichever consumer holds them
    pub claim_idle_time: Duration,

    /// Replicas that must acknowledge a confirmed publish (0 = primary only)
    pub min_replicas: u32,

    /// Timeout passed to `WAIT`
    pub replica_timeout: Duration,

    /// Approximate cap for republished streams
    pub max_stream_length: u64,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            consumer_group: "redelivery".to_string(),
            consumer_name: format!("redelivery-{}", std::process::id()),
            poll_interval: Duration::from_millis(1000),
            claim_idle_time: Duration::from_secs(30),
            min_replicas: 0,
            replica_timeout: Duration::from_secs(1),
            max_stream_length: 100_000,
        }
    }
}

/// Redis Streams broker
#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    manager: ConnectionManager,
    config: Arc<RedisBrokerConfig>,
}

impl RedisBroker {
    /// Connect and verify with `PING`
    pub async fn connect(url: &str, config: RedisBrokerConfig) -> Result<Self, BrokerError> {
        info!(consumer_group = %config.consumer_group, "Connecting to Redis broker");

        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;

        let broker = Self {
            client,
            manager,
            config: Arc::new(config),
        };
        broker.ping().await?;

        info!("Connected to Redis broker");
        Ok(broker)
    }

    /// Shared connection, for collaborators such as the parking lot
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub fn config(&self) -> &RedisBrokerConfig {
        &self.config
    }
}

#[async_trait]
impl Broker for RedisBroker {
    type Channel = RedisChannel;

    async fn open(&self, queue: &str, prefetch_limit: u16) -> Result<RedisChannel, BrokerError> {
        // Own connection per channel
        let conn = ConnectionManager::new(self.client.clone()).await?;

        let mut channel = RedisChannel {
            conn,
            stream: queue.to_string(),
            config: self.config.clone(),
            prefetch_limit: prefetch_limit.max(1),
            buffer: VecDeque::new(),
            in_flight: HashMap::new(),
            draining_pending: true,
            last_claim: None,
        };
        channel.ensure_group().await?;
        channel.claim_abandoned().await?;

        debug!(
            stream = %queue,
            group = %self.config.consumer_group,
            consumer = %self.config.consumer_name,
            prefetch_limit,
            "Opened channel"
        );
        Ok(channel)
    }
}

#[async_trait]
impl Readiness for RedisBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Consumer-group subscription to one DLQ stream
pub struct RedisChannel {
    conn: ConnectionManager,
    stream: String,
    config: Arc<RedisBrokerConfig>,
    prefetch_limit: u16,
    buffer: VecDeque<Delivery>,
    in_flight: HashMap<String, Delivery>,
    // Entries left pending by a previous run are read before new ones
    draining_pending: bool,
    last_claim: Option<Instant>,
}

impl RedisChannel {
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Create the consumer group if it doesn't exist
    async fn ensure_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(
                    stream = %self.stream,
                    group = %self.config.consumer_group,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Take over entries that sat unacked for at least `claim_idle_time`
    ///
    /// Covers consumers that died or restarted under another name, and
    /// this consumer's own entries whose ack failed.
    async fn claim_abandoned(&mut self) -> Result<usize, BrokerError> {
        self.last_claim = Some(Instant::now());
        let mut conn = self.conn.clone();

        let result: RedisResult<AutoClaimReply> = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_name)
            .arg(self.config.claim_idle_time.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(self.prefetch_limit)
            .query_async(&mut conn)
            .await;

        let (_cursor, entries, deleted) = match result {
            Ok(reply) => reply,
            Err(e) if e.to_string().contains("NOGROUP") => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        for id in deleted {
            debug!(stream = %self.stream, stream_id = %id, "Claimed entry was deleted");
            self.settle(&id).await?;
        }

        let mut claimed = 0usize;
        for (id, fields) in entries {
            if self.buffer.iter().any(|d| d.tag == id) {
                continue;
            }
            match fields {
                Some(fields) => {
                    self.buffer.push_back(parse_entry(id, fields));
                    claimed += 1;
                }
                None => self.settle(&id).await?,
            }
        }

        if claimed > 0 {
            warn!(stream = %self.stream, count = claimed, "Claimed abandoned deliveries");
        }
        Ok(claimed)
    }

    fn claim_due(&self) -> bool {
        self.last_claim
            .is_none_or(|at| at.elapsed() >= self.config.claim_idle_time)
    }

    /// Fill the buffer with the next batch
    async fn fetch(&mut self) -> Result<(), BrokerError> {
        if self.claim_due() && self.claim_abandoned().await? > 0 {
            return Ok(());
        }

        let cursor = if self.draining_pending { "0" } else { ">" };
        let mut conn = self.conn.clone();

        let result: RedisResult<ReadGroupReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_name)
            .arg("COUNT")
            .arg(self.prefetch_limit)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(cursor)
            .query_async(&mut conn)
            .await;

        let streams = match result {
            Ok(reply) => reply.unwrap_or_default(),
            Err(e) if e.to_string().contains("NOGROUP") => {
                warn!(stream = %self.stream, "Consumer group vanished, recreating");
                self.ensure_group().await?;
                self.draining_pending = true;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut fetched = 0usize;
        for (_stream, entries) in streams {
            for (id, fields) in entries {
                fetched += 1;
                match fields {
                    Some(fields) => self.buffer.push_back(parse_entry(id, fields)),
                    None => {
                        // Deleted while pending; nothing left to deliver
                        debug!(stream = %self.stream, stream_id = %id, "Dropping deleted pending entry");
                        self.settle(&id).await?;
                    }
                }
            }
        }

        if self.draining_pending && fetched == 0 {
            self.draining_pending = false;
        }
        Ok(())
    }

    /// `XACK` + `XDEL` in one transaction
    async fn settle(&self, tag: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.config.consumer_group)
            .arg(tag)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream)
            .arg(tag)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Copy the delivery to the stream tail with the attempt bumped, then settle the original
    async fn requeue(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut headers = delivery.headers.clone();
        headers.insert(
            DELIVERY_ATTEMPT_HEADER.to_string(),
            delivery.delivery_attempt.saturating_add(1).to_string(),
        );
        headers.insert(
            FIRST_SEEN_HEADER.to_string(),
            delivery.first_seen_at.to_rfc3339(),
        );

        let mut pipe = redis::pipe();
        pipe.atomic();
        {
            let xadd = pipe.cmd("XADD").arg(&self.stream).arg("*");
            xadd.arg(ENVELOPE_FIELD).arg(delivery.body.as_slice());
            for (key, value) in &headers {
                xadd.arg(key).arg(value);
            }
            xadd.ignore();
        }
        pipe.cmd("XACK")
            .arg(&self.stream)
            .arg(&self.config.consumer_group)
            .arg(&delivery.tag)
            .ignore()
            .cmd("XDEL")
            .arg(&self.stream)
            .arg(&delivery.tag)
            .ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for RedisChannel {
    async fn publish(
        &self,
        destination: &Destination,
        message: &OutboundMessage,
        wait_for_confirm: bool,
    ) -> Result<(), PublishError> {
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&destination.exchange)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.max_stream_length)
            .arg("*")
            .arg(ENVELOPE_FIELD)
            .arg(message.body.as_slice())
            .arg(ROUTING_KEY_FIELD)
            .arg(&destination.routing_key);
        for (key, value) in &message.headers {
            cmd.arg(key).arg(value);
        }

        let entry_id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(BrokerError::from)?;

        if wait_for_confirm && self.config.min_replicas > 0 {
            let acked: u32 = redis::cmd("WAIT")
                .arg(self.config.min_replicas)
                .arg(self.config.replica_timeout.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(BrokerError::from)?;

            if acked < self.config.min_replicas {
                return Err(PublishError::Rejected(format!(
                    "{acked}/{} replicas acknowledged {entry_id}",
                    self.config.min_replicas
                )));
            }
        }

        debug!(destination = %destination, entry_id = %entry_id, "Published");
        Ok(())
    }
}

#[async_trait]
impl Channel for RedisChannel {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        if self.buffer.is_empty() {
            self.fetch().await?;
        }

        match self.buffer.pop_front() {
            Some(delivery) => {
                self.in_flight.insert(delivery.tag.clone(), delivery.clone());
                Ok(Some(delivery))
            }
            None => {
                if !self.draining_pending {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Ok(None)
            }
        }
    }

    async fn ack(&mut self, tag: &str) -> Result<(), BrokerError> {
        self.in_flight.remove(tag);
        self.settle(tag).await
    }

    async fn nack(&mut self, tag: &str, requeue: bool) -> Result<(), BrokerError> {
        let delivery = self.in_flight.remove(tag);
        match (requeue, delivery) {
            (true, Some(delivery)) => self.requeue(&delivery).await,
            (true, None) => Err(BrokerError::Protocol(format!(
                "cannot requeue unknown delivery {tag}"
            ))),
            (false, _) => self.settle(tag).await,
        }
    }

    async fn depth(&mut self) -> Result<u64, BrokerError> {
        let mut conn = self.conn.clone();
        let len: u64 = redis::cmd("XLEN")
            .arg(&self.stream)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }
}

/// Turn stream fields into a delivery
fn parse_entry(id: String, fields: StreamFields) -> Delivery {
    let mut body = Vec::new();
    let mut headers = Headers::new();

    for (key, value) in fields {
        match key.as_str() {
            ENVELOPE_FIELD => body = value,
            ROUTING_KEY_FIELD => {}
            _ => {
                headers.insert(key, String::from_utf8_lossy(&value).into_owned());
            }
        }
    }

    let received_at = entry_timestamp(&id).unwrap_or_else(Utc::now);
    Delivery::new(id, body, headers, received_at)
}

/// Millisecond timestamp encoded in a stream entry id (`<ms>-<seq>`)
pub fn entry_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let millis = id.split_once('-').map_or(id, |(ms, _)| ms);
    millis
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}
