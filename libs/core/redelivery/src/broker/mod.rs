//! Broker abstraction
//!
//! The consumer and policy only see these traits; [`redis`] binds them to
//! Redis Streams.

pub mod redis;

use crate::envelope::{Delivery, OutboundMessage};
use crate::error::{BrokerError, PublishError};
use crate::routing::Destination;
use async_trait::async_trait;

pub use self::redis::{RedisBroker, RedisBrokerConfig, RedisChannel};

/// Publishes messages with publisher-confirm semantics
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `message` to `destination`.
    ///
    /// Returns once the broker confirmed the message. With
    /// `wait_for_confirm` the broker must also report it durable.
    async fn publish(
        &self,
        destination: &Destination,
        message: &OutboundMessage,
        wait_for_confirm: bool,
    ) -> Result<(), PublishError>;
}

/// A subscription to one queue that can also publish
#[async_trait]
pub trait Channel: Publisher {
    /// Next delivery, or `None` when the queue stayed idle for one poll
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&mut self, tag: &str) -> Result<(), BrokerError>;

    /// Reject a delivery; with `requeue` it goes back on the queue
    async fn nack(&mut self, tag: &str, requeue: bool) -> Result<(), BrokerError>;

    /// Messages currently in the queue
    async fn depth(&mut self) -> Result<u64, BrokerError>;
}

/// Opens channels, one per consumer
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Channel: Channel + 'static;

    /// Subscribe to `queue` with at most `prefetch_limit` unsettled deliveries
    async fn open(&self, queue: &str, prefetch_limit: u16) -> Result<Self::Channel, BrokerError>;
}

/// Broker reachability, for readiness probes
#[async_trait]
pub trait Readiness: Send + Sync {
    async fn ping(&self) -> Result<(), BrokerError>;
}
