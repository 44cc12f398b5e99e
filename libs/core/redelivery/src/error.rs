//! Error taxonomy for the redelivery engine
//!
//! Errors are split by where they are handled:
//! - **BrokerError**: channel-level failures; connection errors trigger a reconnect
//! - **PublishError**: a republish was not confirmed; counted as a processing failure
//! - **DecodeError**: malformed envelope; the message is parked, never retried
//! - **SinkError**: the permanent-failure sink could not store a message
//! - **RedeliveryError**: why a message ended up `Failed`
//! - **ConsumerError**: fatal to one consumer run; the supervisor restarts it

use std::time::Duration;
use thiserror::Error;

/// Broker channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker unreachable or the connection dropped
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The broker answered, but not in a way we can use
    #[error("broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    pub fn is_connection(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            BrokerError::Connection(err.to_string())
        } else {
            BrokerError::Protocol(err.to_string())
        }
    }
}

/// Republish failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// No confirm arrived within the publish timeout
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    /// The broker refused the message or did not confirm durability
    #[error("publish rejected: {0}")]
    Rejected(String),

    /// Connection lost while publishing
    #[error("publish connection error: {0}")]
    Connection(String),
}

impl PublishError {
    /// Metric label for `messages_failed_total{error_type}`
    pub fn error_type(&self) -> &'static str {
        match self {
            PublishError::Timeout(_) => "publish_timeout",
            PublishError::Rejected(_) => "publish_nack",
            PublishError::Connection(_) => "connection",
        }
    }
}

impl From<BrokerError> for PublishError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Connection(msg) => PublishError::Connection(msg),
            BrokerError::Protocol(msg) => PublishError::Rejected(msg),
        }
    }
}

/// Envelope decoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The delivery carried no envelope body at all
    #[error("delivery has no envelope body")]
    MissingEnvelope,

    /// The body is not a valid envelope
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::InvalidEnvelope(err.to_string())
    }
}

/// Permanent-failure sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("parking lot storage error: {0}")]
    Storage(String),

    #[error("parked entry not found: {0}")]
    NotFound(String),
}

impl From<redis::RedisError> for SinkError {
    fn from(err: redis::RedisError) -> Self {
        SinkError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Storage(err.to_string())
    }
}

/// Why a message could not be redelivered this cycle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedeliveryError {
    /// Synthetic: the downstream is known to be down, no publish was attempted
    #[error("circuit open")]
    CircuitOpen,

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl RedeliveryError {
    /// Metric label for `messages_failed_total{error_type}`
    pub fn error_type(&self) -> &'static str {
        match self {
            RedeliveryError::CircuitOpen => "circuit_open",
            RedeliveryError::Publish(e) => e.error_type(),
        }
    }
}

/// Errors that end a consumer run
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The broker stayed unreachable through every reconnect attempt
    #[error("broker unreachable for '{dlq_name}' after {attempts} attempts: {source}")]
    Connection {
        dlq_name: String,
        attempts: u32,
        #[source]
        source: BrokerError,
    },
}
