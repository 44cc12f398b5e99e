//! Permanent-failure sink
//!
//! Messages that will never be retried again are parked here for operator
//! review. The parking lot also lets operators replay or discard them.

pub mod redis;

use crate::envelope::{DlqMessage, Headers};
use crate::error::SinkError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::redis::RedisParkingLot;

/// Why a message was parked
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
pub enum ParkReason {
    #[strum(serialize = "max attempts exceeded")]
    MaxAttemptsExceeded,
    #[strum(serialize = "malformed message")]
    Malformed,
}

impl ParkReason {
    /// Metric label for `messages_parked_total{reason}`
    pub fn label(&self) -> &'static str {
        match self {
            ParkReason::MaxAttemptsExceeded => "max_attempts_exceeded",
            ParkReason::Malformed => "malformed",
        }
    }
}

/// Destination for messages that are out of retries
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermanentFailureSink: Send + Sync {
    async fn park(&self, message: &DlqMessage, reason: ParkReason) -> Result<(), SinkError>;
}

/// Parking lot with operator operations
#[async_trait]
pub trait ParkingLot: PermanentFailureSink {
    async fn stats(&self, dlq_name: &str) -> Result<ParkingStats, SinkError>;

    /// Oldest first, at most `limit` entries
    async fn list(&self, dlq_name: &str, limit: usize) -> Result<Vec<ParkedEntry>, SinkError>;

    /// Push a parked entry back onto its DLQ with the attempt counter reset.
    /// Returns the new DLQ delivery tag.
    async fn replay(&self, dlq_name: &str, id: &str) -> Result<String, SinkError>;

    async fn discard(&self, dlq_name: &str, id: &str) -> Result<(), SinkError>;
}

/// A parked message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedEntry {
    /// Parking lot entry id, assigned on write
    #[serde(default)]
    pub id: String,
    pub dlq_name: String,
    pub delivery_tag: String,
    pub event_type: Option<String>,
    pub routing_key: Option<String>,
    /// Body as text; invalid UTF-8 is replaced
    pub body: String,
    pub headers: Headers,
    pub reason: ParkReason,
    pub delivery_attempt: u32,
    pub first_seen_at: DateTime<Utc>,
    pub parked_at: DateTime<Utc>,
}

impl ParkedEntry {
    pub fn new(message: &DlqMessage, reason: ParkReason) -> Self {
        Self {
            id: String::new(),
            dlq_name: message.dlq_name.clone(),
            delivery_tag: message.id.clone(),
            event_type: message.event_type().map(str::to_string),
            routing_key: message.original_routing_key().map(str::to_string),
            body: String::from_utf8_lossy(&message.body).into_owned(),
            headers: message.headers.clone(),
            reason,
            delivery_attempt: message.delivery_attempt,
            first_seen_at: message.first_seen_at,
            parked_at: Utc::now(),
        }
    }
}

/// Parking lot statistics for one DLQ
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParkingStats {
    pub dlq_name: String,
    pub parked_stream: String,
    pub length: u64,
    pub oldest_entry_id: Option<String>,
    pub newest_entry_id: Option<String>,
}

/// Stream holding the parked messages of `dlq_name`
pub fn parked_stream(dlq_name: &str) -> String {
    format!("{dlq_name}.parked")
}
