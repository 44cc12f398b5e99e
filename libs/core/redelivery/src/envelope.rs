//! Message envelope and delivery metadata
//!
//! Every event published in the platform travels inside a JSON envelope:
//!
//! ```json
//! {"event_type": "game.created", "routing_key": "game.created",
//!  "published_at": "2024-05-01T12:00:00Z", "payload": {}}
//! ```
//!
//! The payload is opaque to the daemon. It is held as raw JSON text so a
//! republished message carries exactly the bytes the producer wrote.

use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;

/// Attempt counter carried on every delivery
pub const DELIVERY_ATTEMPT_HEADER: &str = "x-delivery-attempt";

/// RFC 3339 time the message first entered a DLQ
pub const FIRST_SEEN_HEADER: &str = "x-first-seen-at";

/// Source DLQ of a republished message
pub const REDELIVERED_FROM_HEADER: &str = "x-redelivered-from";

/// Message headers, ordered for stable output
pub type Headers = BTreeMap<String, String>;

/// Event envelope as published by the platform's producers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_type: String,
    pub routing_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub payload: Box<RawValue>,
}

impl Envelope {
    /// Decode an envelope from a message body
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::MissingEnvelope);
        }
        Ok(serde_json::from_slice(body)?)
    }

    /// Encode back to JSON, payload bytes untouched
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A raw delivery as handed over by the broker
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker delivery tag (the stream entry id for Redis)
    pub tag: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    /// 1 on first delivery
    pub delivery_attempt: u32,
    pub first_seen_at: DateTime<Utc>,
}

impl Delivery {
    /// Build a delivery, reading attempt and first-seen time from headers.
    ///
    /// `received_at` stands in for `x-first-seen-at` when the header is
    /// missing or unreadable.
    pub fn new(
        tag: impl Into<String>,
        body: Vec<u8>,
        headers: Headers,
        received_at: DateTime<Utc>,
    ) -> Self {
        let delivery_attempt = delivery_attempt_from(&headers);
        let first_seen_at = first_seen_from(&headers).unwrap_or(received_at);
        Self {
            tag: tag.into(),
            body,
            headers,
            delivery_attempt,
            first_seen_at,
        }
    }
}

/// Attempt counter from headers; missing or garbage means first attempt
pub fn delivery_attempt_from(headers: &Headers) -> u32 {
    headers
        .get(DELIVERY_ATTEMPT_HEADER)
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .unwrap_or(1)
        .max(1)
}

pub fn first_seen_from(headers: &Headers) -> Option<DateTime<Utc>> {
    headers
        .get(FIRST_SEEN_HEADER)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// A DLQ delivery together with its decoded envelope.
///
/// Lives for one handling cycle; the consumer drops it after settling.
#[derive(Debug, Clone)]
pub struct DlqMessage {
    /// Delivery tag, unique only within the DLQ
    pub id: String,
    pub dlq_name: String,
    pub delivery_attempt: u32,
    pub first_seen_at: DateTime<Utc>,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub envelope: Result<Envelope, DecodeError>,
}

impl DlqMessage {
    pub fn from_delivery(dlq_name: impl Into<String>, delivery: Delivery) -> Self {
        let envelope = Envelope::decode(&delivery.body);
        Self {
            id: delivery.tag,
            dlq_name: dlq_name.into(),
            delivery_attempt: delivery.delivery_attempt,
            first_seen_at: delivery.first_seen_at,
            headers: delivery.headers,
            body: delivery.body,
            envelope,
        }
    }

    pub fn event_type(&self) -> Option<&str> {
        self.envelope.as_ref().ok().map(|e| e.event_type.as_str())
    }

    pub fn original_routing_key(&self) -> Option<&str> {
        self.envelope.as_ref().ok().map(|e| e.routing_key.as_str())
    }

    pub fn payload(&self) -> Option<&RawValue> {
        self.envelope.as_ref().ok().map(|e| e.payload.as_ref())
    }

    pub fn is_malformed(&self) -> bool {
        self.envelope.is_err()
    }

    /// Event type used as a metric label
    pub fn event_type_label(&self) -> &str {
        self.event_type().unwrap_or("unknown")
    }
}

/// A message ready to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl OutboundMessage {
    /// Republish form of a DLQ message: re-encoded envelope, attempt bumped,
    /// first-seen time and source DLQ recorded.
    pub fn republish(message: &DlqMessage, envelope: &Envelope) -> Result<Self, serde_json::Error> {
        let mut headers = message.headers.clone();
        headers.insert(
            DELIVERY_ATTEMPT_HEADER.to_string(),
            message.delivery_attempt.saturating_add(1).to_string(),
        );
        headers.insert(
            FIRST_SEEN_HEADER.to_string(),
            message.first_seen_at.to_rfc3339(),
        );
        headers.insert(
            REDELIVERED_FROM_HEADER.to_string(),
            message.dlq_name.clone(),
        );

        Ok(Self {
            body: envelope.encode()?,
            headers,
        })
    }
}
