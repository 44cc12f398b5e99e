//! Redis parking lot
//!
//! Parked messages go to the stream `<dlq_name>.parked`. Each entry carries
//! a `data` field (JSON [`ParkedEntry`]) and the raw `body` bytes, so a
//! replay restores the original body exactly.

use super::{
    ParkReason, ParkedEntry, ParkingLot, ParkingStats, PermanentFailureSink, parked_stream,
};
use crate::broker::redis::{ENVELOPE_FIELD, ROUTING_KEY_FIELD};
use crate::envelope::{DELIVERY_ATTEMPT_HEADER, DlqMessage};
use crate::error::SinkError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, info, warn};

const DATA_FIELD: &str = "data";
const BODY_FIELD: &str = "body";

type StreamEntries = Vec<(String, Vec<(String, Vec<u8>)>)>;

/// Parking lot backed by Redis streams
#[derive(Clone)]
pub struct RedisParkingLot {
    redis: ConnectionManager,
    max_length: u64,
}

impl RedisParkingLot {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            max_length: 10_000,
        }
    }

    /// Set the approximate per-DLQ parking lot length
    pub fn with_max_length(mut self, max_length: u64) -> Self {
        self.max_length = max_length;
        self
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<StreamEntries, SinkError> {
        let mut conn = self.redis.clone();
        let entries: StreamEntries = redis::cmd("XRANGE")
            .arg(stream)
            .arg(start)
            .arg(end)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn boundary_id(
        &self,
        stream: &str,
        command: &str,
        from: &str,
        to: &str,
    ) -> Option<String> {
        let mut conn = self.redis.clone();
        let entries: Option<StreamEntries> = redis::cmd(command)
            .arg(stream)
            .arg(from)
            .arg(to)
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .ok();
        entries.and_then(|v| v.into_iter().next().map(|(id, _)| id))
    }
}

fn field<'a>(fields: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a [u8]> {
    fields
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_slice())
}

fn parse_entry(id: String, fields: &[(String, Vec<u8>)]) -> Option<ParkedEntry> {
    let data = field(fields, DATA_FIELD)?;
    match serde_json::from_slice::<ParkedEntry>(data) {
        Ok(mut entry) => {
            entry.id = id;
            Some(entry)
        }
        Err(e) => {
            warn!(entry_id = %id, error = %e, "Skipping unreadable parked entry");
            None
        }
    }
}

#[async_trait]
impl PermanentFailureSink for RedisParkingLot {
    async fn park(&self, message: &DlqMessage, reason: ParkReason) -> Result<(), SinkError> {
        let entry = ParkedEntry::new(message, reason);
        let data = serde_json::to_string(&entry)?;
        let stream = parked_stream(&message.dlq_name);
        let mut conn = self.redis.clone();

        let parked_id: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_length)
            .arg("*")
            .arg(DATA_FIELD)
            .arg(&data)
            .arg(BODY_FIELD)
            .arg(message.body.as_slice())
            .query_async(&mut conn)
            .await?;

        info!(
            dlq_name = %message.dlq_name,
            delivery_tag = %message.id,
            parked_id = %parked_id,
            reason = %reason,
            attempt = message.delivery_attempt,
            "Parked message"
        );
        Ok(())
    }
}

#[async_trait]
impl ParkingLot for RedisParkingLot {
    async fn stats(&self, dlq_name: &str) -> Result<ParkingStats, SinkError> {
        let stream = parked_stream(dlq_name);
        let mut conn = self.redis.clone();

        let length: u64 = redis::cmd("XLEN").arg(&stream).query_async(&mut conn).await?;
        let oldest_entry_id = self.boundary_id(&stream, "XRANGE", "-", "+").await;
        let newest_entry_id = self.boundary_id(&stream, "XREVRANGE", "+", "-").await;

        Ok(ParkingStats {
            dlq_name: dlq_name.to_string(),
            parked_stream: stream,
            length,
            oldest_entry_id,
            newest_entry_id,
        })
    }

    async fn list(&self, dlq_name: &str, limit: usize) -> Result<Vec<ParkedEntry>, SinkError> {
        let entries = self.range(&parked_stream(dlq_name), "-", "+", limit).await?;

        Ok(entries
            .into_iter()
            .filter_map(|(id, fields)| parse_entry(id, &fields))
            .collect())
    }

    async fn replay(&self, dlq_name: &str, id: &str) -> Result<String, SinkError> {
        let stream = parked_stream(dlq_name);
        let entries = self.range(&stream, id, id, 1).await?;

        let Some((entry_id, fields)) = entries.into_iter().next() else {
            return Err(SinkError::NotFound(format!("{stream}/{id}")));
        };
        let entry = parse_entry(entry_id, &fields)
            .ok_or_else(|| SinkError::Storage(format!("unreadable parked entry {stream}/{id}")))?;
        let body = field(&fields, BODY_FIELD)
            .map(<[u8]>::to_vec)
            .unwrap_or_else(|| entry.body.clone().into_bytes());

        let mut headers = entry.headers.clone();
        headers.remove(DELIVERY_ATTEMPT_HEADER);

        let mut pipe = redis::pipe();
        pipe.atomic();
        {
            let xadd = pipe.cmd("XADD").arg(dlq_name).arg("*");
            xadd.arg(ENVELOPE_FIELD).arg(body.as_slice());
            if let Some(routing_key) = &entry.routing_key {
                xadd.arg(ROUTING_KEY_FIELD).arg(routing_key);
            }
            for (key, value) in &headers {
                xadd.arg(key).arg(value);
            }
        }
        pipe.cmd("XDEL").arg(&stream).arg(id).ignore();

        let mut conn = self.redis.clone();
        let (new_id,): (String,) = pipe.query_async(&mut conn).await?;

        info!(
            dlq_name = %dlq_name,
            parked_id = %id,
            delivery_tag = %new_id,
            "Replayed parked message"
        );
        Ok(new_id)
    }

    async fn discard(&self, dlq_name: &str, id: &str) -> Result<(), SinkError> {
        let stream = parked_stream(dlq_name);
        let mut conn = self.redis.clone();

        let deleted: i64 = redis::cmd("XDEL").arg(&stream).arg(id).query_async(&mut conn).await?;
        if deleted == 0 {
            return Err(SinkError::NotFound(format!("{stream}/{id}")));
        }

        debug!(dlq_name = %dlq_name, parked_id = %id, "Discarded parked message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Delivery, Headers};
    use chrono::Utc;

    fn stored_fields(message: &DlqMessage, reason: ParkReason) -> Vec<(String, Vec<u8>)> {
        let entry = ParkedEntry::new(message, reason);
        vec![
            (DATA_FIELD.to_string(), serde_json::to_vec(&entry).unwrap()),
            (BODY_FIELD.to_string(), message.body.clone()),
        ]
    }

    #[test]
    fn test_parse_entry_sets_id() {
        let body = br#"{"event_type":"email.send","routing_key":"email.send","payload":{}}"#;
        let message = DlqMessage::from_delivery(
            "notifications.dlq",
            Delivery::new("5-0", body.to_vec(), Headers::new(), Utc::now()),
        );

        let fields = stored_fields(&message, ParkReason::MaxAttemptsExceeded);
        let entry = parse_entry("1714564800000-0".to_string(), &fields).unwrap();

        assert_eq!(entry.id, "1714564800000-0");
        assert_eq!(entry.event_type.as_deref(), Some("email.send"));
        assert_eq!(entry.reason, ParkReason::MaxAttemptsExceeded);
        assert_eq!(field(&fields, BODY_FIELD), Some(&body[..]));
    }

    #[test]
    fn test_parse_entry_skips_garbage() {
        let fields = vec![(DATA_FIELD.to_string(), b"{not json".to_vec())];
        assert!(parse_entry("1-0".to_string(), &fields).is_none());
        assert!(parse_entry("1-0".to_string(), &[]).is_none());
    }
}
