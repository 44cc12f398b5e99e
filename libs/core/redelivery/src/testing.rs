//! In-memory fakes for unit tests

use crate::broker::{Broker, Channel, Publisher, Readiness};
use crate::envelope::{
    DELIVERY_ATTEMPT_HEADER, Delivery, DlqMessage, FIRST_SEEN_HEADER, Headers, OutboundMessage,
};
use crate::error::{BrokerError, PublishError, SinkError};
use crate::metrics::MetricsEmitter;
use crate::routing::Destination;
use crate::sink::{ParkReason, ParkedEntry, ParkingLot, ParkingStats, PermanentFailureSink, parked_stream};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const IDLE_POLL: Duration = Duration::from_millis(100);

pub fn envelope_body(event_type: &str, routing_key: &str) -> Vec<u8> {
    format!(
        r#"{{"event_type":"{event_type}","routing_key":"{routing_key}","payload":{{"n":1}}}}"#
    )
    .into_bytes()
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Delivery>>,
    next_id: u64,
    publish_results: VecDeque<Result<(), PublishError>>,
    published: Vec<(Destination, OutboundMessage)>,
    acks: Vec<String>,
    nacks: Vec<(String, bool)>,
    opens: u32,
    failing_opens: u32,
    panicking_opens: u32,
    delivery_errors: VecDeque<BrokerError>,
    unreachable: bool,
    stalled: bool,
}

impl BrokerState {
    fn push(&mut self, queue: &str, body: Vec<u8>, headers: Headers) -> String {
        self.next_id += 1;
        let tag = format!("{}-0", self.next_id);
        let delivery = Delivery::new(tag.clone(), body, headers, Utc::now());
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(delivery);
        tag
    }
}

/// Broker keeping queues in memory, with scriptable failures
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn enqueue(&self, queue: &str, body: Vec<u8>) -> String {
        self.state().push(queue, body, Headers::new())
    }

    pub fn enqueue_with_attempt(&self, queue: &str, body: Vec<u8>, attempt: u32) -> String {
        let mut headers = Headers::new();
        headers.insert(DELIVERY_ATTEMPT_HEADER.to_string(), attempt.to_string());
        self.state().push(queue, body, headers)
    }

    /// Results for upcoming publishes, in order; afterwards publishes succeed
    pub fn script_publishes(&self, results: impl IntoIterator<Item = Result<(), PublishError>>) {
        self.state().publish_results.extend(results);
    }

    pub fn fail_publishes(&self, count: usize, error: PublishError) {
        self.script_publishes(std::iter::repeat_n(Err(error), count));
    }

    pub fn fail_opens(&self, count: u32) {
        self.state().failing_opens = count;
    }

    pub fn panic_on_opens(&self, count: u32) {
        self.state().panicking_opens = count;
    }

    pub fn fail_next_delivery(&self, error: BrokerError) {
        self.state().delivery_errors.push_back(error);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Publishes never complete while stalled
    pub fn stall_publishes(&self) {
        self.state().stalled = true;
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Attempt counters of the messages waiting in `queue`
    pub fn queued_attempts(&self, queue: &str) -> Vec<u32> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.iter().map(|d| d.delivery_attempt).collect())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<(Destination, OutboundMessage)> {
        self.state().published.clone()
    }

    pub fn acks(&self) -> Vec<String> {
        self.state().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(String, bool)> {
        self.state().nacks.clone()
    }

    pub fn opens(&self) -> u32 {
        self.state().opens
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Channel = MemoryChannel;

    async fn open(&self, queue: &str, _prefetch_limit: u16) -> Result<MemoryChannel, BrokerError> {
        {
            let mut state = self.state();
            state.opens += 1;
            if state.panicking_opens > 0 {
                state.panicking_opens -= 1;
                drop(state);
                panic!("broker exploded opening {queue}");
            }
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(BrokerError::Connection("connection refused".into()));
            }
        }

        Ok(MemoryChannel {
            queue: queue.to_string(),
            broker: self.clone(),
            in_flight: HashMap::new(),
        })
    }
}

#[async_trait]
impl Readiness for MemoryBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        if self.state().unreachable {
            Err(BrokerError::Connection("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

pub struct MemoryChannel {
    queue: String,
    broker: MemoryBroker,
    in_flight: HashMap<String, Delivery>,
}

#[async_trait]
impl Publisher for MemoryChannel {
    async fn publish(
        &self,
        destination: &Destination,
        message: &OutboundMessage,
        _wait_for_confirm: bool,
    ) -> Result<(), PublishError> {
        let result = {
            let mut state = self.broker.state();
            if state.stalled {
                None
            } else {
                let result = state.publish_results.pop_front().unwrap_or(Ok(()));
                if result.is_ok() {
                    state.published.push((destination.clone(), message.clone()));
                }
                Some(result)
            }
        };
        match result {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError> {
        let next = {
            let mut state = self.broker.state();
            if let Some(error) = state.delivery_errors.pop_front() {
                return Err(error);
            }
            state.queues.get_mut(&self.queue).and_then(VecDeque::pop_front)
        };

        match next {
            Some(delivery) => {
                self.in_flight.insert(delivery.tag.clone(), delivery.clone());
                Ok(Some(delivery))
            }
            None => {
                tokio::time::sleep(IDLE_POLL).await;
                Ok(None)
            }
        }
    }

    async fn ack(&mut self, tag: &str) -> Result<(), BrokerError> {
        self.in_flight.remove(tag);
        self.broker.state().acks.push(tag.to_string());
        Ok(())
    }

    async fn nack(&mut self, tag: &str, requeue: bool) -> Result<(), BrokerError> {
        let delivery = self.in_flight.remove(tag);
        let mut state = self.broker.state();
        state.nacks.push((tag.to_string(), requeue));

        if let (true, Some(delivery)) = (requeue, delivery) {
            let mut headers = delivery.headers;
            headers.insert(
                DELIVERY_ATTEMPT_HEADER.to_string(),
                (delivery.delivery_attempt + 1).to_string(),
            );
            headers.insert(
                FIRST_SEEN_HEADER.to_string(),
                delivery.first_seen_at.to_rfc3339(),
            );
            let queue = self.queue.clone();
            state.push(&queue, delivery.body, headers);
        }
        Ok(())
    }

    async fn depth(&mut self) -> Result<u64, BrokerError> {
        Ok(self.broker.depth(&self.queue) as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Processed(String, String),
    Failed(String, String),
    Parked(String, String),
    Depth(String, u64),
    ConsecutiveFailures(String, u32),
    CircuitOpen(String, bool),
    Duration(String, Duration),
}

/// Emitter that records every call
#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingEmitter {
    fn record(&self, event: MetricEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn processed(&self) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MetricEvent::Processed(dlq, event_type) => Some((dlq, event_type)),
                _ => None,
            })
            .collect()
    }

    pub fn failed_count(&self, error_type: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, MetricEvent::Failed(_, t) if t == error_type))
            .count()
    }

    pub fn parked_count(&self, reason: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, MetricEvent::Parked(_, r) if r == reason))
            .count()
    }

    pub fn durations(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, MetricEvent::Duration(..)))
            .count()
    }

    pub fn last_depth(&self, dlq_name: &str) -> Option<u64> {
        self.events().into_iter().rev().find_map(|e| match e {
            MetricEvent::Depth(dlq, depth) if dlq == dlq_name => Some(depth),
            _ => None,
        })
    }

    pub fn last_consecutive_failures(&self, dlq_name: &str) -> Option<u32> {
        self.events().into_iter().rev().find_map(|e| match e {
            MetricEvent::ConsecutiveFailures(dlq, count) if dlq == dlq_name => Some(count),
            _ => None,
        })
    }

    pub fn last_circuit_open(&self, dlq_name: &str) -> Option<bool> {
        self.events().into_iter().rev().find_map(|e| match e {
            MetricEvent::CircuitOpen(dlq, open) if dlq == dlq_name => Some(open),
            _ => None,
        })
    }
}

impl MetricsEmitter for RecordingEmitter {
    fn message_processed(&self, dlq_name: &str, event_type: &str) {
        self.record(MetricEvent::Processed(dlq_name.into(), event_type.into()));
    }

    fn message_failed(&self, dlq_name: &str, error_type: &str) {
        self.record(MetricEvent::Failed(dlq_name.into(), error_type.into()));
    }

    fn message_parked(&self, dlq_name: &str, reason: &str) {
        self.record(MetricEvent::Parked(dlq_name.into(), reason.into()));
    }

    fn dlq_depth(&self, dlq_name: &str, depth: u64) {
        self.record(MetricEvent::Depth(dlq_name.into(), depth));
    }

    fn consecutive_failures(&self, dlq_name: &str, count: u32) {
        self.record(MetricEvent::ConsecutiveFailures(dlq_name.into(), count));
    }

    fn circuit_open(&self, dlq_name: &str, open: bool) {
        self.record(MetricEvent::CircuitOpen(dlq_name.into(), open));
    }

    fn processing_duration(&self, dlq_name: &str, duration: Duration) {
        self.record(MetricEvent::Duration(dlq_name.into(), duration));
    }
}

/// Parking lot in memory
#[derive(Default)]
pub struct MemoryParkingLot {
    entries: Mutex<BTreeMap<String, Vec<ParkedEntry>>>,
    next_id: Mutex<u64>,
    failing: Mutex<bool>,
}

impl MemoryParkingLot {
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn parked(&self, dlq_name: &str) -> Vec<ParkedEntry> {
        self.entries
            .lock()
            .unwrap()
            .get(dlq_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn insert(&self, message: &DlqMessage, reason: ParkReason) -> String {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let mut entry = ParkedEntry::new(message, reason);
        entry.id = format!("p-{next_id}");
        let id = entry.id.clone();
        self.entries
            .lock()
            .unwrap()
            .entry(message.dlq_name.clone())
            .or_default()
            .push(entry);
        id
    }

    fn take(&self, dlq_name: &str, id: &str) -> Result<ParkedEntry, SinkError> {
        let mut entries = self.entries.lock().unwrap();
        let parked = entries.get_mut(dlq_name);
        let position = parked
            .as_ref()
            .and_then(|list| list.iter().position(|e| e.id == id));
        match (parked, position) {
            (Some(list), Some(index)) => Ok(list.remove(index)),
            _ => Err(SinkError::NotFound(format!("{}/{id}", parked_stream(dlq_name)))),
        }
    }
}

#[async_trait]
impl PermanentFailureSink for MemoryParkingLot {
    async fn park(&self, message: &DlqMessage, reason: ParkReason) -> Result<(), SinkError> {
        if *self.failing.lock().unwrap() {
            return Err(SinkError::Storage("parking lot unavailable".into()));
        }
        self.insert(message, reason);
        Ok(())
    }
}

#[async_trait]
impl ParkingLot for MemoryParkingLot {
    async fn stats(&self, dlq_name: &str) -> Result<ParkingStats, SinkError> {
        let parked = self.parked(dlq_name);
        Ok(ParkingStats {
            dlq_name: dlq_name.to_string(),
            parked_stream: parked_stream(dlq_name),
            length: parked.len() as u64,
            oldest_entry_id: parked.first().map(|e| e.id.clone()),
            newest_entry_id: parked.last().map(|e| e.id.clone()),
        })
    }

    async fn list(&self, dlq_name: &str, limit: usize) -> Result<Vec<ParkedEntry>, SinkError> {
        Ok(self.parked(dlq_name).into_iter().take(limit).collect())
    }

    async fn replay(&self, dlq_name: &str, id: &str) -> Result<String, SinkError> {
        let entry = self.take(dlq_name, id)?;
        Ok(format!("replayed-{}", entry.id))
    }

    async fn discard(&self, dlq_name: &str, id: &str) -> Result<(), SinkError> {
        self.take(dlq_name, id).map(|_| ())
    }
}
