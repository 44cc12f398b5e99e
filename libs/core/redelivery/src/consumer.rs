//! DLQ consumer
//!
//! One consumer drains one DLQ. Messages are handled one at a time in
//! delivery order: decode, decide, settle, then update the tracker and
//! metrics. The shutdown signal is only observed between messages, so a
//! message whose handling started is always acked or nacked.

use crate::backoff::Backoff;
use crate::broker::{Broker, Channel};
use crate::config::QueueConfig;
use crate::envelope::{Delivery, DlqMessage};
use crate::error::{BrokerError, ConsumerError, RedeliveryError};
use crate::metrics::{DlqMetrics, MetricsEmitter};
use crate::policy::{RedeliveryOutcome, RedeliveryPolicy};
use crate::sink::{ParkReason, PermanentFailureSink};
use crate::tracker::{CircuitView, FailureTracker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Settings shared by every consumer of a daemon
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Bounded backoff for opening the broker channel
    pub reconnect: Backoff,

    /// How often `dlq_depth` is sampled
    pub depth_sample_interval: Duration,

    /// Upper bound for one republish
    pub publish_timeout: Duration,

    /// Pause after the parking lot rejected a write
    pub sink_retry_delay: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            reconnect: Backoff::default().with_max_attempts(10),
            depth_sample_interval: Duration::from_secs(15),
            publish_timeout: Duration::from_secs(5),
            sink_retry_delay: Duration::from_secs(1),
        }
    }
}

/// What the loop does before the next delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pause {
    None,
    /// Circuit open; wait out the cooldown. The rejected message was
    /// requeued with its attempt counter bumped, so each cooldown costs it one retry.
    Cooldown,
    /// Parking lot unavailable
    SinkRetry,
}

/// Consumer for a single DLQ
pub struct DlqConsumer<B: Broker> {
    dlq_name: String,
    prefetch_limit: u16,
    broker: Arc<B>,
    policy: RedeliveryPolicy,
    tracker: FailureTracker,
    sink: Arc<dyn PermanentFailureSink>,
    metrics: DlqMetrics,
    settings: ConsumerSettings,
}

impl<B: Broker> DlqConsumer<B> {
    pub fn new(
        queue: &QueueConfig,
        broker: Arc<B>,
        sink: Arc<dyn PermanentFailureSink>,
        metrics: Arc<dyn MetricsEmitter>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            dlq_name: queue.dlq_name.clone(),
            prefetch_limit: queue.prefetch_limit,
            broker,
            policy: RedeliveryPolicy::new(
                queue.max_retries,
                settings.publish_timeout,
                queue.routing_table(),
            ),
            tracker: FailureTracker::new(&queue.dlq_name, queue.failure_threshold, queue.cooldown()),
            sink,
            metrics: DlqMetrics::new(&queue.dlq_name, metrics),
            settings,
        }
    }

    pub fn dlq_name(&self) -> &str {
        &self.dlq_name
    }

    /// Read-only circuit state for health reporting
    pub fn circuit_view(&self) -> CircuitView {
        self.tracker.view()
    }

    /// Consume until shutdown.
    ///
    /// Fails with [`ConsumerError::Connection`] once the broker stays
    /// unreachable through every reconnect attempt. Tracker state survives
    /// across calls, so a restarted consumer keeps its circuit.
    pub async fn start(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        info!(
            dlq_name = %self.dlq_name,
            prefetch_limit = self.prefetch_limit,
            max_retries = self.policy.max_retries(),
            "Starting DLQ consumer"
        );

        'connection: while !*shutdown.borrow() {
            let Some(mut channel) = self.connect(&mut shutdown).await? else {
                break;
            };
            let mut next_depth_sample = Instant::now();

            loop {
                if *shutdown.borrow() {
                    break 'connection;
                }

                if Instant::now() >= next_depth_sample {
                    self.sample_depth(&mut channel).await;
                    next_depth_sample = Instant::now() + self.settings.depth_sample_interval;
                }

                let delivery = tokio::select! {
                    result = channel.next_delivery() => result,
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break 'connection;
                        }
                        continue;
                    }
                };

                let result = match delivery {
                    Ok(Some(delivery)) => self.handle(&mut channel, delivery).await,
                    Ok(None) => continue,
                    Err(e) => Err(e),
                };

                match result {
                    Ok(Pause::None) => {}
                    Ok(Pause::Cooldown) => {
                        if !self
                            .wait_for_cooldown(&mut channel, &mut shutdown, &mut next_depth_sample)
                            .await
                        {
                            break 'connection;
                        }
                    }
                    Ok(Pause::SinkRetry) => {
                        let resume_at = Instant::now() + self.settings.sink_retry_delay;
                        if !sleep_or_shutdown(&mut shutdown, resume_at).await {
                            break 'connection;
                        }
                    }
                    Err(e) => {
                        warn!(dlq_name = %self.dlq_name, error = %e, "Channel failed, reconnecting");
                        self.metrics.failed("connection");
                        let delay = self.settings.reconnect.delay(1);
                        if !sleep_or_shutdown(&mut shutdown, Instant::now() + delay).await {
                            break 'connection;
                        }
                        continue 'connection;
                    }
                }
            }
        }

        info!(dlq_name = %self.dlq_name, "DLQ consumer stopped");
        Ok(())
    }

    /// Open the channel with bounded, jittered retries. `None` on shutdown.
    async fn connect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<B::Channel>, ConsumerError> {
        let backoff = &self.settings.reconnect;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.broker.open(&self.dlq_name, self.prefetch_limit).await {
                Ok(channel) => {
                    if attempt > 1 {
                        info!(dlq_name = %self.dlq_name, attempt, "Reconnected to broker");
                    } else {
                        debug!(dlq_name = %self.dlq_name, "Subscribed to DLQ");
                    }
                    return Ok(Some(channel));
                }
                Err(e) if backoff.exhausted(attempt) => {
                    error!(
                        dlq_name = %self.dlq_name,
                        attempts = attempt,
                        error = %e,
                        "Broker unreachable, giving up"
                    );
                    return Err(ConsumerError::Connection {
                        dlq_name: self.dlq_name.clone(),
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = backoff.delay(attempt);
                    warn!(
                        dlq_name = %self.dlq_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Failed to open channel, retrying"
                    );
                    if !sleep_or_shutdown(shutdown, Instant::now() + delay).await {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Handle one delivery through to ack/nack.
    ///
    /// Errors are settlement failures; the outcome has been decided by then.
    async fn handle(
        &mut self,
        channel: &mut B::Channel,
        delivery: Delivery,
    ) -> Result<Pause, BrokerError> {
        let started = Instant::now();
        let message = DlqMessage::from_delivery(&self.dlq_name, delivery);

        let state = self.tracker.decision_state(started);
        let outcome = self.policy.decide(&message, &state, &*channel).await;

        debug!(
            dlq_name = %self.dlq_name,
            delivery_tag = %message.id,
            event_type = message.event_type_label(),
            attempt = message.delivery_attempt,
            outcome = outcome.label(),
            "Decided"
        );

        let settled = self.settle(channel, &message, &outcome).await;

        self.metrics
            .failure_state(self.tracker.state().consecutive_failures, self.tracker.state().circuit_open);
        self.metrics.duration(started.elapsed());

        match settled {
            Ok(pause) => Ok(pause),
            Err(e) => {
                self.metrics.failed("ack");
                warn!(
                    dlq_name = %self.dlq_name,
                    delivery_tag = %message.id,
                    error = %e,
                    "Failed to settle delivery"
                );
                if e.is_connection() { Err(e) } else { Ok(Pause::None) }
            }
        }
    }

    async fn settle(
        &mut self,
        channel: &mut B::Channel,
        message: &DlqMessage,
        outcome: &RedeliveryOutcome,
    ) -> Result<Pause, BrokerError> {
        match outcome {
            RedeliveryOutcome::Republished { destination } => {
                self.tracker.record_success();
                self.metrics.processed(message.event_type_label());
                debug!(
                    dlq_name = %self.dlq_name,
                    delivery_tag = %message.id,
                    destination = %destination,
                    "Republished"
                );
                channel.ack(&message.id).await.map(|()| Pause::None)
            }
            RedeliveryOutcome::ParkedPermanently { reason } => {
                self.park_and_settle(channel, message, *reason, false).await
            }
            RedeliveryOutcome::Dropped { reason } => {
                self.metrics.processed(message.event_type_label());
                info!(
                    dlq_name = %self.dlq_name,
                    delivery_tag = %message.id,
                    reason = %reason,
                    "Dropped"
                );
                channel.ack(&message.id).await.map(|()| Pause::None)
            }
            RedeliveryOutcome::Failed {
                error: RedeliveryError::CircuitOpen,
            } => {
                self.metrics.failed(RedeliveryError::CircuitOpen.error_type());
                warn!(
                    dlq_name = %self.dlq_name,
                    delivery_tag = %message.id,
                    "Circuit open, message left in DLQ"
                );
                channel.nack(&message.id, true).await.map(|()| Pause::Cooldown)
            }
            RedeliveryOutcome::Failed {
                error: error @ RedeliveryError::Publish(_),
            } => {
                self.tracker.record_failure(Instant::now());
                self.metrics.failed(error.error_type());

                if message.delivery_attempt < self.policy.max_retries() {
                    warn!(
                        dlq_name = %self.dlq_name,
                        delivery_tag = %message.id,
                        attempt = message.delivery_attempt,
                        error = %error,
                        "Republish failed, requeueing"
                    );
                    channel.nack(&message.id, true).await.map(|()| Pause::None)
                } else {
                    warn!(
                        dlq_name = %self.dlq_name,
                        delivery_tag = %message.id,
                        attempt = message.delivery_attempt,
                        error = %error,
                        "Republish failed on last attempt, parking"
                    );
                    self.park_and_settle(channel, message, ParkReason::MaxAttemptsExceeded, true)
                        .await
                }
            }
        }
    }

    /// Park, then ack (or reject without requeue). A sink failure requeues
    /// instead so the message is not lost.
    async fn park_and_settle(
        &self,
        channel: &mut B::Channel,
        message: &DlqMessage,
        reason: ParkReason,
        reject: bool,
    ) -> Result<Pause, BrokerError> {
        match self.sink.park(message, reason).await {
            Ok(()) => {
                self.metrics.parked(reason.label());
                if reject {
                    channel.nack(&message.id, false).await?;
                } else {
                    self.metrics.processed(message.event_type_label());
                    channel.ack(&message.id).await?;
                }
                Ok(Pause::None)
            }
            Err(e) => {
                self.metrics.failed("sink");
                warn!(
                    dlq_name = %self.dlq_name,
                    delivery_tag = %message.id,
                    reason = %reason,
                    error = %e,
                    "Parking failed, message stays in DLQ"
                );
                channel.nack(&message.id, true).await.map(|()| Pause::SinkRetry)
            }
        }
    }

    async fn sample_depth(&self, channel: &mut B::Channel) {
        match channel.depth().await {
            Ok(depth) => self.metrics.depth(depth),
            Err(e) => debug!(dlq_name = %self.dlq_name, error = %e, "Depth sample failed"),
        }
    }

    /// Sleep while the circuit is open, still sampling depth. `false` on shutdown.
    async fn wait_for_cooldown(
        &mut self,
        channel: &mut B::Channel,
        shutdown: &mut watch::Receiver<bool>,
        next_depth_sample: &mut Instant,
    ) -> bool {
        if let Some(reopen_at) = self.tracker.reopen_at() {
            debug!(
                dlq_name = %self.dlq_name,
                remaining_ms = reopen_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Waiting out circuit cooldown"
            );
        }

        while let Some(reopen_at) = self.tracker.reopen_at() {
            if Instant::now() >= reopen_at {
                break;
            }
            if !sleep_or_shutdown(shutdown, reopen_at.min(*next_depth_sample)).await {
                return false;
            }
            if Instant::now() >= *next_depth_sample {
                self.sample_depth(channel).await;
                *next_depth_sample = Instant::now() + self.settings.depth_sample_interval;
            }
        }
        true
    }
}

/// Sleep until `deadline`; `false` if shutdown was signalled first
pub(crate) async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, deadline: Instant) -> bool {
    loop {
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}
