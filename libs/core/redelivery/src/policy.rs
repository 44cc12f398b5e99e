//! Redelivery decision
//!
//! Rules, first match wins:
//! 1. circuit open: fail fast, nothing published
//! 2. attempt beyond `max_retries`: park
//! 3. undecodable envelope: park
//! 4. discarded event type: drop
//! 5. otherwise republish to the resolved destination and wait for the confirm

use crate::broker::Publisher;
use crate::envelope::{DlqMessage, OutboundMessage};
use crate::error::{PublishError, RedeliveryError};
use crate::routing::{Destination, Route, RoutingTable};
use crate::sink::ParkReason;
use crate::tracker::FailureState;
use std::time::Duration;
use tracing::warn;

/// Result of handling one DLQ message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeliveryOutcome {
    Republished { destination: Destination },
    ParkedPermanently { reason: ParkReason },
    Dropped { reason: String },
    Failed { error: RedeliveryError },
}

impl RedeliveryOutcome {
    /// Short name for logs
    pub fn label(&self) -> &'static str {
        match self {
            RedeliveryOutcome::Republished { .. } => "republished",
            RedeliveryOutcome::ParkedPermanently { .. } => "parked",
            RedeliveryOutcome::Dropped { .. } => "dropped",
            RedeliveryOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RedeliveryOutcome::Failed { .. })
    }
}

/// Per-queue redelivery policy
#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    max_retries: u32,
    publish_timeout: Duration,
    routing: RoutingTable,
}

impl RedeliveryPolicy {
    pub fn new(max_retries: u32, publish_timeout: Duration, routing: RoutingTable) -> Self {
        Self {
            max_retries,
            publish_timeout,
            routing,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Decide what happens to `message`, publishing it if the rules allow
    pub async fn decide<P>(
        &self,
        message: &DlqMessage,
        failure_state: &FailureState,
        publisher: &P,
    ) -> RedeliveryOutcome
    where
        P: Publisher + ?Sized,
    {
        if failure_state.circuit_open {
            return RedeliveryOutcome::Failed {
                error: RedeliveryError::CircuitOpen,
            };
        }

        if message.delivery_attempt > self.max_retries {
            return RedeliveryOutcome::ParkedPermanently {
                reason: ParkReason::MaxAttemptsExceeded,
            };
        }

        let envelope = match &message.envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    dlq_name = %message.dlq_name,
                    delivery_tag = %message.id,
                    error = %e,
                    "Malformed envelope"
                );
                return RedeliveryOutcome::ParkedPermanently {
                    reason: ParkReason::Malformed,
                };
            }
        };

        let destination = match self.routing.resolve(envelope) {
            Route::Republish(destination) => destination,
            Route::Discard => {
                return RedeliveryOutcome::Dropped {
                    reason: format!("event type '{}' is discarded", envelope.event_type),
                };
            }
        };

        let outbound = match OutboundMessage::republish(message, envelope) {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!(
                    dlq_name = %message.dlq_name,
                    delivery_tag = %message.id,
                    error = %e,
                    "Envelope could not be re-encoded"
                );
                return RedeliveryOutcome::ParkedPermanently {
                    reason: ParkReason::Malformed,
                };
            }
        };

        let published = tokio::time::timeout(
            self.publish_timeout,
            publisher.publish(&destination, &outbound, true),
        )
        .await
        .unwrap_or(Err(PublishError::Timeout(self.publish_timeout)));

        match published {
            Ok(()) => RedeliveryOutcome::Republished { destination },
            Err(e) => RedeliveryOutcome::Failed { error: e.into() },
        }
    }
}
