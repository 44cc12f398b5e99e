//! DLQ Redelivery
//!
//! Drains dead-letter queues and republishes their messages to the original
//! exchange, one consumer per DLQ.
//!
//! ## Features
//!
//! - **Retry ceiling**: messages past `max_retries` go to a parking lot
//! - **Circuit breaker**: per-DLQ, opens after consecutive publish failures
//! - **Publisher confirms**: a message is acked only after its republish is confirmed
//! - **Routing table**: routing key rewrites and discarded event types
//! - **Supervisor**: crashed workers restart with backoff, others keep going
//! - **Prometheus metrics** and **health endpoints** with parking-lot admin
//!
//! ## Example
//!
//! ```ignore
//! use redelivery::{DaemonConfig, RedisBroker, RedisParkingLot, Supervisor, PrometheusEmitter};
//!
//! let config = DaemonConfig::from_env()?;
//! let broker = Arc::new(RedisBroker::connect(&config.redis.url, config.broker_config()).await?);
//! let parking = Arc::new(RedisParkingLot::new(broker.connection()));
//!
//! let supervisor = Supervisor::new(broker, parking, Arc::new(PrometheusEmitter), config.supervisor_config());
//! let report = supervisor.run(shutdown_rx).await;
//! ```

mod backoff;
pub mod broker;
mod config;
mod consumer;
mod envelope;
mod error;
pub mod health;
pub mod metrics;
mod policy;
mod routing;
pub mod sink;
mod supervisor;
mod tracker;

#[cfg(test)]
mod testing;

// Re-export main types
pub use backoff::Backoff;
pub use broker::{Broker, Channel, Publisher, Readiness, RedisBroker, RedisBrokerConfig};
pub use config::{DaemonConfig, QueueConfig, SupervisorConfig, parse_queue_file, parse_queue_list};
pub use consumer::{ConsumerSettings, DlqConsumer};
pub use envelope::{
    DELIVERY_ATTEMPT_HEADER, Delivery, DlqMessage, Envelope, FIRST_SEEN_HEADER, Headers,
    OutboundMessage, REDELIVERED_FROM_HEADER,
};
pub use error::{
    BrokerError, ConsumerError, DecodeError, PublishError, RedeliveryError, SinkError,
};
pub use health::{HealthState, health_router};
pub use metrics::{DlqMetrics, MetricsEmitter, PrometheusEmitter, init_metrics};
pub use policy::{RedeliveryOutcome, RedeliveryPolicy};
pub use routing::{Destination, Route, RoutingTable};
pub use sink::{ParkReason, ParkedEntry, ParkingLot, ParkingStats, PermanentFailureSink, RedisParkingLot};
pub use supervisor::{ShutdownReport, Supervisor};
pub use tracker::{
    CircuitRegistry, CircuitReport, CircuitState, CircuitView, FailureSnapshot, FailureState,
    FailureTracker,
};
