//! Prometheus metrics for the redelivery daemon
//!
//! The consumer reports through [`MetricsEmitter`]; [`PrometheusEmitter`]
//! forwards to the `metrics` facade, which `/metrics` renders for scraping.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

pub const MESSAGES_PROCESSED: &str = "messages_processed_total";
pub const MESSAGES_FAILED: &str = "messages_failed_total";
pub const MESSAGES_PARKED: &str = "messages_parked_total";
pub const DLQ_DEPTH: &str = "dlq_depth";
pub const CONSECUTIVE_FAILURES: &str = "consecutive_failures";
pub const CIRCUIT_OPEN: &str = "circuit_open";
pub const PROCESSING_DURATION: &str = "processing_duration";

const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Install the Prometheus recorder
///
/// Call this once at startup. Subsequent calls return the same handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(PROCESSING_DURATION.to_string()), DURATION_BUCKETS)?
            .install_recorder()?;
        describe();
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

fn describe() {
    describe_counter!(MESSAGES_PROCESSED, "DLQ messages handled without a failure");
    describe_counter!(MESSAGES_FAILED, "DLQ messages that failed a redelivery attempt");
    describe_counter!(MESSAGES_PARKED, "DLQ messages moved to the parking lot");
    describe_gauge!(DLQ_DEPTH, "Messages waiting in the DLQ");
    describe_gauge!(CONSECUTIVE_FAILURES, "Consecutive redelivery failures");
    describe_gauge!(CIRCUIT_OPEN, "1 while redelivery for the DLQ is suspended");
    describe_histogram!(PROCESSING_DURATION, Unit::Seconds, "Time to handle one DLQ message");
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Sink for the daemon's metrics
pub trait MetricsEmitter: Send + Sync {
    fn message_processed(&self, dlq_name: &str, event_type: &str);
    fn message_failed(&self, dlq_name: &str, error_type: &str);
    fn message_parked(&self, dlq_name: &str, reason: &str);
    fn dlq_depth(&self, dlq_name: &str, depth: u64);
    fn consecutive_failures(&self, dlq_name: &str, count: u32);
    fn circuit_open(&self, dlq_name: &str, open: bool);
    fn processing_duration(&self, dlq_name: &str, duration: Duration);
}

/// Emitter backed by the `metrics` facade
#[derive(Debug, Clone, Default)]
pub struct PrometheusEmitter;

impl MetricsEmitter for PrometheusEmitter {
    fn message_processed(&self, dlq_name: &str, event_type: &str) {
        counter!(
            MESSAGES_PROCESSED,
            "dlq_name" => dlq_name.to_string(),
            "event_type" => event_type.to_string()
        )
        .increment(1);
    }

    fn message_failed(&self, dlq_name: &str, error_type: &str) {
        counter!(
            MESSAGES_FAILED,
            "dlq_name" => dlq_name.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);
    }

    fn message_parked(&self, dlq_name: &str, reason: &str) {
        counter!(
            MESSAGES_PARKED,
            "dlq_name" => dlq_name.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    fn dlq_depth(&self, dlq_name: &str, depth: u64) {
        gauge!(DLQ_DEPTH, "dlq_name" => dlq_name.to_string()).set(depth as f64);
    }

    fn consecutive_failures(&self, dlq_name: &str, count: u32) {
        gauge!(CONSECUTIVE_FAILURES, "dlq_name" => dlq_name.to_string()).set(f64::from(count));
    }

    fn circuit_open(&self, dlq_name: &str, open: bool) {
        gauge!(CIRCUIT_OPEN, "dlq_name" => dlq_name.to_string()).set(if open { 1.0 } else { 0.0 });
    }

    fn processing_duration(&self, dlq_name: &str, duration: Duration) {
        histogram!(PROCESSING_DURATION, "dlq_name" => dlq_name.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Emitter bound to one DLQ
#[derive(Clone)]
pub struct DlqMetrics {
    dlq_name: String,
    emitter: Arc<dyn MetricsEmitter>,
}

impl DlqMetrics {
    pub fn new(dlq_name: impl Into<String>, emitter: Arc<dyn MetricsEmitter>) -> Self {
        Self {
            dlq_name: dlq_name.into(),
            emitter,
        }
    }

    pub fn processed(&self, event_type: &str) {
        self.emitter.message_processed(&self.dlq_name, event_type);
    }

    pub fn failed(&self, error_type: &str) {
        self.emitter.message_failed(&self.dlq_name, error_type);
    }

    pub fn parked(&self, reason: &str) {
        self.emitter.message_parked(&self.dlq_name, reason);
    }

    pub fn depth(&self, depth: u64) {
        self.emitter.dlq_depth(&self.dlq_name, depth);
    }

    /// Publish the tracker gauges
    pub fn failure_state(&self, consecutive_failures: u32, circuit_open: bool) {
        self.emitter
            .consecutive_failures(&self.dlq_name, consecutive_failures);
        self.emitter.circuit_open(&self.dlq_name, circuit_open);
    }

    pub fn duration(&self, duration: Duration) {
        self.emitter.processing_duration(&self.dlq_name, duration);
    }
}
