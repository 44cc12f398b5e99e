//! Runs one consumer task per DLQ and restarts them when they crash

use crate::backoff::Backoff;
use crate::broker::Broker;
use crate::config::SupervisorConfig;
use crate::consumer::{DlqConsumer, sleep_or_shutdown};
use crate::metrics::MetricsEmitter;
use crate::sink::PermanentFailureSink;
use crate::tracker::CircuitRegistry;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How the workers ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// DLQs whose worker exited on its own
    pub stopped: Vec<String>,
    /// DLQs whose worker was aborted after the grace period
    pub abandoned: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

pub struct Supervisor<B: Broker> {
    consumers: Vec<DlqConsumer<B>>,
    circuits: CircuitRegistry,
    shutdown_grace: Duration,
    restart: Backoff,
}

impl<B: Broker> Supervisor<B> {
    pub fn new(
        broker: Arc<B>,
        sink: Arc<dyn PermanentFailureSink>,
        metrics: Arc<dyn MetricsEmitter>,
        config: SupervisorConfig,
    ) -> Self {
        let consumers: Vec<_> = config
            .queues
            .iter()
            .map(|queue| {
                DlqConsumer::new(
                    queue,
                    Arc::clone(&broker),
                    Arc::clone(&sink),
                    Arc::clone(&metrics),
                    config.consumer.clone(),
                )
            })
            .collect();
        let circuits = CircuitRegistry::new(consumers.iter().map(DlqConsumer::circuit_view));

        Self {
            consumers,
            circuits,
            shutdown_grace: config.shutdown_grace,
            restart: config.restart,
        }
    }

    /// Circuit state of every DLQ, readable while the supervisor runs
    pub fn circuits(&self) -> CircuitRegistry {
        self.circuits.clone()
    }

    /// Run every consumer until `shutdown` flips to `true`.
    ///
    /// After the signal, workers get `shutdown_grace` to finish their
    /// current message; the rest are aborted and reported as abandoned.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ShutdownReport {
        let mut workers = JoinSet::new();
        let mut names = HashMap::new();

        info!(workers = self.consumers.len(), "Starting DLQ supervisor");

        for consumer in self.consumers {
            let name = consumer.dlq_name().to_string();
            let handle = workers.spawn(supervise(consumer, self.restart.clone(), shutdown.clone()));
            names.insert(handle.id(), name);
        }

        let mut report = ShutdownReport::default();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                joined = workers.join_next_with_id() => match joined {
                    Some(Ok((id, ()))) => {
                        if let Some(name) = names.remove(&id) {
                            report.stopped.push(name);
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "DLQ worker task failed");
                        names.remove(&e.id());
                    }
                    None => return report,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            grace_secs = self.shutdown_grace.as_secs(),
            "Shutdown signalled, draining DLQ workers"
        );

        let deadline = Instant::now() + self.shutdown_grace;
        loop {
            match tokio::time::timeout_at(deadline, workers.join_next_with_id()).await {
                Ok(Some(Ok((id, ())))) => {
                    if let Some(name) = names.remove(&id) {
                        report.stopped.push(name);
                    }
                }
                Ok(Some(Err(e))) => {
                    error!(error = %e, "DLQ worker task failed");
                    names.remove(&e.id());
                }
                Ok(None) => break,
                Err(_) => {
                    let mut abandoned: Vec<String> = names.drain().map(|(_, name)| name).collect();
                    abandoned.sort();
                    warn!(
                        abandoned = ?abandoned,
                        "Grace period elapsed, aborting DLQ workers"
                    );
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    report.abandoned = abandoned;
                    break;
                }
            }
        }

        info!(
            stopped = report.stopped.len(),
            abandoned = report.abandoned.len(),
            "DLQ supervisor stopped"
        );
        report
    }
}

/// Restart loop for one consumer; returns once it stops for shutdown
async fn supervise<B: Broker>(
    mut consumer: DlqConsumer<B>,
    restart: Backoff,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut restarts = 0u32;

    loop {
        let run = AssertUnwindSafe(consumer.start(shutdown.clone()))
            .catch_unwind()
            .await;

        match run {
            Ok(Ok(())) => break,
            Ok(Err(e)) => {
                error!(dlq_name = %consumer.dlq_name(), error = %e, "DLQ consumer failed");
            }
            Err(panic) => {
                error!(
                    dlq_name = %consumer.dlq_name(),
                    panic = %panic_message(panic.as_ref()),
                    "DLQ consumer panicked"
                );
            }
        }

        restarts = restarts.saturating_add(1);
        let delay = restart.delay(restarts);
        warn!(
            dlq_name = %consumer.dlq_name(),
            restarts,
            delay_ms = delay.as_millis() as u64,
            "Restarting DLQ consumer"
        );
        if !sleep_or_shutdown(&mut shutdown, Instant::now() + delay).await {
            break;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::consumer::ConsumerSettings;
    use crate::testing::{MemoryBroker, MemoryParkingLot, RecordingEmitter, envelope_body};

    fn config(queues: &[&str]) -> SupervisorConfig {
        SupervisorConfig {
            consumer: ConsumerSettings {
                reconnect: Backoff::new(Duration::from_millis(100), Duration::from_secs(1))
                    .with_max_attempts(3),
                ..ConsumerSettings::default()
            },
            shutdown_grace: Duration::from_secs(2),
            ..SupervisorConfig::new(
                queues
                    .iter()
                    .map(|dlq| QueueConfig::new(*dlq, "events"))
                    .collect(),
            )
        }
    }

    fn supervisor(broker: &Arc<MemoryBroker>, queues: &[&str]) -> Supervisor<MemoryBroker> {
        Supervisor::new(
            broker.clone(),
            Arc::new(MemoryParkingLot::default()),
            Arc::new(RecordingEmitter::default()),
            config(queues),
        )
    }

    async fn wait_for(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_worker_per_dlq() {
        let broker = Arc::new(MemoryBroker::new());
        broker.enqueue("a.dlq", envelope_body("game.created", "game.created"));
        broker.enqueue("b.dlq", envelope_body("game.created", "game.created"));

        let supervisor = supervisor(&broker, &["a.dlq", "b.dlq"]);
        let circuits = supervisor.circuits();
        assert_eq!(circuits.dlq_names().collect::<Vec<_>>(), vec!["a.dlq", "b.dlq"]);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(rx));

        wait_for("both acks", || broker.acks().len() == 2).await;
        assert_eq!(circuits.is_circuit_open("a.dlq"), Some(false));

        tx.send_replace(true);
        let mut report = task.await.unwrap();
        report.stopped.sort();
        assert_eq!(report.stopped, vec!["a.dlq", "b.dlq"]);
        assert!(report.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_worker_is_restarted() {
        let broker = Arc::new(MemoryBroker::new());
        broker.panic_on_opens(1);
        broker.enqueue("a.dlq", envelope_body("game.created", "game.created"));

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(supervisor(&broker, &["a.dlq"]).run(rx));

        wait_for("ack after restart", || broker.acks().len() == 1).await;
        assert_eq!(broker.opens(), 2);

        tx.send_replace(true);
        assert_eq!(task.await.unwrap().stopped, vec!["a.dlq"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_restarted_after_reconnects_exhausted() {
        let broker = Arc::new(MemoryBroker::new());
        broker.fail_opens(5);
        broker.enqueue("a.dlq", envelope_body("game.created", "game.created"));

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(supervisor(&broker, &["a.dlq"]).run(rx));

        wait_for("ack after restart", || broker.acks().len() == 1).await;
        // Three failed opens, a restart, two more failures, then success
        assert_eq!(broker.opens(), 6);

        tx.send_replace(true);
        assert!(task.await.unwrap().is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_does_not_affect_other_workers() {
        let broker = Arc::new(MemoryBroker::new());
        broker.panic_on_opens(1);
        for _ in 0..3 {
            broker.enqueue("a.dlq", envelope_body("game.created", "game.created"));
            broker.enqueue("b.dlq", envelope_body("game.created", "game.created"));
        }

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(supervisor(&broker, &["a.dlq", "b.dlq"]).run(rx));

        wait_for("all acks", || broker.acks().len() == 6).await;

        tx.send_replace(true);
        assert_eq!(task.await.unwrap().stopped.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_worker_abandoned_after_grace() {
        let broker = Arc::new(MemoryBroker::new());
        broker.stall_publishes();
        broker.enqueue("a.dlq", envelope_body("game.created", "game.created"));

        let mut config = config(&["a.dlq", "b.dlq"]);
        config.consumer.publish_timeout = Duration::from_secs(600);
        let supervisor = Supervisor::new(
            broker.clone(),
            Arc::new(MemoryParkingLot::default()),
            Arc::new(RecordingEmitter::default()),
            config,
        );

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(rx));

        wait_for("delivery taken", || broker.depth("a.dlq") == 0).await;
        let signalled = Instant::now();
        tx.send_replace(true);

        let report = task.await.unwrap();
        assert_eq!(report.stopped, vec!["b.dlq"]);
        assert_eq!(report.abandoned, vec!["a.dlq"]);
        assert!(Instant::now() >= signalled + Duration::from_secs(2));

        // Never settled, so the broker still owns it
        assert!(broker.acks().is_empty());
        assert!(broker.nacks().is_empty());
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(boxed.as_ref()), "kaboom");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
