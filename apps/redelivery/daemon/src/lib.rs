//! DLQ Redelivery Daemon
//!
//! Drains the configured dead-letter queues and republishes their messages
//! to the original exchange.
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream (<dlq_name>)
//!   ↓ (Consumer Group: redelivery)
//! DlqConsumer (one task per DLQ, restarted by the Supervisor)
//!   ↓ RedeliveryPolicy: circuit → retry ceiling → decode → routing
//!   ├─→ Redis Stream (<original_exchange>)   republished, then acked
//!   └─→ Redis Stream (<dlq_name>.parked)     parked, then acked
//! ```
//!
//! Health, metrics, circuit state and parking-lot admin are served on
//! `HEALTH_PORT`.

use axum::Router;
use core_config::{Environment, FromEnv, app_info};
use eyre::{Result, WrapErr};
use redelivery::{
    Backoff, DaemonConfig, HealthState, PrometheusEmitter, RedisBroker, RedisParkingLot,
    Supervisor, health_router, metrics,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Start the health and admin HTTP server
///
/// Stops accepting requests once `shutdown` flips.
async fn start_health_server(
    health_state: HealthState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health and admin server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Connect to Redis, retrying with backoff up to `REDIS_CONNECT_ATTEMPTS` times
async fn connect_with_retry(config: &DaemonConfig) -> Result<RedisBroker> {
    let attempts = config.redis.connect_attempts.max(1);
    let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(10))
        .with_max_attempts(attempts);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match RedisBroker::connect(&config.redis.url, config.broker_config()).await {
            Ok(broker) => return Ok(broker),
            Err(e) if backoff.exhausted(attempt) => {
                return Err(e).wrap_err_with(|| {
                    format!("Failed to connect to Redis after {attempt} attempts")
                });
            }
            Err(e) => {
                let delay = backoff.delay(attempt);
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Redis connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Run the redelivery daemon
///
/// 1. Sets up structured logging (JSON for prod, pretty for dev)
/// 2. Loads and validates the queue configuration
/// 3. Connects to Redis with retry logic
/// 4. Runs one consumer per DLQ until SIGINT/SIGTERM, then drains them
///
/// # Errors
///
/// Returns an error if the configuration is invalid, Redis stays
/// unreachable, or the metrics recorder cannot be installed.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting redelivery daemon");
    info!("Environment: {:?}", environment);

    let config = DaemonConfig::from_env().wrap_err("Failed to load redelivery configuration")?;
    for queue in &config.queues {
        info!(
            dlq_name = %queue.dlq_name,
            original_exchange = %queue.original_exchange,
            max_retries = queue.max_retries,
            failure_threshold = queue.failure_threshold,
            cooldown_secs = queue.cooldown_secs,
            prefetch_limit = queue.prefetch_limit,
            "DLQ configured"
        );
    }

    info!("Connecting to Redis...");
    let broker = Arc::new(connect_with_retry(&config).await?);
    info!("Connected to Redis successfully");

    let parking = Arc::new(RedisParkingLot::new(broker.connection()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let supervisor = Supervisor::new(
        broker.clone(),
        parking.clone(),
        Arc::new(PrometheusEmitter),
        config.supervisor_config(),
    );

    let health_state = HealthState::new(app_info, supervisor.circuits(), broker, parking);
    let health_shutdown = shutdown_rx.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port, health_shutdown).await {
            error!(error = %e, "Health server failed");
        }
    });

    let report = supervisor.run(shutdown_rx).await;
    if report.is_clean() {
        info!(stopped = ?report.stopped, "Redelivery daemon stopped");
    } else {
        warn!(
            stopped = ?report.stopped,
            abandoned = ?report.abandoned,
            "Redelivery daemon stopped; abandoned deliveries will be redelivered"
        );
    }

    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
