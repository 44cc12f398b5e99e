//! Daemon configuration
//!
//! Queues come from a JSON file (`REDELIVERY_CONFIG`) or inline JSON
//! (`REDELIVERY_QUEUES`); everything else from individual env vars.

use crate::backoff::Backoff;
use crate::broker::RedisBrokerConfig;
use crate::consumer::ConsumerSettings;
use crate::routing::RoutingTable;
use core_config::redis::RedisConfig;
use core_config::{ConfigError, FromEnv, env_or_default, env_parse};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// One DLQ to drain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub dlq_name: String,

    /// Exchange (stream) messages are republished to
    pub original_exchange: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    #[serde(default = "default_prefetch_limit")]
    pub prefetch_limit: u16,

    /// Routing key rewrites applied on republish
    #[serde(default)]
    pub routing_rewrites: BTreeMap<String, String>,

    /// Event types dropped instead of republished
    #[serde(default)]
    pub discard_event_types: Vec<String>,
}

fn default_max_retries() -> u32 {
    5
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_prefetch_limit() -> u16 {
    10
}

impl QueueConfig {
    pub fn new(dlq_name: impl Into<String>, original_exchange: impl Into<String>) -> Self {
        Self {
            dlq_name: dlq_name.into(),
            original_exchange: original_exchange.into(),
            max_retries: default_max_retries(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            prefetch_limit: default_prefetch_limit(),
            routing_rewrites: BTreeMap::new(),
            discard_event_types: Vec::new(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn routing_table(&self) -> RoutingTable {
        RoutingTable::new(&self.original_exchange)
            .with_rewrites(self.routing_rewrites.clone())
            .with_discard(self.discard_event_types.iter().cloned())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dlq_name.trim().is_empty() {
            return Err(ConfigError::Invalid("dlq_name must not be empty".into()));
        }
        if self.original_exchange.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{}: original_exchange must not be empty",
                self.dlq_name
            )));
        }
        if self.failure_threshold < 1 {
            return Err(ConfigError::Invalid(format!(
                "{}: failure_threshold must be at least 1",
                self.dlq_name
            )));
        }
        if self.prefetch_limit < 1 {
            return Err(ConfigError::Invalid(format!(
                "{}: prefetch_limit must be at least 1",
                self.dlq_name
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct QueueFile {
    queues: Vec<QueueConfig>,
}

/// Parse a queue file: `{ "queues": [...] }`
pub fn parse_queue_file(raw: &str) -> Result<Vec<QueueConfig>, ConfigError> {
    serde_json::from_str::<QueueFile>(raw)
        .map(|file| file.queues)
        .map_err(|e| ConfigError::ParseError {
            key: "REDELIVERY_CONFIG".into(),
            details: e.to_string(),
        })
}

/// Parse an inline queue list: `[...]`
pub fn parse_queue_list(raw: &str) -> Result<Vec<QueueConfig>, ConfigError> {
    serde_json::from_str(raw).map_err(|e| ConfigError::ParseError {
        key: "REDELIVERY_QUEUES".into(),
        details: e.to_string(),
    })
}

/// Everything the supervisor needs to run its consumers
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub queues: Vec<QueueConfig>,
    pub consumer: ConsumerSettings,
    /// How long workers get to finish after the shutdown signal
    pub shutdown_grace: Duration,
    /// Backoff between worker restarts
    pub restart: Backoff,
}

impl SupervisorConfig {
    pub fn new(queues: Vec<QueueConfig>) -> Self {
        Self {
            queues,
            consumer: ConsumerSettings::default(),
            shutdown_grace: Duration::from_secs(30),
            restart: Backoff::default(),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub queues: Vec<QueueConfig>,
    pub redis: RedisConfig,
    pub consumer_group: String,
    /// Defaults to `redelivery-<pid>`
    pub consumer_name: Option<String>,
    pub poll_interval: Duration,
    pub claim_idle_time: Duration,
    pub publish_timeout: Duration,
    pub min_replicas: u32,
    pub reconnect_attempts: u32,
    pub depth_sample_interval: Duration,
    pub shutdown_grace: Duration,
    pub health_port: u16,
}

impl DaemonConfig {
    pub fn new(queues: Vec<QueueConfig>, redis: RedisConfig) -> Self {
        Self {
            queues,
            redis,
            consumer_group: "redelivery".to_string(),
            consumer_name: None,
            poll_interval: Duration::from_millis(1000),
            claim_idle_time: Duration::from_secs(30),
            publish_timeout: Duration::from_millis(5000),
            min_replicas: 0,
            reconnect_attempts: 10,
            depth_sample_interval: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(30),
            health_port: 8090,
        }
    }

    /// At least one queue, unique names, and every queue valid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::Invalid("no queues configured".into()));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            queue.validate()?;
            if !seen.insert(queue.dlq_name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate dlq_name '{}'",
                    queue.dlq_name
                )));
            }
        }

        if self.reconnect_attempts < 1 {
            return Err(ConfigError::Invalid(
                "REDELIVERY_RECONNECT_ATTEMPTS must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn broker_config(&self) -> RedisBrokerConfig {
        let defaults = RedisBrokerConfig::default();
        RedisBrokerConfig {
            consumer_group: self.consumer_group.clone(),
            consumer_name: self
                .consumer_name
                .clone()
                .unwrap_or(defaults.consumer_name.clone()),
            poll_interval: self.poll_interval,
            claim_idle_time: self.claim_idle_time,
            min_replicas: self.min_replicas,
            replica_timeout: self.publish_timeout,
            ..defaults
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            queues: self.queues.clone(),
            consumer: ConsumerSettings {
                reconnect: Backoff::default().with_max_attempts(self.reconnect_attempts),
                depth_sample_interval: self.depth_sample_interval,
                publish_timeout: self.publish_timeout,
                ..ConsumerSettings::default()
            },
            shutdown_grace: self.shutdown_grace,
            restart: Backoff::default(),
        }
    }
}

fn load_queues() -> Result<Vec<QueueConfig>, ConfigError> {
    if let Ok(path) = std::env::var("REDELIVERY_CONFIG") {
        let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::ParseError {
            key: "REDELIVERY_CONFIG".into(),
            details: format!("{path}: {e}"),
        })?;
        return parse_queue_file(&raw);
    }

    if let Ok(raw) = std::env::var("REDELIVERY_QUEUES") {
        return parse_queue_list(&raw);
    }

    Err(ConfigError::MissingEnvVar(
        "REDELIVERY_CONFIG or REDELIVERY_QUEUES".into(),
    ))
}

impl FromEnv for DaemonConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            queues: load_queues()?,
            redis: RedisConfig::from_env()?,
            consumer_group: env_or_default("REDELIVERY_CONSUMER_GROUP", "redelivery"),
            consumer_name: std::env::var("REDELIVERY_CONSUMER_NAME")
                .ok()
                .filter(|name| !name.is_empty()),
            poll_interval: Duration::from_millis(env_parse("REDELIVERY_POLL_INTERVAL_MS", 1000)?),
            claim_idle_time: Duration::from_millis(env_parse(
                "REDELIVERY_CLAIM_IDLE_MS",
                30_000,
            )?),
            publish_timeout: Duration::from_millis(env_parse(
                "REDELIVERY_PUBLISH_TIMEOUT_MS",
                5000,
            )?),
            min_replicas: env_parse("REDELIVERY_MIN_REPLICAS", 0)?,
            reconnect_attempts: env_parse("REDELIVERY_RECONNECT_ATTEMPTS", 10)?,
            depth_sample_interval: Duration::from_secs(env_parse(
                "REDELIVERY_DEPTH_SAMPLE_SECS",
                15,
            )?),
            shutdown_grace: Duration::from_secs(env_parse("SHUTDOWN_GRACE_SECS", 30)?),
            health_port: env_parse("HEALTH_PORT", 8090)?,
        };
        config.validate()?;
        Ok(config)
    }
}
