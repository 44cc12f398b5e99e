use crate::{ConfigError, FromEnv, env_parse};

/// Redis connection settings
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Redis connection URL (e.g. "redis://127.0.0.1:6379")
    pub url: String,

    /// Connection attempts made at startup before giving up
    pub connect_attempts: u32,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_attempts: 5,
        }
    }
}

impl FromEnv for RedisConfig {
    /// Reads `REDIS_URL`, falling back to `REDIS_HOST` (no default),
    /// and `REDIS_CONNECT_ATTEMPTS` (default 5).
    fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("REDIS_URL")
            .or_else(|_| std::env::var("REDIS_HOST"))
            .map_err(|_| ConfigError::MissingEnvVar("REDIS_URL or REDIS_HOST".to_string()))?;

        Ok(Self {
            url,
            connect_attempts: env_parse("REDIS_CONNECT_ATTEMPTS", 5)?,
        })
    }
}
