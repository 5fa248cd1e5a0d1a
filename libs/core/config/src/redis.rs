use crate::{ConfigError, FromEnv, env_required};

/// Redis configuration
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub uri: String,
}

impl RedisConfig {
    pub fn new(uri: String) -> Self {
        Self { uri }
    }
}

impl FromEnv for RedisConfig {
    /// Reads `REDIS_URL`, falling back to `REDIS_HOST` (no default)
    fn from_env() -> Result<Self, ConfigError> {
        let uri = std::env::var("REDIS_URL")
            .or_else(|_| env_required("REDIS_HOST"))
            .map_err(|_| ConfigError::MissingEnvVar("REDIS_URL or REDIS_HOST".to_string()))?;

        Ok(Self { uri })
    }
}
