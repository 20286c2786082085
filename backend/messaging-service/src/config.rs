use dotenvy::dotenv;
use std::env;
use std::str::FromStr;

use crate::broker::BrokerConfig;
use crate::error::ConfigError;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    Redis,
    Memory,
}

impl FromStr for BrokerBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(BrokerBackend::Redis),
            "memory" => Ok(BrokerBackend::Memory),
            _ => Err(ConfigError::Invalid {
                key: "BROKER_BACKEND",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(ConfigError::Invalid {
                key: "MESSAGE_STORE_BACKEND",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: String,
    pub broker_backend: BrokerBackend,
    pub store_backend: StoreBackend,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        let broker_backend = env::var("BROKER_BACKEND")
            .map(|v| v.parse::<BrokerBackend>())
            .unwrap_or(Ok(BrokerBackend::Redis))?;
        let store_backend = env::var("MESSAGE_STORE_BACKEND")
            .map(|v| v.parse::<StoreBackend>())
            .unwrap_or(Ok(StoreBackend::Postgres))?;

        let database_url = env::var("DATABASE_URL").ok();
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.into());
        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        Ok(Self {
            database_url,
            database_max_connections,
            redis_url,
            broker_backend,
            store_backend,
        })
    }

    pub fn broker_config(&self) -> BrokerConfig {
        match self.broker_backend {
            BrokerBackend::Redis => BrokerConfig::Redis {
                url: self.redis_url.clone(),
            },
            BrokerBackend::Memory => BrokerConfig::Memory,
        }
    }
}
