use thiserror::Error;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;
pub type BrokerResult<T> = Result<T, BrokerError>;
pub type RelayResult<T> = Result<T, RelayError>;

/// Message store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("message store unavailable: {0}")]
    Unavailable(String),
}

/// Broker channel failures
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("no exchange '{0}'")]
    ExchangeNotFound(String),

    #[error("no queue '{0}'")]
    QueueNotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("queue '{queue}' already has an active consumer")]
    ConsumerAlreadyRegistered { queue: String },

    #[error("unknown delivery tag '{0}'")]
    UnknownDelivery(String),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("consumer task failed: {0}")]
    ConsumerTask(String),

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the message relay
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Stored but not handed to the broker
    #[error("message {message_id} was stored but could not be delivered")]
    DeliveryFailed { message_id: Uuid },
}

impl RelayError {
    /// HTTP status a transport layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::Validation(_) => 400,
            RelayError::Broker(BrokerError::ConsumerAlreadyRegistered { .. }) => 409,
            RelayError::Broker(_) | RelayError::DeliveryFailed { .. } => 502,
            RelayError::Persistence(_) => 500,
        }
    }
}

/// Startup configuration failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} missing")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
