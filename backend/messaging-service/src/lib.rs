//! Messaging service: durable per-recipient delivery over a broker channel
//! plus a live notification channel.
//!
//! [`MessageRelay`] is the entry point. It persists through a
//! [`MessageStore`], publishes through the process-wide [`BrokerHandle`] and
//! pushes notices through a [`Notifier`].

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod notification;
pub mod services;

pub use broker::{Broker, BrokerConfig, BrokerHandle, Consumer, Delivery, MemoryBroker, RedisBroker};
pub use error::{BrokerError, RelayError, RelayResult, StoreError};
pub use models::{MessageRecord, NewMessage};
pub use notification::{LiveConnection, Notification, NotificationHub, Notifier};
pub use services::{
    InMemoryMessageStore, LoggingHandler, MessageHandler, MessageRelay, MessageStore,
    PgMessageStore, SendReport, Subscription, NEW_MESSAGE_NOTICE,
};
