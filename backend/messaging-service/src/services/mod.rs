pub mod message_relay;
pub mod message_store;

pub use message_relay::{
    LoggingHandler, MessageHandler, MessageRelay, SendReport, Subscription, NEW_MESSAGE_NOTICE,
};
pub use message_store::{InMemoryMessageStore, MessageStore, PgMessageStore};
