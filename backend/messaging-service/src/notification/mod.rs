//! Live push channel to connected clients, keyed by user id.
//!
//! Best effort only: nothing is queued for users without a live connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

use crate::metrics;

/// Event pushed to a live connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: String,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

/// Sink for live notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Push `message` to every live connection of `user_id`, returning how
    /// many connections received it.
    async fn notify(&self, user_id: &str, message: &str) -> usize;
}

/// Sending half of a client connection; the transport owns the receiver.
#[derive(Debug, Clone)]
pub struct LiveConnection {
    id: Uuid,
    sender: UnboundedSender<Notification>,
}

impl LiveConnection {
    pub fn new() -> (Self, UnboundedReceiver<Notification>) {
        let (sender, receiver) = unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                sender,
            },
            receiver,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Rooms of live connections, one room per user id.
#[derive(Default, Clone)]
pub struct NotificationHub {
    rooms: Arc<DashMap<String, Vec<LiveConnection>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to `user_id`'s room. Joining twice is a no-op.
    pub fn join(&self, connection: &LiveConnection, user_id: &str) {
        let mut room = self.rooms.entry(user_id.to_string()).or_default();
        if room.iter().all(|c| c.id != connection.id) {
            room.push(connection.clone());
        }
        debug!(user_id, connection_id = %connection.id, "Connection joined room");
    }

    /// Remove a connection from every room it joined.
    pub fn disconnect(&self, connection_id: Uuid) {
        self.rooms.retain(|_, room| {
            room.retain(|c| c.id != connection_id);
            !room.is_empty()
        });
    }

    pub fn room_size(&self, user_id: &str) -> usize {
        self.rooms.get(user_id).map(|room| room.len()).unwrap_or(0)
    }

    /// Drop every connection; clients observe their channel closing.
    pub fn close_all(&self) {
        self.rooms.clear();
    }
}

#[async_trait]
impl Notifier for NotificationHub {
    async fn notify(&self, user_id: &str, message: &str) -> usize {
        let notification = Notification {
            user_id: user_id.to_string(),
            message: message.to_string(),
            sent_at: Utc::now(),
        };

        let delivered = match self.rooms.get_mut(user_id) {
            Some(mut room) => {
                room.retain(|c| c.sender.send(notification.clone()).is_ok());
                room.len()
            }
            None => 0,
        };

        if delivered == 0 {
            self.rooms.remove_if(user_id, |_, room| room.is_empty());
        }

        metrics::record_notification(delivered > 0);
        debug!(user_id, delivered, "Live notification pushed");
        delivered
    }
}
