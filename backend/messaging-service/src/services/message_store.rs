use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{MessageRecord, NewMessage};

/// Persistence for direct messages. Records are immutable once created.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a message, assigning its id and creation time.
    async fn create(&self, new_message: NewMessage) -> StoreResult<MessageRecord>;

    /// Messages addressed to `receiver_id`, oldest first.
    async fn find_by_receiver(&self, receiver_id: &str) -> StoreResult<Vec<MessageRecord>>;
}

/// `messages` table backed store
#[derive(Clone)]
pub struct PgMessageStore {
    db: Pool<Postgres>,
}

impl PgMessageStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create(&self, new_message: NewMessage) -> StoreResult<MessageRecord> {
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            INSERT INTO messages (id, sender_id, receiver_id, content, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            RETURNING id, sender_id, receiver_id, content, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new_message.sender_id)
        .bind(&new_message.receiver_id)
        .bind(&new_message.content)
        .fetch_one(&self.db)
        .await?;

        Ok(record)
    }

    async fn find_by_receiver(&self, receiver_id: &str) -> StoreResult<Vec<MessageRecord>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, sender_id, receiver_id, content, created_at
            FROM messages
            WHERE receiver_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(receiver_id)
        .fetch_all(&self.db)
        .await?;

        Ok(records)
    }
}

/// Store kept in process memory, in insertion order
#[derive(Default)]
pub struct InMemoryMessageStore {
    records: RwLock<Vec<MessageRecord>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create(&self, new_message: NewMessage) -> StoreResult<MessageRecord> {
        let record = MessageRecord::from_new(new_message);
        self.records.write().await.push(record.clone());
        Ok(record)
    }

    async fn find_by_receiver(&self, receiver_id: &str) -> StoreResult<Vec<MessageRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.receiver_id == receiver_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(sender: &str, receiver: &str, content: &str) -> NewMessage {
        NewMessage {
            sender_id: sender.into(),
            receiver_id: receiver.into(),
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn test_find_by_receiver_keeps_creation_order() {
        let store = InMemoryMessageStore::new();
        store.create(new_message("u1", "u2", "first")).await.unwrap();
        store.create(new_message("u3", "u1", "other")).await.unwrap();
        store.create(new_message("u1", "u2", "second")).await.unwrap();

        let inbox = store.find_by_receiver("u2").await.unwrap();
        let contents: Vec<&str> = inbox.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert_eq!(store.len().await, 3);
    }
}
