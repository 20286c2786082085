use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A stored direct message. Its JSON form is also the broker payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: Uuid,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn from_new(new_message: NewMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: new_message.sender_id,
            receiver_id: new_message.receiver_id,
            content: new_message.content,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_uses_camel_case() {
        let record = MessageRecord::from_new(NewMessage {
            sender_id: "u1".into(),
            receiver_id: "u2".into(),
            content: "hi".into(),
        });

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["senderId"], "u1");
        assert_eq!(value["receiverId"], "u2");
        assert_eq!(value["content"], "hi");
        assert!(value.get("createdAt").is_some());

        let parsed: MessageRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, record);
    }
}
