//! In-process adapters for local development and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CredentialStore, SessionLedger};
use crate::error::{AuthError, AuthResult};
use crate::models::{NewUser, SessionRecord, User};

/// Session ledger kept in insertion order, so the last match is the newest.
#[derive(Default)]
pub struct InMemorySessionLedger {
    records: RwLock<Vec<SessionRecord>>,
}

impl InMemorySessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// All records for a user, oldest first.
    pub async fn records_for(&self, user_id: &str) -> Vec<SessionRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SessionLedger for InMemorySessionLedger {
    async fn save(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> AuthResult<SessionRecord> {
        let mut records = self.records.write().await;

        let duplicate = records.iter().any(|r| {
            r.access_token == access_token || r.refresh_token == refresh_token
        });
        if duplicate {
            return Err(AuthError::Persistence(
                "duplicate key value violates unique constraint on sessions".to_string(),
            ));
        }

        let record = SessionRecord::new(user_id, access_token, refresh_token);
        records.push(record.clone());
        Ok(record)
    }

    async fn find_active_by_user(&self, user_id: &str) -> AuthResult<Option<SessionRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.user_id == user_id)
            .cloned())
    }

    async fn revoke(&self, session_id: Uuid) -> AuthResult<()> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.id != session_id);

        if records.len() == before {
            return Err(AuthError::NotFound(format!("session {}", session_id)));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a user, returning whether it existed.
    pub async fn remove(&self, user_id: Uuid) -> bool {
        self.users.write().await.remove(&user_id).is_some()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find_by_username_or_email(&self, identifier: &str) -> AuthResult<Option<User>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.username == identifier || u.email.eq_ignore_ascii_case(identifier))
            .cloned())
    }

    async fn find_by_id(&self, user_id: Uuid) -> AuthResult<Option<User>> {
        Ok(self.users.read().await.get(&user_id).cloned())
    }

    async fn create(&self, new_user: NewUser) -> AuthResult<User> {
        let mut users = self.users.write().await;

        let taken = users.values().any(|u| {
            u.username == new_user.username || u.email.eq_ignore_ascii_case(&new_user.email)
        });
        if taken {
            return Err(AuthError::Conflict(
                "Email or username already registered".to_string(),
            ));
        }

        let user = User::from_new(new_user);
        users.insert(user.id, user.clone());
        Ok(user)
    }
}
