use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::models::SessionRecord;

/// Persistence for refresh-token session records.
///
/// Implementations never retry internally; a failed write surfaces as
/// [`AuthError::Persistence`] and the caller decides what to do.
#[async_trait]
pub trait SessionLedger: Send + Sync {
    /// Create one record for a freshly minted token pair.
    async fn save(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> AuthResult<SessionRecord>;

    /// Most recently created record for the user, if any.
    async fn find_active_by_user(&self, user_id: &str) -> AuthResult<Option<SessionRecord>>;

    /// Delete the record. Unknown ids are reported as [`AuthError::NotFound`].
    async fn revoke(&self, session_id: Uuid) -> AuthResult<()>;
}

/// `sessions` table backed ledger
#[derive(Clone)]
pub struct PgSessionLedger {
    pool: PgPool,
}

impl PgSessionLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionLedger for PgSessionLedger {
    async fn save(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> AuthResult<SessionRecord> {
        let record = sqlx::query_as::<_, SessionRecord>(
            r#"
            INSERT INTO sessions (id, user_id, access_token, refresh_token, created_at, updated_at)
            VALUES ($1, $2, $3, $4, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
            RETURNING id, user_id, access_token, refresh_token, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(access_token)
        .bind(refresh_token)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AuthError::Persistence(format!("failed to save session: {}", e)))?;

        debug!(session_id = %record.id, user_id = %record.user_id, "Session record created");
        Ok(record)
    }

    async fn find_active_by_user(&self, user_id: &str) -> AuthResult<Option<SessionRecord>> {
        let record = sqlx::query_as::<_, SessionRecord>(
            r#"
            SELECT id, user_id, access_token, refresh_token, created_at, updated_at
            FROM sessions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn revoke(&self, session_id: Uuid) -> AuthResult<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM sessions WHERE id = $1
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AuthError::NotFound(format!("session {}", session_id)));
        }

        debug!(session_id = %session_id, "Session record deleted");
        Ok(())
    }
}
