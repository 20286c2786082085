use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::models::{NewUser, User};

/// Lookup and creation of user credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Match on the exact username or the case-insensitive email.
    async fn find_by_username_or_email(&self, identifier: &str) -> AuthResult<Option<User>>;

    async fn find_by_id(&self, user_id: Uuid) -> AuthResult<Option<User>>;

    /// Insert a user; duplicate email or username yields [`AuthError::Conflict`].
    async fn create(&self, new_user: NewUser) -> AuthResult<User>;
}

/// `users` table backed credential store
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_username_or_email(&self, identifier: &str) -> AuthResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, created_at, updated_at
            FROM users
            WHERE username = $1 OR LOWER(email) = LOWER($1)
            LIMIT 1
            "#,
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn find_by_id(&self, user_id: Uuid) -> AuthResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn create(&self, new_user: NewUser) -> AuthResult<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, username, password_hash, created_at, updated_at)
            VALUES ($1, $2, $3, $4, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
            RETURNING id, username, email, password_hash, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new_user.email)
        .bind(&new_user.username)
        .bind(&new_user.password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db_err) if db_err.is_unique_violation() => {
                AuthError::Conflict("Email or username already registered".to_string())
            }
            _ => AuthError::Persistence(e.to_string()),
        })?;

        Ok(user)
    }
}
